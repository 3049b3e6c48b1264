use chrono::{DateTime, Utc};

/// Per-message lifecycle state (§3 of the design).
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Status {
    /// Eligible for a delivery attempt immediately.
    SendNow,
    /// Eligible once wall clock reaches `t`.
    SendAt(DateTime<Utc>),
    /// A delivery attempt is in progress.
    Sending,
    /// Will not be attempted until an operator intervenes.
    Frozen,
    /// Tombstone; kept for audit, never delivered.
    Removed,
    /// Held aside (e.g. malformed); never delivered. Carries a
    /// human-readable reason, surfaced by `status`/`recover`.
    Quarantined(String),
    /// Terminal: the on-disk entry has been unlinked.
    Delivered,
}

impl Status {
    /// Read the status as it should be observed *right now*: `SendAt(t)`
    /// with `t <= now` reads back as `SendNow`. The on-disk value is left
    /// untouched by this; callers that want the downgrade persisted must
    /// write it back explicitly (the delivery loop's tick does this).
    pub fn effective(&self, now: DateTime<Utc>) -> Status {
        match self {
            Status::SendAt(t) if *t <= now => Status::SendNow,
            other => other.clone(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.effective(now), Status::SendNow)
    }

    pub fn queue(&self) -> Option<Queue> {
        match self {
            Status::SendNow | Status::SendAt(_) | Status::Sending => Some(Queue::Active),
            Status::Frozen => Some(Queue::Frozen),
            Status::Removed => Some(Queue::Removed),
            Status::Quarantined(_) => Some(Queue::Quarantine),
            Status::Delivered => None,
        }
    }
}

/// The on-disk sub-queue a record lives in, derived from [`Status`]. The
/// directory name equals [`Queue::dir_name`]; this mapping is authoritative
/// (invariant 1, §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Queue {
    Active,
    Frozen,
    Removed,
    Quarantine,
}

impl Queue {
    pub const ALL: [Queue; 4] = [Queue::Active, Queue::Frozen, Queue::Removed, Queue::Quarantine];

    pub fn dir_name(self) -> &'static str {
        match self {
            Queue::Active => "active",
            Queue::Frozen => "frozen",
            Queue::Removed => "removed",
            Queue::Quarantine => "quarantine",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn send_at_downgrades_once_due() {
        let now = Utc::now();
        let past = Status::SendAt(now - Duration::seconds(1));
        let future = Status::SendAt(now + Duration::seconds(60));
        assert_eq!(past.effective(now), Status::SendNow);
        assert_eq!(future.effective(now), future);
        assert!(past.is_due(now));
        assert!(!future.is_due(now));
    }

    #[test]
    fn queue_mapping_matches_directory_names() {
        assert_eq!(Status::SendNow.queue().unwrap().dir_name(), "active");
        assert_eq!(Status::Sending.queue().unwrap().dir_name(), "active");
        assert_eq!(Status::Frozen.queue().unwrap().dir_name(), "frozen");
        assert_eq!(Status::Removed.queue().unwrap().dir_name(), "removed");
        assert_eq!(
            Status::Quarantined("bad MIME".into()).queue().unwrap().dir_name(),
            "quarantine"
        );
        assert_eq!(Status::Delivered.queue(), None);
    }
}
