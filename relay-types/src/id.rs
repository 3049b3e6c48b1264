use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

/// Half-millisecond slot width used to guarantee `EnvelopeId` uniqueness:
/// generation blocks until the next slot if called twice within one.
const SLOT: std::time::Duration = std::time::Duration::from_micros(500);

/// Unique identifier for an accepted envelope.
///
/// Formed from wall-clock time, process id and a sub-millisecond counter,
/// base64-url encoded. See [`IdGenerator::next_envelope_id`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Deserialize, serde::Serialize)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for a single message within an envelope: `"<envelope_id>-<counter>"`.
///
/// A single accepted envelope may yield multiple messages, one per distinct
/// next-hop group; `counter` disambiguates them.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(envelope_id: &EnvelopeId, counter: u32) -> MessageId {
        let encoded = URL_SAFE_NO_PAD.encode(counter.to_be_bytes());
        MessageId(format!("{}-{}", envelope_id.0, encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back a message id from its on-disk filename form. Used by the
    /// filesystem spool to turn directory entries back into ids without
    /// re-deriving them from a record.
    pub fn from_filename(name: &str) -> Option<MessageId> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return None;
        }
        Some(MessageId(name.to_owned()))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates process-unique, time-derived [`EnvelopeId`]s and, for a given
/// envelope, monotonic [`MessageId`]s.
///
/// This is deliberately not a singleton: the binary owns one instance and
/// threads it explicitly to whatever enqueues envelopes, following this
/// workspace's preference for explicit collaborators over global state.
pub struct IdGenerator {
    pid: u32,
    last_slot_start: std::sync::Mutex<SystemTime>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::new()
    }
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        IdGenerator {
            pid: std::process::id(),
            last_slot_start: std::sync::Mutex::new(UNIX_EPOCH),
        }
    }

    /// Generate a fresh [`EnvelopeId`], blocking (via a short busy-wait) until
    /// the next half-millisecond slot if the previous id was minted in the
    /// same slot, so that two ids are never equal.
    pub fn next_envelope_id(&self) -> EnvelopeId {
        let mut last = self.last_slot_start.lock().expect("id generator mutex poisoned");
        let mut now = SystemTime::now();
        loop {
            let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
            let slot_start = UNIX_EPOCH + SLOT * ((since_epoch.as_micros() / 500) as u32);
            if slot_start > *last {
                *last = slot_start;
                break;
            }
            std::thread::yield_now();
            now = SystemTime::now();
        }
        let micros = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_micros();
        EnvelopeId(format!(
            "{}-{}",
            URL_SAFE_NO_PAD.encode(micros.to_be_bytes()),
            URL_SAFE_NO_PAD.encode(self.pid.to_be_bytes())
        ))
    }
}

/// Per-envelope monotonic counter used to mint [`MessageId`]s for the
/// messages an envelope is split into (one per distinct next-hop group).
#[derive(Debug, Default)]
pub struct MessageIdCounter(AtomicU32);

impl MessageIdCounter {
    pub fn new() -> MessageIdCounter {
        MessageIdCounter(AtomicU32::new(0))
    }

    pub fn next(&self, envelope_id: &EnvelopeId) -> MessageId {
        let counter = self.0.fetch_add(1, Ordering::Relaxed);
        MessageId::new(envelope_id, counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ids_are_unique() {
        let gen = IdGenerator::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..200 {
            assert!(ids.insert(gen.next_envelope_id()));
        }
    }

    #[test]
    fn message_ids_share_envelope_prefix_and_are_distinct() {
        let gen = IdGenerator::new();
        let envelope_id = gen.next_envelope_id();
        let counter = MessageIdCounter::new();
        let a = counter.next(&envelope_id);
        let b = counter.next(&envelope_id);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(envelope_id.as_str()));
        assert!(b.as_str().starts_with(envelope_id.as_str()));
    }

    #[test]
    fn message_id_counter_is_encoded_as_six_chars_and_never_truncated() {
        let gen = IdGenerator::new();
        let envelope_id = gen.next_envelope_id();
        let a = MessageId::new(&envelope_id, 0);
        let b = MessageId::new(&envelope_id, 1 << 24);
        let suffix = |id: &MessageId| id.as_str().rsplit('-').next().unwrap().to_owned();
        assert_eq!(suffix(&a).len(), 6);
        assert_eq!(suffix(&b).len(), 6);
        assert_ne!(a, b, "counters differing above bit 23 must not alias");
    }

    #[test]
    fn message_id_from_filename_rejects_traversal() {
        assert!(MessageId::from_filename("../etc/passwd").is_none());
        assert!(MessageId::from_filename("a/b").is_none());
        assert!(MessageId::from_filename("ok-id").is_some());
    }
}
