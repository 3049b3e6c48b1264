//! Wire types for the spool's control surface (§6): one request/response
//! pair per `ControlSurface` operation, plus the `Event` stream payload
//! re-exported as-is since it is already plain serializable data.
//!
//! Deliberately not capnp: these calls are infrequent, operator-driven,
//! and don't need schema evolution across a compiled plugin boundary the
//! way the front-end's policy hooks do. A request/response pair per RPC,
//! serialized however the transport likes (JSON over a Unix socket, a line
//! protocol, whatever the binary crate wires up), is enough.

use relay_spool::SpoolStatus;
use relay_types::{MessageId, RetryIntervals};

pub use relay_spool::Event;

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct FreezeRequest {
    pub ids: Vec<MessageId>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct SendRequest {
    pub retry_intervals: RetryIntervals,
    pub ids: Vec<MessageId>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RemoveRequest {
    pub ids: Vec<MessageId>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RecoverRequest {
    pub ids: Vec<MessageId>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct SetMaxConcurrentSendJobsRequest {
    pub n: usize,
}

/// Outcome of a batch operation for a single id. `error` is `None` on
/// success; on failure it's the `Display` form of the underlying
/// [`relay_spool::SpoolError`], since that type's `io::Error` payload
/// doesn't round-trip through serde itself.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct IdResult {
    pub id: MessageId,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct BatchResponse {
    pub results: Vec<IdResult>,
}

impl BatchResponse {
    pub fn from_results(ids: &[MessageId], results: Vec<Result<(), relay_spool::SpoolError>>) -> BatchResponse {
        let results = ids
            .iter()
            .cloned()
            .zip(results)
            .map(|(id, result)| IdResult { id, error: result.err().map(|e| e.to_string()) })
            .collect();
        BatchResponse { results }
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct QueueStatus {
    pub queue: String,
    pub size: usize,
    pub oldest_entry_age_secs: Option<i64>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct StatusResponse {
    pub queues: Vec<QueueStatus>,
}

impl From<&SpoolStatus> for StatusResponse {
    fn from(status: &SpoolStatus) -> StatusResponse {
        let mut queues: Vec<QueueStatus> = status
            .queue_sizes
            .iter()
            .map(|(queue, size)| QueueStatus {
                queue: queue.dir_name().to_owned(),
                size: *size,
                oldest_entry_age_secs: status.oldest_entry_age.get(queue).map(|d| d.num_seconds()),
            })
            .collect();
        queues.sort_by(|a, b| a.queue.cmp(&b.queue));
        StatusResponse { queues }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn batch_response_pairs_ids_with_their_own_result() {
        let gen = relay_types::IdGenerator::new();
        let envelope_id = gen.next_envelope_id();
        let a = relay_types::MessageId::new(&envelope_id, 0);
        let b = relay_types::MessageId::new(&envelope_id, 1);
        let ids = vec![a.clone(), b.clone()];
        let results = vec![Ok(()), Err(relay_spool::SpoolError::Locked)];

        let response = BatchResponse::from_results(&ids, results);
        assert_eq!(response.results[0].id, a);
        assert!(response.results[0].error.is_none());
        assert_eq!(response.results[1].id, b);
        assert!(response.results[1].error.is_some());
    }

    #[test]
    fn status_response_carries_oldest_age_only_for_nonempty_queues() {
        let mut queue_sizes = HashMap::new();
        queue_sizes.insert(relay_types::Queue::Active, 3);
        queue_sizes.insert(relay_types::Queue::Frozen, 0);
        let mut oldest_entry_age = HashMap::new();
        oldest_entry_age.insert(relay_types::Queue::Active, chrono::Duration::seconds(42));
        let status = SpoolStatus { queue_sizes, oldest_entry_age };

        let response = StatusResponse::from(&status);
        let active = response.queues.iter().find(|q| q.queue == "active").unwrap();
        assert_eq!(active.oldest_entry_age_secs, Some(42));
        let frozen = response.queues.iter().find(|q| q.queue == "frozen").unwrap();
        assert_eq!(frozen.oldest_entry_age_secs, None);
    }
}
