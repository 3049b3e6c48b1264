use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use relay_types::{Queue, Status};
use tracing::info;

use crate::storage::{Mutation, Storage};

/// Startup recovery (§4.7): any `Active`-queue entry still marked `Sending`
/// was interrupted mid-delivery by the previous process's exit and is
/// rewritten back to `Send_now`. Entries in other queues are left alone.
pub async fn recover_sending_entries<S: Storage>(storage: &S) -> Result<u64, crate::storage::SpoolError> {
    let entries = storage.list(Queue::Active).await?;
    let mut recovered = 0u64;
    for entry in entries {
        let give_up = Instant::now() + Duration::from_secs(5);
        let id = entry.id.clone();
        let did_recover = Arc::new(AtomicBool::new(false));
        let did_recover_inner = did_recover.clone();
        let outcome = storage
            .with_entry(
                &entry,
                None,
                give_up,
                Box::new(move |record| {
                    if record.status == Status::Sending {
                        did_recover_inner.store(true, Ordering::Relaxed);
                        let mut r = record;
                        r.status = Status::SendNow;
                        Mutation::Save(r)
                    } else {
                        Mutation::Keep
                    }
                }),
            )
            .await;
        match outcome {
            Ok(()) => {
                if did_recover.load(Ordering::Relaxed) {
                    recovered += 1;
                }
            }
            Err(e) => info!(message_id = %id, error = %e, "skipped entry during recovery"),
        }
    }
    Ok(recovered)
}
