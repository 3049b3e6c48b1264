mod control;
mod delivery;
mod events;
mod record_ops;
mod recovery;
mod scheduler;
mod storage;

pub use control::{ControlSurface, SpoolStatus};
pub use delivery::DeliveryEngine;
pub use events::{Event, EventBus, Subscription, HEARTBEAT_INTERVAL};
pub use record_ops::{enqueue, freeze, map_email, mark_for_send_now, recover_entry, remove};
pub use recovery::recover_sending_entries;
pub use scheduler::{schedule, DeliveryOutcome, ScheduleResult};
pub use storage::{Entry, EntryStat, Mutation, SpoolError, Storage};
