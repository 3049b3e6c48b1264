mod address;
mod id;
mod record;
mod status;

pub use address::{Address, EmailAddress, InvalidEmailAddress, ReplyCode, ReplyCodeKind};
pub use id::{EnvelopeId, IdGenerator, MessageId, MessageIdCounter};
pub use record::{
    EnvelopeInfo, FlowId, Flows, InvariantViolation, MessageRecord, RelayAttempt, RelayError,
    RetryIntervals,
};
pub use status::{Queue, Status};
