mod cache;
mod client;
mod error;

pub use cache::{ClientCache, Connector, WithConnectionOutcome};
pub use client::{EnvelopeError, EnvelopeStatus, OutboundEnvelope, SmtpClient};
pub use error::ConnectError;
