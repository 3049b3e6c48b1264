use relay_types::Address;

/// Failure to establish a connection to a next-hop [`Address`].
///
/// Kept deliberately small: the actual dialing (DNS, TCP, STARTTLS
/// negotiation) is a collaborator's concern (see [`crate::cache::Connector`]);
/// this type only needs to carry enough to classify the failure for logging
/// and to feed [`relay_types::RelayError::Connection`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connecting to {0}: {1}")]
    Io(Address, String),
    #[error("connecting to {0}: timed out")]
    TimedOut(Address),
    #[error("connecting to {0}: {1}")]
    Other(Address, String),
}

impl ConnectError {
    pub fn address(&self) -> &Address {
        match self {
            ConnectError::Io(a, _) | ConnectError::TimedOut(a) | ConnectError::Other(a, _) => a,
        }
    }
}
