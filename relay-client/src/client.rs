use async_trait::async_trait;
use relay_types::{Address, EmailAddress, ReplyCode};

/// The outbound half of an envelope, as handed to a [`SmtpClient`] once a
/// connection candidate is in hand. Distinct from
/// [`relay_types::EnvelopeInfo`]: that one is the record kept in the spool,
/// this one is what actually gets sent on the wire, body included.
pub struct OutboundEnvelope<'a> {
    pub sender: Option<&'a EmailAddress>,
    pub sender_args: &'a [String],
    pub recipients: &'a [EmailAddress],
    pub body: &'a [u8],
}

/// Outcome of handing a whole envelope to an open connection: either every
/// recipient the server still had a say in was classified, or the
/// conversation broke down before recipients could be told apart (no
/// recipients accepted at all, or the sender/body itself was rejected).
#[derive(Clone, Debug)]
pub enum EnvelopeStatus {
    Ok {
        message_id: String,
        rejected_recipients: Vec<(EmailAddress, ReplyCode)>,
    },
    Error(EnvelopeError),
}

/// Ways a whole-envelope send can fail outright, each carrying the reply
/// codes observed so the retry scheduler (`relay-spool`) can partition
/// recipients by permanence, mirroring §4.3/§6.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("no recipients were accepted: {0:?}")]
    NoRecipients(Vec<(EmailAddress, ReplyCode)>),
    #[error("sender rejected: {0}")]
    RejectedSender(ReplyCode),
    #[error("sender and all recipients rejected: {0}")]
    RejectedSenderAndRecipients(ReplyCode, Vec<(EmailAddress, ReplyCode)>),
    #[error("message body rejected: {0}")]
    RejectedBody(ReplyCode, Vec<(EmailAddress, ReplyCode)>),
}

/// The collaborator a delivery attempt talks to once it holds an open
/// connection: send one envelope, get back a per-recipient verdict.
///
/// Implementations own the actual wire conversation (EHLO, MAIL FROM, RCPT
/// TO, DATA, ...); that codec is out of scope here, this trait is only the
/// seam the delivery loop programs against.
#[async_trait]
pub trait SmtpClient: Send {
    async fn send_envelope(&mut self, envelope: &OutboundEnvelope<'_>) -> EnvelopeStatus;

    /// The next-hop this client is currently talking to, for logging.
    fn peer(&self) -> &Address;
}
