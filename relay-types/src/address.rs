use std::fmt;

/// A downstream SMTP next-hop: `(host, port)`.
///
/// Equivalent to the outbound client library's `Destination`, but owned and
/// serializable so it can sit in an on-disk message record.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Address {
        Address {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An RFC 5321 mailbox, kept opaque: the MIME/address parser is out of scope
/// for this crate, so this is a thin validated wrapper rather than a full
/// grammar, mirroring how the envelope info only needs to compare, hash and
/// round-trip addresses, never parse their internal structure.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct EmailAddress(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid email address: {0:?}")]
pub struct InvalidEmailAddress(String);

impl EmailAddress {
    pub fn parse(raw: impl Into<String>) -> Result<EmailAddress, InvalidEmailAddress> {
        let raw = raw.into();
        if raw.is_empty() || raw.contains(char::is_whitespace) || !raw.contains('@') {
            return Err(InvalidEmailAddress(raw));
        }
        Ok(EmailAddress(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of an SMTP reply code, used to tell permanent failures (5xx) apart
/// from transient ones (4xx).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositiveCompletion,
    TransientNegative,
    PermanentNegative,
}

/// A three-digit SMTP reply code plus its free-text line, e.g. `550 Mailbox
/// unavailable`.
///
/// This is the collaborator type the retry scheduler (§4.3 of the design)
/// classifies via [`ReplyCode::kind`]; parsing the code out of the wire
/// protocol itself is the out-of-scope SMTP client codec's job; this type
/// simply carries the already-parsed result across the `send_envelope`
/// contract.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ReplyCode {
    pub code: u16,
    pub text: String,
}

impl ReplyCode {
    pub fn new(code: u16, text: impl Into<String>) -> ReplyCode {
        ReplyCode {
            code,
            text: text.into(),
        }
    }

    pub fn kind(&self) -> ReplyCodeKind {
        match self.code / 100 {
            2 | 3 => ReplyCodeKind::PositiveCompletion,
            4 => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }

    /// 5xx (and anything else unexpected) = permanent, 4xx = temporary: an
    /// out-of-range code is treated as a hard failure rather than retried
    /// forever.
    pub fn is_permanent(&self) -> bool {
        self.kind() == ReplyCodeKind::PermanentNegative
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display() {
        assert_eq!(Address::new("mx.example.com", 25).to_string(), "mx.example.com:25");
    }

    #[test]
    fn email_address_rejects_junk() {
        assert!(EmailAddress::parse("not-an-email").is_err());
        assert!(EmailAddress::parse("").is_err());
        assert!(EmailAddress::parse("a b@c.com").is_err());
        assert!(EmailAddress::parse("b@y.com").is_ok());
    }

    #[test]
    fn reply_code_permanence() {
        assert!(ReplyCode::new(550, "no such user").is_permanent());
        assert!(!ReplyCode::new(451, "try again").is_permanent());
        assert!(!ReplyCode::new(250, "ok").is_permanent());
    }
}
