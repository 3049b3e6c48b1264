//! A minimal, deliberately bare-bones [`Connector`]/[`SmtpClient`] pair: dials
//! a next-hop over plain TCP and drives a single MAIL/RCPT*/DATA transaction.
//!
//! The actual wire protocol (EHLO negotiation, STARTTLS, pipelining, MX
//! lookups) is out of scope for this crate; this connector exists so the
//! daemon has something real to dial with out of the box. A deployment that
//! needs TLS or MX-aware routing swaps in its own `Connector` impl; nothing
//! downstream of `relay-client` cares which one it's talking to.

use std::time::Duration;

use async_trait::async_trait;
use futures::{
    io::{BufReader, WriteHalf},
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt,
};
use relay_client::{ConnectError, Connector, EnvelopeError, EnvelopeStatus, OutboundEnvelope, SmtpClient};
use relay_types::{Address, ReplyCode};
use smol::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

pub struct DirectConnector {
    pub ehlo_name: String,
}

#[async_trait]
impl Connector for DirectConnector {
    type Connection = DirectClient;

    async fn connect(&self, address: &Address) -> Result<DirectClient, ConnectError> {
        let target = format!("{}:{}", address.host, address.port);
        let connect = TcpStream::connect(&target);
        let stream = match smol::future::or(
            async { Ok(connect.await) },
            async {
                smol::Timer::after(CONNECT_TIMEOUT).await;
                Err(())
            },
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectError::Io(address.clone(), e.to_string())),
            Err(()) => return Err(ConnectError::TimedOut(address.clone())),
        };

        let (reader, writer) = stream.split();
        let mut client = DirectClient {
            peer: address.clone(),
            reader: BufReader::new(reader),
            writer,
        };

        client.read_reply().await.map_err(|e| ConnectError::Io(address.clone(), e))?;
        client
            .command(&format!("EHLO {}\r\n", self.ehlo_name))
            .await
            .map_err(|e| ConnectError::Io(address.clone(), e))?;
        Ok(client)
    }
}

pub struct DirectClient {
    peer: Address,
    reader: BufReader<futures::io::ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
}

impl DirectClient {
    async fn read_reply(&mut self) -> Result<ReplyCode, String> {
        let mut code = None;
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let read = smol::future::or(
                async { Ok(self.reader.read_line(&mut line).await) },
                async {
                    smol::Timer::after(COMMAND_TIMEOUT).await;
                    Err(())
                },
            )
            .await;
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.to_string()),
                Err(()) => return Err("timed out waiting for a reply".to_owned()),
            };
            if n == 0 {
                return Err("connection closed by peer".to_owned());
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 4 {
                return Err(format!("malformed reply line: {:?}", line));
            }
            let this_code: u16 = line[..3].parse().map_err(|_| format!("malformed reply code: {:?}", line))?;
            code.get_or_insert(this_code);
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&line[4..]);
            if line.as_bytes()[3] == b' ' {
                break;
            }
        }
        Ok(ReplyCode::new(code.expect("at least one reply line was read"), text))
    }

    async fn command(&mut self, line: &str) -> Result<ReplyCode, String> {
        debug!(peer = %self.peer, command = line.trim_end(), "sending command");
        self.writer.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
        self.read_reply().await
    }
}

#[async_trait]
impl SmtpClient for DirectClient {
    async fn send_envelope(&mut self, envelope: &OutboundEnvelope<'_>) -> EnvelopeStatus {
        match self.send_envelope_inner(envelope).await {
            Ok(status) => status,
            Err(e) => EnvelopeStatus::Error(EnvelopeError::NoRecipients(
                envelope
                    .recipients
                    .iter()
                    .map(|r| (r.clone(), ReplyCode::new(451, e.clone())))
                    .collect(),
            )),
        }
    }

    fn peer(&self) -> &Address {
        &self.peer
    }
}

impl DirectClient {
    async fn send_envelope_inner(&mut self, envelope: &OutboundEnvelope<'_>) -> Result<EnvelopeStatus, String> {
        let from = envelope.sender.map(|s| s.as_str()).unwrap_or("");
        let mut mail_line = format!("MAIL FROM:<{}>", from);
        for arg in envelope.sender_args {
            mail_line.push(' ');
            mail_line.push_str(arg);
        }
        mail_line.push_str("\r\n");
        let mail_reply = self.command(&mail_line).await?;
        if !matches!(mail_reply.kind(), relay_types::ReplyCodeKind::PositiveCompletion) {
            return Ok(EnvelopeStatus::Error(EnvelopeError::RejectedSender(mail_reply)));
        }

        let mut rejected = Vec::new();
        let mut accepted = Vec::new();
        for recipient in envelope.recipients {
            let reply = self.command(&format!("RCPT TO:<{}>\r\n", recipient.as_str())).await?;
            if matches!(reply.kind(), relay_types::ReplyCodeKind::PositiveCompletion) {
                accepted.push(recipient.clone());
            } else {
                rejected.push((recipient.clone(), reply));
            }
        }

        if accepted.is_empty() {
            return Ok(EnvelopeStatus::Error(EnvelopeError::NoRecipients(rejected)));
        }

        let data_reply = self.command("DATA\r\n").await?;
        if !matches!(data_reply.kind(), relay_types::ReplyCodeKind::PositiveCompletion) {
            return Ok(EnvelopeStatus::Error(EnvelopeError::RejectedBody(data_reply, rejected)));
        }

        let mut body = Vec::new();
        for line in envelope.body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.starts_with(b".") {
                body.push(b'.');
            }
            body.extend_from_slice(line);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b".\r\n");
        self.writer.write_all(&body).await.map_err(|e| e.to_string())?;
        let final_reply = self.read_reply().await?;
        if !matches!(final_reply.kind(), relay_types::ReplyCodeKind::PositiveCompletion) {
            return Ok(EnvelopeStatus::Error(EnvelopeError::RejectedBody(final_reply, rejected)));
        }

        Ok(EnvelopeStatus::Ok {
            message_id: final_reply.text,
            rejected_recipients: rejected,
        })
    }
}
