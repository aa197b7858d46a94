//! IMAP client.
//!
//! Thin session wrapper over async-imap exposing exactly the commands the
//! pipeline needs: SELECT, UID SEARCH, UID FETCH (envelope + body), UID
//! STORE (to clear the seen flag), APPEND and LOGOUT. Components open their
//! own session per tick and always log out at the end.

use async_imap::types::Fetch;
use async_imap::Session;
use async_native_tls::TlsConnector;
use futures_util::StreamExt;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::MailCredentials;

use super::error::{EmailError, Result};

/// Type alias for the underlying async stream.
type AsyncTcpStream = async_io::Async<std::net::TcpStream>;

/// Type alias for the TLS stream used by the IMAP session.
type TlsStream = async_native_tls::TlsStream<AsyncTcpStream>;

/// Server-side message text for the concurrent connection limit. Gmail caps
/// at 15 simultaneous sessions.
const ERR_TOO_MANY_CONNECTIONS: &str = "Too many simultaneous connections";

/// State of a selected mailbox.
#[derive(Debug, Clone, Copy)]
pub struct SelectedMailbox {
    /// Opaque validity token; when it changes, previously seen uids are
    /// invalid and messages are re-admitted under new composite ids.
    pub uid_validity: u32,
    /// Number of messages in the mailbox.
    pub exists: u32,
}

/// A fetched message, materialized out of the fetch stream.
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    pub uid: u32,
    pub subject: String,
    pub message_id: String,
    pub from: Vec<String>,
    pub reply_to: Vec<String>,
    pub to: Vec<String>,
    pub body: Option<Vec<u8>>,
}

impl FetchedMessage {
    /// True when the message was sent by the scanner itself, judged by the
    /// envelope having the scanner address as its sole From entry.
    pub fn is_self_originated(&self, scanner_address: &str) -> bool {
        self.from.len() == 1 && self.from[0] == scanner_address
    }

    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(|b| !b.is_empty())
    }

    fn first(addresses: &[String]) -> String {
        addresses.first().cloned().unwrap_or_default()
    }

    pub fn from_address(&self) -> String {
        Self::first(&self.from)
    }

    pub fn reply_to_address(&self) -> String {
        Self::first(&self.reply_to)
    }

    pub fn to_address(&self) -> String {
        Self::first(&self.to)
    }
}

/// An authenticated IMAP session.
pub struct ImapClient {
    session: Session<TlsStream>,
}

impl ImapClient {
    /// Connects to the server and authenticates. A refusal because of the
    /// server's connection limit surfaces as
    /// [`EmailError::TooManyConnections`].
    pub async fn connect(credentials: &MailCredentials) -> Result<Self> {
        let addr = &credentials.address;
        debug!("Connecting to IMAP server at {}", addr);

        let host = addr
            .split(':')
            .next()
            .ok_or_else(|| EmailError::ConnectionFailed(format!("invalid address '{}'", addr)))?;

        // Establish the TCP connection with std::net and wrap it with
        // async-io before handing it to the TLS connector.
        let std_stream = std::net::TcpStream::connect(addr)
            .map_err(|e| EmailError::ConnectionFailed(e.to_string()))?;
        std_stream
            .set_nonblocking(true)
            .map_err(|e| EmailError::ConnectionFailed(e.to_string()))?;
        let tcp_stream = async_io::Async::new(std_stream)
            .map_err(|e| EmailError::ConnectionFailed(e.to_string()))?;

        let tls = TlsConnector::new();
        let tls_stream = tls.connect(host, tcp_stream).await?;

        let client = async_imap::Client::new(tls_stream);
        let session = client
            .login(
                &credentials.username,
                credentials.password.expose_secret(),
            )
            .await
            .map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.contains(ERR_TOO_MANY_CONNECTIONS) {
                    EmailError::TooManyConnections
                } else {
                    EmailError::AuthenticationFailed(msg)
                }
            })?;

        Ok(Self { session })
    }

    /// Selects the given mailbox and returns its state. Selection happens on
    /// every tick because the validity token may change between ticks.
    pub async fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox> {
        let mailbox_status = self.session.select(mailbox).await?;
        let uid_validity = mailbox_status
            .uid_validity
            .ok_or_else(|| EmailError::Protocol("server did not provide UIDVALIDITY".into()))?;
        Ok(SelectedMailbox {
            uid_validity,
            exists: mailbox_status.exists,
        })
    }

    /// Lists all message uids in the selected mailbox, ascending.
    pub async fn list_uids(&mut self) -> Result<Vec<u32>> {
        let uids = self.session.uid_search("ALL").await?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Fetches envelope and full body of a single message by uid.
    pub async fn fetch_message(&mut self, uid: u32) -> Result<FetchedMessage> {
        let mut fetched = Vec::new();
        {
            let mut stream = self
                .session
                .uid_fetch(uid.to_string(), "(UID ENVELOPE BODY[])")
                .await?;
            while let Some(item) = stream.next().await {
                fetched.push(item?);
            }
        }
        let fetch = fetched
            .first()
            .ok_or_else(|| EmailError::Protocol(format!("message with uid {} not found", uid)))?;
        Ok(materialize(uid, fetch))
    }

    /// Removes the `\Seen` flag from the given messages so unread counts
    /// stay meaningful for human operators. Servers that cannot parse the
    /// store command are tolerated.
    pub async fn unsee(&mut self, uids: &[u32]) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let uid_set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let res = async {
            let mut stream = self
                .session
                .uid_store(&uid_set, "-FLAGS.SILENT (\\Seen)")
                .await?;
            while let Some(item) = stream.next().await {
                item?;
            }
            Ok::<(), EmailError>(())
        }
        .await;

        match res {
            Ok(()) => {
                debug!("Successfully unseen {} messages", uids.len());
                Ok(())
            }
            Err(e) if e.to_string().contains("Could not parse command") => {
                warn!("server rejected unsee command (tolerated): {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Appends a raw message into the given mailbox.
    pub async fn append(&mut self, mailbox: &str, content: &[u8]) -> Result<()> {
        self.session.append(mailbox, None, None, content).await?;
        Ok(())
    }

    /// Logs out and drops the session.
    pub async fn logout(mut self) -> Result<()> {
        self.session.logout().await?;
        Ok(())
    }
}

/// Materializes a fetch response into an owned [`FetchedMessage`].
fn materialize(uid: u32, fetch: &Fetch) -> FetchedMessage {
    let mut msg = FetchedMessage {
        uid: fetch.uid.unwrap_or(uid),
        body: fetch.body().map(|b| b.to_vec()),
        ..Default::default()
    };

    if let Some(envelope) = fetch.envelope() {
        msg.subject = envelope
            .subject
            .as_ref()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        msg.message_id = envelope
            .message_id
            .as_ref()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        msg.from = addresses(&envelope.from);
        msg.reply_to = addresses(&envelope.reply_to);
        msg.to = addresses(&envelope.to);
    }

    msg
}

/// Renders envelope addresses as `mailbox@host` strings.
fn addresses(list: &Option<Vec<async_imap::imap_proto::Address<'_>>>) -> Vec<String> {
    list.as_ref()
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|addr| {
                    let mailbox = addr.mailbox.as_ref()?;
                    let host = addr.host.as_ref()?;
                    Some(format!(
                        "{}@{}",
                        String::from_utf8_lossy(mailbox),
                        String::from_utf8_lossy(host)
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_self_originated() {
        let mut msg = FetchedMessage {
            from: vec!["abuse-scanner@siasky.net".to_string()],
            ..Default::default()
        };
        assert!(msg.is_self_originated("abuse-scanner@siasky.net"));

        msg.from.push("other@example.com".to_string());
        assert!(!msg.is_self_originated("abuse-scanner@siasky.net"));

        msg.from = vec!["reporter@example.com".to_string()];
        assert!(!msg.is_self_originated("abuse-scanner@siasky.net"));

        msg.from.clear();
        assert!(!msg.is_self_originated("abuse-scanner@siasky.net"));
    }

    #[test]
    fn test_has_body() {
        let mut msg = FetchedMessage::default();
        assert!(!msg.has_body());
        msg.body = Some(Vec::new());
        assert!(!msg.has_body());
        msg.body = Some(b"hello".to_vec());
        assert!(msg.has_body());
    }

    #[test]
    fn test_address_accessors_default_to_empty() {
        let msg = FetchedMessage::default();
        assert_eq!(msg.from_address(), "");
        assert_eq!(msg.reply_to_address(), "");
        assert_eq!(msg.to_address(), "");
    }
}
