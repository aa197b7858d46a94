//! Email stage error types.

use thiserror::Error;

/// Errors that can occur in the mail-facing pipeline stages.
#[derive(Error, Debug)]
pub enum EmailError {
    /// Failed to connect to the IMAP server.
    #[error("IMAP connection failed: {0}")]
    ConnectionFailed(String),

    /// The server refused the connection because of its concurrent
    /// connection limit. Expected under multi-host operation; callers treat
    /// it as a soft skip.
    #[error("too many simultaneous connections")]
    TooManyConnections,

    /// TLS error during connection.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// IMAP protocol error.
    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    /// The email record has no body to parse.
    #[error("empty body")]
    EmptyBody,

    /// The body could not be decoded as a MIME message.
    #[error("failed to parse email: {0}")]
    Mime(String),

    /// An address did not parse into a mailbox.
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// A reply message could not be built.
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),

    /// The SMTP transport failed.
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// The block stage produced a different number of outcomes than there
    /// are skylinks; upstream data is corrupt and the stage must not
    /// complete.
    #[error("block result not defined for every skylink, {actual} != {expected}")]
    BlockResultMismatch { expected: usize, actual: usize },
}

impl From<async_imap::error::Error> for EmailError {
    fn from(err: async_imap::error::Error) -> Self {
        EmailError::Protocol(err.to_string())
    }
}

impl From<async_native_tls::Error> for EmailError {
    fn from(err: async_native_tls::Error) -> Self {
        EmailError::Tls(err.to_string())
    }
}

/// Result type for email operations.
pub type Result<T> = std::result::Result<T, EmailError>;
