use std::time::Duration;

use thiserror::Error as ThisError;

use crate::{fifo::ChannelKey, response::Response};

/// Errors a [`ResponseFuture`](crate::ResponseFuture) can be rejected with.
///
/// Every failure of a single exchange is turned into exactly one of these at the
/// transaction boundary. Other in-flight exchanges are never affected.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unable to register transfer: {0}")]
    TransportInit(#[source] TransportError),
    #[error("request timed out{}", .0.map(|d| format!(" after {:.3} seconds", d.as_secs_f64())).unwrap_or_default())]
    Timeout(Option<Duration>),
    #[error("{message} ({code})")]
    Connection { code: i32, message: String },
    #[error("response body size of {received} bytes exceeds maximum of {limit} bytes")]
    Overflow { received: u64, limit: usize },
    #[error("request cancelled")]
    Cancelled,
    #[error("HTTP status code {} ({})", .0.status().as_u16(), .0.reason())]
    HttpStatus(Box<Response>),
    #[error("fifo error {0}")]
    Fifo(#[from] FifoError),
}

impl Error {
    /// Native transport error code, when the failure came from the transport.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Connection { code, .. } => Some(*code),
            Error::TransportInit(e) => Some(e.code()),
            Error::Timeout(_) => Some(TransportError::Timeout.code()),
            _ => None,
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The full response carried by an [`Error::HttpStatus`].
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::HttpStatus(response) => Some(response),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by a [`Transport`](crate::transport::Transport).
///
/// Each variant maps onto a stable numeric code so callers can keep diagnosing
/// failures the way they would with libcurl.
#[derive(ThisError, Debug)]
pub enum TransportError {
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),
    #[error("could not resolve host {0}")]
    Resolve(String),
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),
    #[error("tls error {0}")]
    Tls(#[from] monoio_rustls::TlsError),
    #[error("invalid dns name {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),
    #[error("failed sending data to the peer: {0}")]
    Send(#[source] std::io::Error),
    #[error("failure when receiving data from the peer: {0}")]
    Recv(#[source] std::io::Error),
    #[error("weird server reply: {0}")]
    Protocol(String),
    #[error("failure writing output to destination")]
    WriteAborted,
    #[error("operation aborted by upload source")]
    ReadAborted,
    #[error("operation timed out")]
    Timeout,
    #[error("maximum ({0}) redirects followed")]
    TooManyRedirects(u32),
    #[error("upload source {0}")]
    Upload(#[from] FifoError),
    #[error("transfer capacity exhausted")]
    Exhausted,
    #[error("transfer completion missing")]
    MissingCompletion,
}

impl TransportError {
    /// libcurl compatible error number.
    pub fn code(&self) -> i32 {
        match self {
            TransportError::UnsupportedUrl(_) => 1,
            TransportError::Resolve(_) => 6,
            TransportError::Connect(_) => 7,
            TransportError::Protocol(_) => 8,
            TransportError::WriteAborted => 23,
            TransportError::ReadAborted | TransportError::Upload(_) => 26,
            TransportError::Exhausted => 27,
            TransportError::Timeout => 28,
            TransportError::InvalidDnsName(_) => 6,
            TransportError::Tls(_) => 35,
            TransportError::TooManyRedirects(_) => 47,
            TransportError::Send(_) => 55,
            TransportError::Recv(_) => 56,
            TransportError::MissingCompletion => 43,
        }
    }
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum FifoError {
    #[error("fifo {key} closed with {pending} bytes unread")]
    ClosedWithData { key: ChannelKey, pending: u64 },
    #[error("unknown fifo channel {0}")]
    UnknownChannel(ChannelKey),
}
