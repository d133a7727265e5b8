//! The non-blocking multi-transfer primitive the client drives.
//!
//! A [`Transport`] owns any number of registered transfers and progresses all of
//! them with a single [`Transport::drive_once`] call. It never blocks: bytes flow
//! out through push style [`ByteSink`]s and uploads are pulled from an
//! [`UploadSource`] whose send side can be paused with a [`TransferControl`].
//!
//! [`H1Transport`] is the bundled implementation.
mod codec;
mod connector;
mod h1;
mod pool;

use std::{
    cell::{Cell, RefCell},
    fmt::{self, Display},
    future::Future,
    path::PathBuf,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use bytes::Bytes;
pub use connector::{
    Connected, Connector, ConnectorExt, Endpoint, HttpConnector, MaybeTlsStream, TcpConnector,
    TlsConnector, TlsStream, UnixConnector,
};
pub use h1::H1Transport;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
pub use pool::{ConnectionPool, Pooled};

pub use crate::fifo::Pull;
use crate::{
    config::HttpVersionPref,
    error::{FifoError, TransportError},
};

/// Poll interval suggested when a transport has no better idea.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(100);

/// Handle of a transfer registered with a [`Transport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Push style byte consumer fed by the transport.
pub trait ByteSink {
    /// Consume `data`, returning how much was taken. Anything short of
    /// `data.len()` aborts the transfer with [`TransportError::WriteAborted`].
    fn write(&mut self, data: &[u8]) -> usize;
}

impl ByteSink for Vec<u8> {
    #[inline]
    fn write(&mut self, data: &[u8]) -> usize {
        self.extend_from_slice(data);
        data.len()
    }
}

/// Pull style byte producer for uploads.
///
/// [`Pull::Pending`] means no data yet; the transport pauses its send side until
/// [`TransferControl::continue_send`] is called.
pub trait UploadSource {
    fn pull(&mut self, max: usize) -> Pull;

    /// Called once the transport has sent all it will. Reports data the
    /// producer queued that will never be sent.
    fn close(&mut self) -> Result<(), FifoError> {
        Ok(())
    }
}

#[derive(Default)]
struct ControlInner {
    send_paused: Cell<bool>,
    pauses: Cell<u64>,
    waker: RefCell<Option<Waker>>,
}

/// Shared pause/continue switch of a transfer's send side.
#[derive(Clone, Default)]
pub struct TransferControl {
    inner: Rc<ControlInner>,
}

impl TransferControl {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause_send(&self) {
        if !self.inner.send_paused.replace(true) {
            self.inner.pauses.set(self.inner.pauses.get() + 1);
        }
    }

    pub fn continue_send(&self) {
        if self.inner.send_paused.replace(false) {
            if let Some(waker) = self.inner.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    #[inline]
    pub fn is_send_paused(&self) -> bool {
        self.inner.send_paused.get()
    }

    #[inline]
    pub fn pause_count(&self) -> u64 {
        self.inner.pauses.get()
    }

    /// Resolves once the send side is not paused.
    pub fn wait_send(&self) -> WaitSend<'_> {
        WaitSend { control: self }
    }

    pub fn poll_send(&self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.inner.send_paused.get() {
            return Poll::Ready(());
        }
        *self.inner.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl fmt::Debug for TransferControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferControl, send paused: {}", self.is_send_paused())
    }
}

/// Future returned by [`TransferControl::wait_send`].
pub struct WaitSend<'a> {
    control: &'a TransferControl,
}

impl Future for WaitSend<'_> {
    type Output = ();

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.control.poll_send(cx)
    }
}

/// Transfer progress counters. Totals are 0 while unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub download_total: u64,
    pub download_now: u64,
    pub upload_total: u64,
    pub upload_now: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTiming {
    pub namelookup: Duration,
    pub connect: Duration,
    pub appconnect: Duration,
    pub pretransfer: Duration,
    pub starttransfer: Duration,
    pub redirect: Duration,
    pub total: Duration,
}

/// What a transport reports about a successful transfer.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub status: StatusCode,
    pub version: Version,
    pub effective_uri: Uri,
    pub effective_method: Method,
    pub redirect_count: u32,
    pub num_connects: u32,
    pub header_size: u64,
    pub request_size: u64,
    pub upload_size: u64,
    pub download_size: u64,
    pub timing: TransferTiming,
}

impl TransferInfo {
    pub fn new(status: StatusCode, uri: Uri, method: Method) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            effective_uri: uri,
            effective_method: method,
            redirect_count: 0,
            num_connects: 0,
            header_size: 0,
            request_size: 0,
            upload_size: 0,
            download_size: 0,
            timing: TransferTiming::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub max_redirects: Option<u32>,
    pub http_version: HttpVersionPref,
    /// Never take a connection from the idle pool.
    pub fresh_connect: bool,
    /// Never return the connection to the idle pool.
    pub forbid_reuse: bool,
    pub unix_socket: Option<PathBuf>,
}

pub enum TransferBody {
    Empty,
    Full(Bytes),
    Source {
        source: Box<dyn UploadSource>,
        length: Option<u64>,
    },
}

impl TransferBody {
    #[inline]
    pub fn is_replayable(&self) -> bool {
        !matches!(self, TransferBody::Source { .. })
    }
}

impl fmt::Debug for TransferBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferBody::Empty => write!(f, "Empty"),
            TransferBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            TransferBody::Source { length, .. } => write!(f, "Source(length: {length:?})"),
        }
    }
}

/// Everything a transport needs to run one exchange.
pub struct TransferSpec {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: TransferBody,
    pub options: TransferOptions,
    pub header_sink: Box<dyn ByteSink>,
    pub body_sink: Box<dyn ByteSink>,
    pub control: TransferControl,
}

impl fmt::Debug for TransferSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferSpec, {} {} {:?}", self.method, self.uri, self.body)
    }
}

/// A non-blocking multiplexer of HTTP transfers.
pub trait Transport {
    /// Register a transfer. Nothing happens until the next [`Self::drive_once`].
    fn add(&mut self, spec: TransferSpec) -> Result<TransferId, TransportError>;

    /// Deregister a transfer, dropping its sinks, source and connection.
    fn remove(&mut self, id: TransferId) -> bool;

    /// Progress every registered transfer without blocking. Returns the number of
    /// transfers still running.
    fn drive_once(&mut self) -> usize;

    fn is_running(&self, id: TransferId) -> bool;

    /// Whether the transfer has work to do right now.
    fn is_ready(&self, id: TransferId) -> bool;

    fn progress(&self, id: TransferId) -> Option<Progress>;

    /// Completion result of a finished transfer. Yields it once.
    fn take_completed(&mut self, id: TransferId) -> Option<Result<TransferInfo, TransportError>>;

    #[inline]
    fn suggested_delay(&self) -> Duration {
        DEFAULT_POLL_DELAY
    }

    /// Native wait primitive: resolves when some transfer has work to do. The
    /// default never resolves, leaving the caller on its poll interval.
    #[inline]
    fn poll_wakeup(&mut self, _cx: &mut Context<'_>) -> Poll<()> {
        Poll::Pending
    }

    /// Number of registered transfers.
    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
