//! One in-flight exchange and everything it owns.
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use http::{Method, Uri};
use local_sync::{mpsc::unbounded, oneshot};

use crate::{
    config::Config,
    error::{Error, Result, TransportError},
    response::{self, BodyStream, Response, ResponseBody},
    transport::{ByteSink, Progress, TransferControl, TransferId, TransferInfo},
    upload::UploadBridge,
};

/// Where an exchange is, as far as its progress counters tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    #[default]
    Connecting,
    Uploading,
    Downloading,
    Done,
}

impl TransferStatus {
    pub fn classify(progress: &Progress) -> Self {
        if progress.download_now > 0 || progress.download_total > 0 {
            if progress.download_now >= progress.download_total {
                TransferStatus::Done
            } else {
                TransferStatus::Downloading
            }
        } else if progress.upload_now > 0 {
            TransferStatus::Uploading
        } else {
            TransferStatus::Connecting
        }
    }
}

struct BufferedBody {
    data: BytesMut,
    limit: usize,
    overflow: Option<u64>,
}

struct BufferedSink(Rc<RefCell<BufferedBody>>);

impl ByteSink for BufferedSink {
    fn write(&mut self, data: &[u8]) -> usize {
        let mut body = self.0.borrow_mut();
        if body.overflow.is_some() {
            return 0;
        }
        let received = body.data.len() + data.len();
        if received > body.limit {
            body.overflow = Some(received as u64);
            return 0;
        }
        body.data.extend_from_slice(data);
        data.len()
    }
}

struct StreamState {
    tx: RefCell<Option<unbounded::Tx<Result<Bytes>>>>,
    started: Cell<bool>,
}

impl StreamState {
    fn finish(&self, error: Option<Error>) {
        if let Some(tx) = self.tx.borrow_mut().take() {
            if let Some(error) = error {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct StreamSink(Rc<StreamState>);

impl ByteSink for StreamSink {
    fn write(&mut self, data: &[u8]) -> usize {
        let tx = self.0.tx.borrow();
        let Some(tx) = tx.as_ref() else {
            return 0;
        };
        if data.is_empty() {
            return 0;
        }
        // Stop the download once nobody listens anymore.
        if tx.send(Ok(Bytes::copy_from_slice(data))).is_err() {
            return 0;
        }
        self.0.started.set(true);
        data.len()
    }
}

struct HeaderSink(Rc<RefCell<BytesMut>>);

impl ByteSink for HeaderSink {
    #[inline]
    fn write(&mut self, data: &[u8]) -> usize {
        self.0.borrow_mut().extend_from_slice(data);
        data.len()
    }
}

enum BodyCollector {
    Buffered(Rc<RefCell<BufferedBody>>),
    Stream {
        state: Rc<StreamState>,
        rx: Option<unbounded::Rx<Result<Bytes>>>,
    },
}

/// Per exchange settings copied out of the client [`Config`].
#[derive(Debug, Clone, Copy)]
struct Settings {
    diagnostics: bool,
    reject_error_response: bool,
    timeout: Option<Duration>,
    limit: usize,
}

/// State of one exchange from submission until it is settled.
///
/// [`Transaction::close`] is the only cleanup path and runs at most once, also
/// from `Drop`, so the completion handle is never left pending.
pub(crate) struct Transaction {
    id: Option<TransferId>,
    method: Method,
    uri: Uri,
    status: TransferStatus,
    headers: Rc<RefCell<BytesMut>>,
    body: BodyCollector,
    responder: Option<oneshot::Sender<Result<Response>>>,
    upload: Option<UploadBridge>,
    control: TransferControl,
    settings: Settings,
    closed: bool,
}

impl Transaction {
    pub(crate) fn new(
        method: Method,
        uri: Uri,
        config: &Config,
        streaming: bool,
        control: TransferControl,
        responder: oneshot::Sender<Result<Response>>,
    ) -> Self {
        let body = if streaming {
            let (tx, rx) = unbounded::channel();
            BodyCollector::Stream {
                state: Rc::new(StreamState {
                    tx: RefCell::new(Some(tx)),
                    started: Cell::new(false),
                }),
                rx: Some(rx),
            }
        } else {
            BodyCollector::Buffered(Rc::new(RefCell::new(BufferedBody {
                data: BytesMut::new(),
                limit: config.max_response_size,
                overflow: None,
            })))
        };
        Self {
            id: None,
            method,
            uri,
            status: TransferStatus::Connecting,
            headers: Rc::new(RefCell::new(BytesMut::new())),
            body,
            responder: Some(responder),
            upload: None,
            control,
            settings: Settings {
                diagnostics: config.diagnostic_headers,
                reject_error_response: config.reject_error_response,
                timeout: config.timeout,
                limit: config.max_response_size,
            },
            closed: false,
        }
    }

    /// Header and body sinks to hand to the transport.
    pub(crate) fn sinks(&self) -> (Box<dyn ByteSink>, Box<dyn ByteSink>) {
        let body: Box<dyn ByteSink> = match &self.body {
            BodyCollector::Buffered(b) => Box::new(BufferedSink(b.clone())),
            BodyCollector::Stream { state, .. } => Box::new(StreamSink(state.clone())),
        };
        (Box::new(HeaderSink(self.headers.clone())), body)
    }

    #[inline]
    pub(crate) fn set_upload(&mut self, bridge: UploadBridge) {
        self.upload = Some(bridge);
    }

    #[inline]
    pub(crate) fn attach(&mut self, id: TransferId) {
        self.id = Some(id);
    }

    #[inline]
    pub(crate) fn status(&self) -> TransferStatus {
        self.status
    }

    /// Reclassify from fresh progress counters. Leaving the upload phase
    /// releases a send side that backpressure may have left paused.
    pub(crate) fn update_status(&mut self, progress: &Progress) {
        let next = TransferStatus::classify(progress);
        if self.status == TransferStatus::Uploading && next != TransferStatus::Uploading {
            self.control.continue_send();
        }
        self.status = next;
    }

    /// Resolve a streaming exchange as soon as its body starts flowing.
    pub(crate) fn resolve_stream_early(&mut self) {
        let BodyCollector::Stream { state, rx } = &mut self.body else {
            return;
        };
        if !state.started.get() || self.responder.is_none() {
            return;
        }
        let Some(rx) = rx.take() else {
            return;
        };
        let raw = self.headers.borrow();
        let Some((status, version, hops)) = response::last_status(&raw) else {
            return;
        };
        let mut info = TransferInfo::new(status, self.uri.clone(), self.method.clone());
        info.version = version;
        info.redirect_count = hops;
        // Timings are not final yet; diagnostics only make sense at completion.
        let response = response::assemble(
            &raw,
            &info,
            ResponseBody::Stream(BodyStream::new(rx)),
            false,
        );
        drop(raw);
        self.settle(self.check_status(response));
    }

    /// Settle with the transport's completion result and release everything.
    pub(crate) fn retire(mut self, outcome: std::result::Result<TransferInfo, TransportError>) {
        self.status = TransferStatus::Done;
        match outcome {
            Ok(info) => self.complete(info),
            Err(e) => {
                let error = self.classify_error(e);
                #[cfg(feature = "logging")]
                tracing::debug!("transaction {:?} failed: {}", self.id, error);
                match &self.body {
                    BodyCollector::Stream { state, rx: None } => state.finish(Some(error)),
                    _ => self.settle(Err(error)),
                }
            }
        }
        self.close();
    }

    fn complete(&mut self, info: TransferInfo) {
        let body = match &mut self.body {
            BodyCollector::Buffered(b) => {
                ResponseBody::Buffered(std::mem::take(&mut b.borrow_mut().data).freeze())
            }
            BodyCollector::Stream { state, rx } => {
                state.finish(None);
                match rx.take() {
                    Some(rx) => ResponseBody::Stream(BodyStream::new(rx)),
                    // Already resolved with the live stream.
                    None => return,
                }
            }
        };
        let response = response::assemble(
            &self.headers.borrow(),
            &info,
            body,
            self.settings.diagnostics,
        );
        #[cfg(feature = "logging")]
        tracing::debug!(
            "transaction {:?} completed with {} from {}",
            self.id,
            info.status,
            info.effective_uri
        );
        let result = self.check_status(response);
        self.settle(result);
    }

    fn check_status(&self, response: Response) -> Result<Response> {
        if self.settings.reject_error_response && !response.is_success() {
            return Err(Error::HttpStatus(Box::new(response)));
        }
        Ok(response)
    }

    fn classify_error(&self, e: TransportError) -> Error {
        if let BodyCollector::Buffered(b) = &self.body {
            if let Some(received) = b.borrow().overflow {
                #[cfg(feature = "logging")]
                tracing::debug!("transaction {:?} aborted, body over {} bytes", self.id, self.settings.limit);
                return Error::Overflow {
                    received,
                    limit: self.settings.limit,
                };
            }
        }
        match e {
            TransportError::Timeout => Error::Timeout(self.settings.timeout),
            TransportError::Upload(e) => Error::Fifo(e),
            e => Error::Connection {
                code: e.code(),
                message: e.to_string(),
            },
        }
    }

    fn settle(&mut self, result: Result<Response>) {
        if let Some(responder) = self.responder.take() {
            // The caller may have stopped waiting.
            let _ = responder.send(result);
        }
    }

    /// Release every owned resource. Safe to call again and before the
    /// transaction was registered with a transport.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.settle(Err(Error::Cancelled));
        if let BodyCollector::Stream { state, .. } = &self.body {
            if state.tx.borrow().is_some() {
                state.finish(Some(Error::Cancelled));
            }
        }
        drop(self.upload.take());
        self.control.continue_send();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction {:?}, {} {}, status: {:?}, closed: {}",
            self.id, self.method, self.uri, self.status, self.closed
        )
    }
}
