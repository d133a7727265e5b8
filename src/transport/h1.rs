//! HTTP/1.x implementation of [`Transport`].
//!
//! Every registered transfer is a boxed future polled by [`H1Transport::drive_once`]
//! with its own waker. Waking it marks the transfer ready and wakes whoever
//! registered through [`Transport::poll_wakeup`], so the scheduler sleeps until
//! there is socket or timer activity instead of spinning.
use std::{
    cell::Cell,
    collections::HashMap,
    fmt,
    future::Future,
    io,
    pin::Pin,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll, Wake, Waker},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use http::{
    header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE},
    HeaderMap, Method, StatusCode, Uri, Version,
};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};

use super::{
    codec::{self, ChunkedDecoder, Decoded, RequestFraming, ResponseFraming, ResponseHead},
    connector::{Connector, ConnectorExt, Endpoint, HttpConnector, MaybeTlsStream, TlsConnector},
    pool::{ConnectionPool, Pooled},
    ByteSink, Progress, TransferBody, TransferControl, TransferId, TransferInfo, TransferOptions,
    TransferSpec, TransferTiming, Transport,
};
use crate::{
    config::HttpVersionPref,
    error::TransportError,
    fifo::{Pull, BLOCK_SIZE},
};

const READ_BUF_SIZE: usize = 16 * 1024;

type Conn = Pooled<Endpoint, MaybeTlsStream>;
type TransferFuture = Pin<Box<dyn Future<Output = Result<TransferInfo, TransportError>>>>;

#[derive(Default)]
struct LoopWaker {
    waker: Mutex<Option<Waker>>,
}

impl LoopWaker {
    fn register(&self, waker: &Waker) {
        if let Ok(mut slot) = self.waker.lock() {
            match slot.as_ref() {
                Some(w) if w.will_wake(waker) => {}
                _ => *slot = Some(waker.clone()),
            }
        }
    }

    fn wake(&self) {
        let waker = self.waker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct WakeFlag {
    ready: AtomicBool,
    loop_waker: Arc<LoopWaker>,
}

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.store(true, Ordering::Release);
        self.loop_waker.wake();
    }
}

struct Transfer {
    future: Option<TransferFuture>,
    flag: Arc<WakeFlag>,
    waker: Waker,
    progress: Rc<Cell<Progress>>,
    outcome: Option<Result<TransferInfo, TransportError>>,
}

/// HTTP/1.0 and HTTP/1.1 over TCP, TLS or Unix sockets with a shared keep-alive
/// pool. An HTTP/2 preference is served over HTTP/1.1.
pub struct H1Transport {
    next_id: u64,
    transfers: HashMap<TransferId, Transfer>,
    connector: Rc<HttpConnector>,
    // Used when connection caches are disabled: no TLS session resumption.
    fresh_connector: Rc<HttpConnector>,
    pool: ConnectionPool<Endpoint, MaybeTlsStream>,
    loop_waker: Arc<LoopWaker>,
    max_transfers: Option<usize>,
}

impl Default for H1Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for H1Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "H1Transport, transfers: {}, {:?}",
            self.transfers.len(),
            self.pool
        )
    }
}

impl H1Transport {
    pub fn new() -> Self {
        Self::with_pool(ConnectionPool::default())
    }

    pub fn with_pool(pool: ConnectionPool<Endpoint, MaybeTlsStream>) -> Self {
        Self {
            next_id: 0,
            transfers: HashMap::new(),
            connector: Rc::new(HttpConnector::default()),
            fresh_connector: Rc::new(HttpConnector::new(TlsConnector::new_with_tls_default(
                Some(vec!["http/1.1"]),
                false,
            ))),
            pool,
            loop_waker: Arc::new(LoopWaker::default()),
            max_transfers: None,
        }
    }

    /// Refuse registrations with [`TransportError::Exhausted`] while `max`
    /// transfers are registered.
    #[inline]
    pub fn with_max_transfers(mut self, max: Option<usize>) -> Self {
        self.max_transfers = max;
        self
    }

    #[inline]
    pub fn pool(&self) -> &ConnectionPool<Endpoint, MaybeTlsStream> {
        &self.pool
    }
}

impl Transport for H1Transport {
    fn add(&mut self, spec: TransferSpec) -> Result<TransferId, TransportError> {
        if self
            .max_transfers
            .is_some_and(|max| self.transfers.len() >= max)
        {
            return Err(TransportError::Exhausted);
        }
        // Fail fast on URLs no connection could be made for.
        Endpoint::from_uri(&spec.uri, spec.options.unix_socket.as_deref())?;

        let id = TransferId::new(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let progress = Rc::new(Cell::new(Progress::default()));
        let connector = if spec.options.fresh_connect {
            self.fresh_connector.clone()
        } else {
            self.connector.clone()
        };
        let exchange = Exchange::new(spec, connector, self.pool.clone(), progress.clone());
        let flag = Arc::new(WakeFlag {
            // New transfers start on the next drive.
            ready: AtomicBool::new(true),
            loop_waker: self.loop_waker.clone(),
        });
        let waker = Waker::from(flag.clone());
        self.transfers.insert(
            id,
            Transfer {
                future: Some(Box::pin(exchange.run())),
                flag,
                waker,
                progress,
                outcome: None,
            },
        );
        #[cfg(feature = "logging")]
        tracing::debug!("transfer {} registered", id);
        Ok(id)
    }

    fn remove(&mut self, id: TransferId) -> bool {
        self.transfers.remove(&id).is_some()
    }

    fn drive_once(&mut self) -> usize {
        let mut running = 0;
        for (_id, transfer) in self.transfers.iter_mut() {
            let Some(future) = transfer.future.as_mut() else {
                continue;
            };
            if transfer.flag.ready.swap(false, Ordering::AcqRel) {
                let mut cx = Context::from_waker(&transfer.waker);
                if let Poll::Ready(outcome) = future.as_mut().poll(&mut cx) {
                    #[cfg(feature = "logging")]
                    if let Err(e) = &outcome {
                        tracing::debug!("transfer {} failed: {}", _id, e);
                    }
                    transfer.future = None;
                    transfer.outcome = Some(outcome);
                    continue;
                }
            }
            running += 1;
        }
        running
    }

    #[inline]
    fn is_running(&self, id: TransferId) -> bool {
        self.transfers
            .get(&id)
            .is_some_and(|t| t.future.is_some())
    }

    #[inline]
    fn is_ready(&self, id: TransferId) -> bool {
        self.transfers
            .get(&id)
            .is_some_and(|t| t.future.is_some() && t.flag.ready.load(Ordering::Acquire))
    }

    #[inline]
    fn progress(&self, id: TransferId) -> Option<Progress> {
        self.transfers.get(&id).map(|t| t.progress.get())
    }

    fn take_completed(&mut self, id: TransferId) -> Option<Result<TransferInfo, TransportError>> {
        self.transfers.get_mut(&id).and_then(|t| t.outcome.take())
    }

    fn poll_wakeup(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.loop_waker.register(cx.waker());
        let ready = self
            .transfers
            .values()
            .any(|t| t.future.is_some() && t.flag.ready.load(Ordering::Acquire));
        if ready {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.transfers.len()
    }
}

/// One transfer: possibly several hops when redirects are followed.
struct Exchange {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: TransferBody,
    options: TransferOptions,
    header_sink: Box<dyn ByteSink>,
    body_sink: Box<dyn ByteSink>,
    control: TransferControl,
    connector: Rc<HttpConnector>,
    pool: ConnectionPool<Endpoint, MaybeTlsStream>,
    progress: Rc<Cell<Progress>>,
    started: Instant,
    timing: TransferTiming,
    num_connects: u32,
    request_size: u64,
    header_size: u64,
    read_buf: BytesMut,
}

/// What a hop produced, before its body was consumed.
struct Hop {
    conn: Conn,
    head: ResponseHead,
}

impl Exchange {
    fn new(
        spec: TransferSpec,
        connector: Rc<HttpConnector>,
        pool: ConnectionPool<Endpoint, MaybeTlsStream>,
        progress: Rc<Cell<Progress>>,
    ) -> Self {
        let mut p = Progress::default();
        if let TransferBody::Source {
            length: Some(len), ..
        } = &spec.body
        {
            p.upload_total = *len;
        }
        if let TransferBody::Full(b) = &spec.body {
            p.upload_total = b.len() as u64;
        }
        progress.set(p);
        Self {
            method: spec.method,
            uri: spec.uri,
            headers: spec.headers,
            body: spec.body,
            options: spec.options,
            header_sink: spec.header_sink,
            body_sink: spec.body_sink,
            control: spec.control,
            connector,
            pool,
            progress,
            started: Instant::now(),
            timing: TransferTiming::default(),
            num_connects: 0,
            request_size: 0,
            header_size: 0,
            read_buf: BytesMut::with_capacity(READ_BUF_SIZE),
        }
    }

    async fn run(mut self) -> Result<TransferInfo, TransportError> {
        self.started = Instant::now();
        match self.options.timeout {
            Some(timeout) => monoio::time::timeout(timeout, self.exchange())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => self.exchange().await,
        }
    }

    fn version(&self) -> Version {
        match self.options.http_version {
            HttpVersionPref::Http10 => Version::HTTP_10,
            HttpVersionPref::Http2 => {
                #[cfg(feature = "logging")]
                tracing::debug!("http/2 requested, speaking http/1.1");
                Version::HTTP_11
            }
            _ => Version::HTTP_11,
        }
    }

    fn update_progress(&self, f: impl FnOnce(&mut Progress)) {
        let mut p = self.progress.get();
        f(&mut p);
        self.progress.set(p);
    }

    async fn exchange(&mut self) -> Result<TransferInfo, TransportError> {
        let mut redirects = 0u32;
        loop {
            let Hop { mut conn, head } = self.hop().await?;
            let framing = head.framing(&self.method);

            if self.options.follow_redirects && head.is_redirect() {
                if let Some(next) = self.redirect_target(&head, redirects)? {
                    self.read_body(&mut conn, framing, false).await?;
                    self.release(conn, &head, framing);
                    redirects += 1;
                    self.uri = next;
                    self.timing.redirect = self.started.elapsed();
                    #[cfg(feature = "logging")]
                    tracing::debug!("following redirect to {}", self.uri);
                    continue;
                }
            }

            let length = head.content_length.unwrap_or_default();
            if matches!(framing, ResponseFraming::Length(_)) {
                self.update_progress(|p| p.download_total = length);
            }
            let download_size = self.read_body(&mut conn, framing, true).await?;
            self.release(conn, &head, framing);
            self.timing.total = self.started.elapsed();

            let progress = self.progress.get();
            let mut info = TransferInfo::new(head.status, self.uri.clone(), self.method.clone());
            info.version = head.version;
            info.redirect_count = redirects;
            info.num_connects = self.num_connects;
            info.header_size = self.header_size;
            info.request_size = self.request_size;
            info.upload_size = progress.upload_now;
            info.download_size = download_size;
            info.timing = self.timing;
            return Ok(info);
        }
    }

    /// Decide where a redirect leads, rewriting method and body on the way.
    /// `None` keeps the redirect response as the final one.
    fn redirect_target(
        &mut self,
        head: &ResponseHead,
        redirects: u32,
    ) -> Result<Option<Uri>, TransportError> {
        if let Some(max) = self.options.max_redirects {
            if redirects >= max {
                return Err(TransportError::TooManyRedirects(max));
            }
        }
        let Some(location) = head.location.as_deref() else {
            return Ok(None);
        };
        let next = codec::resolve_location(&self.uri, location)?;
        match head.status.as_u16() {
            303 if self.method != Method::HEAD => self.switch_to_get(),
            301 | 302 if self.method == Method::POST => self.switch_to_get(),
            307 | 308 if !self.body.is_replayable() => {
                // A consumed stream cannot be sent twice.
                #[cfg(feature = "logging")]
                tracing::debug!("not replaying streamed body for {}", head.status);
                return Ok(None);
            }
            _ => {}
        }
        Ok(Some(next))
    }

    fn switch_to_get(&mut self) {
        self.method = Method::GET;
        self.body = TransferBody::Empty;
        self.headers.remove(CONTENT_TYPE);
        self.headers.remove(CONTENT_LENGTH);
    }

    /// Connect, send the request and read the final (non 1xx) response head.
    /// A reused connection that turns out dead is replaced once when the body
    /// can be sent again.
    async fn hop(&mut self) -> Result<Hop, TransportError> {
        let endpoint = Endpoint::from_uri(&self.uri, self.options.unix_socket.as_deref())?;
        let mut fresh = self.options.fresh_connect;
        loop {
            let mut conn = self.checkout(&endpoint, fresh).await?;
            self.timing.pretransfer = self.started.elapsed();
            self.read_buf.clear();

            let result = match self.send_request(&mut conn).await {
                Ok(()) => self.read_head(&mut conn).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(head) => return Ok(Hop { conn, head }),
                Err(_e)
                    if conn.is_reused() && self.body.is_replayable() && self.read_buf.is_empty() =>
                {
                    #[cfg(feature = "logging")]
                    tracing::debug!("pooled connection to {} failed ({}), redialing", endpoint, _e);
                    fresh = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn checkout(&mut self, endpoint: &Endpoint, fresh: bool) -> Result<Conn, TransportError> {
        if !fresh {
            if let Some(conn) = self.pool.get(endpoint) {
                return Ok(conn);
            }
        }
        let offset = self.started.elapsed();
        let connected = match self.options.connect_timeout {
            Some(timeout) => self
                .connector
                .connect_with_timeout(endpoint, timeout)
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => self.connector.connect(endpoint).await?,
        };
        self.num_connects += 1;
        self.timing.namelookup = offset + connected.namelookup;
        self.timing.connect = offset + connected.connect;
        self.timing.appconnect = if connected.appconnect.is_zero() {
            Duration::ZERO
        } else {
            offset + connected.appconnect
        };
        Ok(self.pool.link(endpoint.clone(), connected.io))
    }

    async fn write(conn: &mut Conn, data: Vec<u8>) -> Result<(), TransportError> {
        let (res, _) = conn.write_all(data).await;
        res.map(|_| ()).map_err(TransportError::Send)
    }

    async fn send_request(&mut self, conn: &mut Conn) -> Result<(), TransportError> {
        let framing = match &self.body {
            TransferBody::Empty => match self.method {
                Method::POST | Method::PUT | Method::PATCH => RequestFraming::Length(0),
                _ => RequestFraming::None,
            },
            TransferBody::Full(b) => RequestFraming::Length(b.len() as u64),
            TransferBody::Source {
                length: Some(len), ..
            } => RequestFraming::Length(*len),
            TransferBody::Source { length: None, .. } => RequestFraming::Chunked,
        };
        let mut head =
            codec::encode_request_head(&self.method, &self.uri, &self.headers, self.version(), framing);
        self.request_size += head.len() as u64;

        match &mut self.body {
            TransferBody::Empty => Self::write(conn, head).await?,
            TransferBody::Full(body) => {
                let len = body.len() as u64;
                head.extend_from_slice(body);
                Self::write(conn, head).await?;
                self.update_progress(|p| p.upload_now = len);
            }
            TransferBody::Source { length, .. } => {
                let length = *length;
                Self::write(conn, head).await?;
                self.stream_body(conn, length).await?;
            }
        }
        conn.flush().await.map_err(TransportError::Send)
    }

    /// Pump the upload source. `Pending` parks the send side until the source
    /// side calls `continue_send`.
    async fn stream_body(
        &mut self,
        conn: &mut Conn,
        length: Option<u64>,
    ) -> Result<(), TransportError> {
        let TransferBody::Source { source, .. } = &mut self.body else {
            return Ok(());
        };
        let mut sent = 0u64;
        loop {
            let max = match length {
                Some(len) if sent >= len => break,
                Some(len) => ((len - sent) as usize).min(BLOCK_SIZE),
                None => BLOCK_SIZE,
            };
            match source.pull(max) {
                Pull::Data(chunk) => {
                    sent += chunk.len() as u64;
                    let frame = match length {
                        Some(_) => chunk.to_vec(),
                        None => codec::encode_chunk(&chunk),
                    };
                    Self::write(conn, frame).await?;
                    let now = sent;
                    let mut p = self.progress.get();
                    p.upload_now = now;
                    self.progress.set(p);
                }
                Pull::Pending => {
                    self.control.pause_send();
                    self.control.wait_send().await;
                }
                Pull::End => match length {
                    Some(len) if sent < len => return Err(TransportError::ReadAborted),
                    Some(_) => break,
                    None => {
                        Self::write(conn, codec::LAST_CHUNK.to_vec()).await?;
                        break;
                    }
                },
            }
        }
        // Bytes queued past a declared length are never sent.
        source.close()?;
        Ok(())
    }

    /// Read more bytes into the read buffer. Returns 0 at end of stream.
    async fn fill(&mut self, conn: &mut Conn) -> Result<usize, TransportError> {
        let buf = Vec::with_capacity(READ_BUF_SIZE);
        let (res, buf) = conn.read(buf).await;
        let n = res.map_err(TransportError::Recv)?;
        self.read_buf.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    async fn read_head(&mut self, conn: &mut Conn) -> Result<ResponseHead, TransportError> {
        let mut first_byte = true;
        loop {
            if let Some((head, end)) = codec::parse_response_head(&self.read_buf)? {
                let raw = self.read_buf.split_to(end).freeze();
                if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                    continue;
                }
                self.header_size += raw.len() as u64;
                self.deliver_header(raw)?;
                return Ok(head);
            }
            if self.read_buf.len() > codec::MAX_HEAD_SIZE {
                return Err(TransportError::Protocol("response head too large".into()));
            }
            if self.fill(conn).await? == 0 {
                return Err(TransportError::Recv(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "empty reply from server",
                )));
            }
            if first_byte {
                first_byte = false;
                self.timing.starttransfer = self.started.elapsed();
            }
        }
    }

    fn deliver_header(&mut self, raw: Bytes) -> Result<(), TransportError> {
        if self.header_sink.write(&raw) != raw.len() {
            return Err(TransportError::WriteAborted);
        }
        Ok(())
    }

    fn deliver(&mut self, data: &[u8], keep: bool) -> Result<u64, TransportError> {
        if !keep || data.is_empty() {
            return Ok(0);
        }
        if self.body_sink.write(data) != data.len() {
            return Err(TransportError::WriteAborted);
        }
        let n = data.len() as u64;
        self.update_progress(|p| p.download_now += n);
        Ok(n)
    }

    /// Consume the response body, forwarding it to the body sink when `keep`.
    async fn read_body(
        &mut self,
        conn: &mut Conn,
        framing: ResponseFraming,
        keep: bool,
    ) -> Result<u64, TransportError> {
        let mut received = 0u64;
        match framing {
            ResponseFraming::Empty => {}
            ResponseFraming::Length(len) => {
                while received < len {
                    if self.read_buf.is_empty() && self.fill(conn).await? == 0 {
                        return Err(TransportError::Recv(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("transfer closed with {} bytes remaining", len - received),
                        )));
                    }
                    let take = ((len - received) as usize).min(self.read_buf.len());
                    let chunk = self.read_buf.split_to(take);
                    self.deliver(&chunk, keep)?;
                    received += take as u64;
                }
            }
            ResponseFraming::Chunked => {
                let mut decoder = ChunkedDecoder::default();
                loop {
                    match decoder.decode(&mut self.read_buf)? {
                        Decoded::Data(chunk) => {
                            self.deliver(&chunk, keep)?;
                            received += chunk.len() as u64;
                        }
                        Decoded::NeedMore => {
                            if self.fill(conn).await? == 0 {
                                return Err(TransportError::Recv(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "transfer closed inside a chunked body",
                                )));
                            }
                        }
                        Decoded::Done => break,
                    }
                }
            }
            ResponseFraming::Close => loop {
                if !self.read_buf.is_empty() {
                    let chunk = self.read_buf.split();
                    self.deliver(&chunk, keep)?;
                    received += chunk.len() as u64;
                }
                if self.fill(conn).await? == 0 {
                    break;
                }
            },
        }
        Ok(received)
    }

    fn release(&self, mut conn: Conn, head: &ResponseHead, framing: ResponseFraming) {
        let request_close = self
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));
        let reusable = head.keep_alive
            && !request_close
            && !self.options.forbid_reuse
            && framing != ResponseFraming::Close
            && self.read_buf.is_empty();
        conn.set_reusable(reusable);
    }
}
