//! The multiplexing client and its tick loop.
//!
//! Every submitted request becomes a [`Transaction`] registered with the
//! [`Transport`]. A single local task, spawned on the first submission, drives the
//! transport and settles transactions as they finish. It picks its own poll
//! delay: immediately when a transfer is ready, almost immediately while
//! uploading, otherwise whatever the transport suggests. It exits when no
//! transaction is left.
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    future::Future,
    path::PathBuf,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use http::{
    header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH},
    HeaderMap, Method, Uri,
};
use local_sync::oneshot;

use crate::{
    body::RequestBody,
    config::{Config, FollowRedirects, HttpVersionPref},
    error::{Error, Result, TransportError},
    fifo::FifoRegistry,
    response::Response,
    transaction::{Transaction, TransferStatus},
    transport::{H1Transport, TransferBody, TransferControl, TransferId, TransferSpec, Transport},
    upload::UploadBridge,
};

/// Poll delay while some transfer is uploading.
const UPLOAD_POLL_DELAY: Duration = Duration::from_micros(100);

struct Shared<T> {
    transport: T,
    transactions: HashMap<TransferId, Transaction>,
    registry: FifoRegistry,
    ticking: bool,
}

impl<T: Transport> Shared<T> {
    /// Deregister a transaction and hand it back for closing.
    fn take(&mut self, id: TransferId) -> Option<Transaction> {
        let txn = self.transactions.remove(&id)?;
        self.transport.remove(id);
        Some(txn)
    }
}

/// What a pending [`ResponseFuture`] needs from its client.
trait Cancel {
    fn cancel(self: Rc<Self>, id: TransferId);
}

impl<T: Transport + 'static> Cancel for RefCell<Shared<T>> {
    fn cancel(self: Rc<Self>, id: TransferId) {
        let taken = self.try_borrow_mut().map(|mut shared| shared.take(id));
        let Ok(txn) = taken else {
            // Cancelled while the client is borrowed, e.g. from inside a tick.
            // Retry on the next scheduler cycle.
            #[cfg(feature = "logging")]
            tracing::debug!("transaction {} cancel deferred", id);
            monoio::spawn(async move { self.cancel(id) });
            return;
        };
        if let Some(mut txn) = txn {
            #[cfg(feature = "logging")]
            tracing::debug!("transaction {} cancelled", id);
            txn.close();
        }
    }
}

/// Concurrent HTTP exchanges over one [`Transport`], on the current thread.
///
/// Cloning is cheap; clones and the `with_*` variants share the transport, the
/// registry of in-flight exchanges and the FIFO channels.
pub struct MultiClient<T: Transport = H1Transport> {
    shared: Rc<RefCell<Shared<T>>>,
    config: Rc<Config>,
}

impl<T: Transport> Clone for MultiClient<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport> fmt::Debug for MultiClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MultiClient, in flight: {}",
            self.shared.borrow().transactions.len()
        )
    }
}

impl MultiClient<H1Transport> {
    pub fn new() -> Self {
        Self::with_transport(H1Transport::new())
    }

    pub fn from_config(config: Config) -> Self {
        let transport = H1Transport::new().with_max_transfers(config.max_transfers);
        Self::with_transport_and_config(transport, config)
    }
}

impl Default for MultiClient<H1Transport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport + 'static> MultiClient<T> {
    pub fn with_transport(transport: T) -> Self {
        Self::with_transport_and_config(transport, Config::default())
    }

    pub fn with_transport_and_config(transport: T, config: Config) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                transport,
                transactions: HashMap::new(),
                registry: FifoRegistry::new(),
                ticking: false,
            })),
            config: Rc::new(config),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Submit a request. `headers` may repeat a name; its values are joined with
    /// ",". Nothing is sent before the returned future is handed back.
    pub fn request<K, V>(
        &self,
        method: &str,
        url: &str,
        headers: impl IntoIterator<Item = (K, V)>,
        body: impl Into<RequestBody>,
    ) -> ResponseFuture
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.submit(method, url, headers, body.into(), self.config.streaming)
    }

    /// Like [`Self::request`] but the response resolves as soon as its body
    /// starts to arrive, with a [`ResponseBody::Stream`](crate::ResponseBody::Stream) body.
    pub fn request_streaming<K, V>(
        &self,
        method: &str,
        url: &str,
        headers: impl IntoIterator<Item = (K, V)>,
        body: impl Into<RequestBody>,
    ) -> ResponseFuture
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.submit(method, url, headers, body.into(), true)
    }

    pub fn get(&self, url: &str) -> ResponseFuture {
        self.request("GET", url, no_headers(), RequestBody::Empty)
    }

    pub fn head(&self, url: &str) -> ResponseFuture {
        self.request("HEAD", url, no_headers(), RequestBody::Empty)
    }

    pub fn delete(&self, url: &str) -> ResponseFuture {
        self.request("DELETE", url, no_headers(), RequestBody::Empty)
    }

    pub fn options(&self, url: &str) -> ResponseFuture {
        self.request("OPTIONS", url, no_headers(), RequestBody::Empty)
    }

    pub fn post(&self, url: &str, body: impl Into<RequestBody>) -> ResponseFuture {
        self.request("POST", url, no_headers(), body)
    }

    pub fn put(&self, url: &str, body: impl Into<RequestBody>) -> ResponseFuture {
        self.request("PUT", url, no_headers(), body)
    }

    pub fn patch(&self, url: &str, body: impl Into<RequestBody>) -> ResponseFuture {
        self.request("PATCH", url, no_headers(), body)
    }

    /// No exchange is registered.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.shared.borrow().transactions.is_empty()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.shared.borrow().transactions.len()
    }

    /// Cancel every registered exchange. Their futures reject with
    /// [`Error::Cancelled`] and streaming bodies end with that error.
    pub fn cancel_all(&self) {
        let cancelled: Vec<Transaction> = {
            let mut shared = self.shared.borrow_mut();
            let ids: Vec<TransferId> = shared.transactions.keys().copied().collect();
            ids.into_iter().filter_map(|id| shared.take(id)).collect()
        };
        for mut txn in cancelled {
            txn.close();
        }
    }

    /// The FIFO channels backing streamed uploads.
    pub fn fifo_registry(&self) -> FifoRegistry {
        self.shared.borrow().registry.clone()
    }

    fn derive(&self, f: impl FnOnce(&mut Config)) -> Self {
        let mut config = (*self.config).clone();
        f(&mut config);
        Self {
            shared: self.shared.clone(),
            config: Rc::new(config),
        }
    }

    /// Total budget in seconds; zero or less disables it.
    pub fn with_timeout(&self, secs: f64) -> Self {
        self.derive(|c| c.set_timeout_secs(secs))
    }

    pub fn with_connect_timeout(&self, timeout: Option<Duration>) -> Self {
        self.derive(|c| c.connect_timeout = timeout)
    }

    pub fn with_follow_redirects(&self, policy: impl Into<FollowRedirects>) -> Self {
        let policy = policy.into();
        self.derive(|c| c.set_follow_redirects(policy))
    }

    pub fn with_response_buffer(&self, max_size: usize) -> Self {
        self.derive(|c| c.max_response_size = max_size)
    }

    pub fn with_streaming(&self, streaming: bool) -> Self {
        self.derive(|c| c.streaming = streaming)
    }

    pub fn with_reject_error_response(&self, reject: bool) -> Self {
        self.derive(|c| c.reject_error_response = reject)
    }

    pub fn with_protocol_version(&self, version: impl Into<HttpVersionPref>) -> Self {
        let version = version.into();
        self.derive(|c| c.http_version = version)
    }

    pub fn with_header(&self, name: &str, value: &str) -> Self {
        self.derive(|c| c.set_header(name, value))
    }

    pub fn without_header(&self, name: &str) -> Self {
        self.derive(|c| c.remove_header(name))
    }

    /// `false` dials a fresh connection for every request and never reuses it.
    pub fn with_connection_cache(&self, enabled: bool) -> Self {
        self.derive(|c| c.disable_connection_cache = !enabled)
    }

    pub fn with_unix_socket(&self, path: Option<PathBuf>) -> Self {
        self.derive(|c| c.unix_socket = path)
    }

    pub fn with_diagnostic_headers(&self, enabled: bool) -> Self {
        self.derive(|c| c.diagnostic_headers = enabled)
    }

    pub fn with_config(&self, config: Config) -> Self {
        Self {
            shared: self.shared.clone(),
            config: Rc::new(config),
        }
    }

    fn submit<K, V>(
        &self,
        method: &str,
        url: &str,
        headers: impl IntoIterator<Item = (K, V)>,
        body: RequestBody,
        streaming: bool,
    ) -> ResponseFuture
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        match self.try_submit(method, url, headers, body, streaming) {
            Ok((id, rx)) => ResponseFuture {
                state: State::Pending {
                    rx,
                    id,
                    client: self.shared.clone(),
                },
            },
            Err(e) => ResponseFuture::rejected(e),
        }
    }

    fn try_submit<K, V>(
        &self,
        method: &str,
        url: &str,
        headers: impl IntoIterator<Item = (K, V)>,
        body: RequestBody,
        streaming: bool,
    ) -> Result<(TransferId, oneshot::Receiver<Result<Response>>)>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidRequest(format!("invalid method {method:?}")))?;
        let uri = parse_url(url)?;
        let headers = merge_headers(&self.config.default_headers, headers)?;

        let mut options = self.config.transfer_options();
        if headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            options.forbid_reuse = true;
        }

        let control = TransferControl::new();
        let (tx, rx) = oneshot::channel();
        let mut txn = Transaction::new(
            method.clone(),
            uri.clone(),
            &self.config,
            streaming,
            control.clone(),
            tx,
        );

        let mut shared = self.shared.borrow_mut();
        let body = match body {
            RequestBody::Empty => TransferBody::Empty,
            RequestBody::Full(bytes) => TransferBody::Full(bytes),
            RequestBody::Stream(source) => {
                let length = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok());
                let (bridge, reader) = UploadBridge::new(
                    &shared.registry,
                    source,
                    control.clone(),
                    self.config.upload_buffer_blocks,
                );
                txn.set_upload(bridge);
                TransferBody::Source {
                    source: Box::new(reader),
                    length,
                }
            }
        };
        let (header_sink, body_sink) = txn.sinks();
        let spec = TransferSpec {
            method,
            uri,
            headers,
            body,
            options,
            header_sink,
            body_sink,
            control,
        };

        let id = match shared.transport.add(spec) {
            Ok(id) => id,
            Err(e) => {
                drop(shared);
                txn.close();
                return Err(Error::TransportInit(e));
            }
        };
        txn.attach(id);
        #[cfg(feature = "logging")]
        tracing::debug!("transaction {} submitted: {:?}", id, txn);
        shared.transactions.insert(id, txn);

        if !shared.ticking {
            shared.ticking = true;
            // First tick runs on the next scheduler cycle, never inline.
            monoio::spawn(run(Rc::downgrade(&self.shared)));
        }
        Ok((id, rx))
    }
}

fn no_headers() -> std::iter::Empty<(&'static str, &'static str)> {
    std::iter::empty()
}

fn parse_url(url: &str) -> Result<Uri> {
    let uri: Uri = url
        .parse()
        .map_err(|e| Error::InvalidRequest(format!("invalid url {url:?}: {e}")))?;
    if uri.scheme().is_none() {
        return Err(Error::InvalidRequest(format!("url {url:?} has no scheme")));
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(Error::InvalidRequest(format!("url {url:?} has no host")));
    }
    Ok(uri)
}

/// Request headers over the defaults. Names are lower-cased and compared
/// case-insensitively; repeated names are joined with ",".
fn merge_headers<K, V>(
    defaults: &[(String, String)],
    headers: impl IntoIterator<Item = (K, V)>,
) -> Result<HeaderMap>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut merged: Vec<(String, Vec<String>)> = Vec::new();
    for (name, value) in headers {
        let name = name.as_ref().trim().to_ascii_lowercase();
        let value = value.as_ref().trim().to_string();
        match merged.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => merged.push((name, vec![value])),
        }
    }
    for (name, value) in defaults {
        let name = name.to_ascii_lowercase();
        if !merged.iter().any(|(n, _)| *n == name) {
            merged.push((name, vec![value.clone()]));
        }
    }

    let mut map = HeaderMap::with_capacity(merged.len());
    for (name, values) in merged {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::InvalidRequest(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(&values.join(","))
            .map_err(|_| Error::InvalidRequest(format!("invalid value for header {name:?}")))?;
        map.insert(header, value);
    }
    Ok(map)
}

/// The tick loop. Holds the client weakly so it ends with the last handle.
async fn run<T: Transport + 'static>(shared: Weak<RefCell<Shared<T>>>) {
    loop {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        let Some(delay) = tick(&strong) else {
            return;
        };
        drop(strong);
        if delay.is_zero() {
            YieldNow(false).await;
        } else {
            Wakeup {
                shared: shared.clone(),
                sleep: Box::pin(monoio::time::sleep(delay)),
            }
            .await;
        }
    }
}

/// One scheduler pass. Returns the delay before the next pass, or `None` once
/// nothing is registered anymore.
fn tick<T: Transport>(shared: &RefCell<Shared<T>>) -> Option<Duration> {
    let mut retired = Vec::new();
    let delay = {
        let mut guard = shared.borrow_mut();
        let Shared {
            transport,
            transactions,
            ticking,
            ..
        } = &mut *guard;

        transport.drive_once();

        let mut finished = Vec::new();
        let mut ready = false;
        let mut uploading = false;
        for (&id, txn) in transactions.iter_mut() {
            if transport.is_running(id) {
                if let Some(progress) = transport.progress(id) {
                    txn.update_status(&progress);
                }
                txn.resolve_stream_early();
                ready |= transport.is_ready(id);
                uploading |= txn.status() == TransferStatus::Uploading;
                continue;
            }
            let outcome = transport
                .take_completed(id)
                .unwrap_or_else(|| Err(TransportError::MissingCompletion));
            finished.push((id, outcome));
        }
        for (id, outcome) in finished {
            transport.remove(id);
            if let Some(txn) = transactions.remove(&id) {
                retired.push((txn, outcome));
            }
        }

        if transactions.is_empty() {
            *ticking = false;
            None
        } else if ready {
            Some(Duration::ZERO)
        } else if uploading {
            Some(UPLOAD_POLL_DELAY)
        } else {
            Some(transport.suggested_delay())
        }
    };

    // Settle outside the borrow; waking a caller must not find the client locked.
    for (txn, outcome) in retired {
        #[cfg(feature = "logging")]
        tracing::debug!("transaction retired: {:?}", txn);
        txn.retire(outcome);
    }
    delay
}

struct YieldNow(bool);

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Sleeps for the poll delay unless the transport reports activity first.
struct Wakeup<T> {
    shared: Weak<RefCell<Shared<T>>>,
    sleep: Pin<Box<monoio::time::Sleep>>,
}

impl<T: Transport> Future for Wakeup<T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(());
        }
        let Some(shared) = self.shared.upgrade() else {
            return Poll::Ready(());
        };
        let Ok(mut shared) = shared.try_borrow_mut() else {
            return Poll::Pending;
        };
        shared.transport.poll_wakeup(cx)
    }
}

enum State {
    Rejected(Option<Error>),
    Pending {
        rx: oneshot::Receiver<Result<Response>>,
        id: TransferId,
        client: Rc<dyn Cancel>,
    },
    Done,
}

/// Completion handle of a submitted request.
///
/// Dropping it before it resolved cancels the exchange.
pub struct ResponseFuture {
    state: State,
}

impl ResponseFuture {
    fn rejected(e: Error) -> Self {
        Self {
            state: State::Rejected(Some(e)),
        }
    }

    /// Cancel the exchange now. Awaiting the future afterwards yields
    /// [`Error::Cancelled`].
    pub fn cancel(&mut self) {
        if let State::Pending { id, client, .. } = &self.state {
            client.clone().cancel(*id);
        }
    }

    /// The transfer handle, while the exchange is registered.
    pub fn id(&self) -> Option<TransferId> {
        match &self.state {
            State::Pending { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let output = match &mut this.state {
            State::Rejected(e) => e.take().map(Err).unwrap_or(Err(Error::Cancelled)),
            State::Pending { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(_)) => Err(Error::Cancelled),
                Poll::Pending => return Poll::Pending,
            },
            State::Done => Err(Error::Cancelled),
        };
        this.state = State::Done;
        Poll::Ready(output)
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Rejected(_) => write!(f, "ResponseFuture, rejected"),
            State::Pending { id, .. } => write!(f, "ResponseFuture, pending {id}"),
            State::Done => write!(f, "ResponseFuture, done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::transport::{Progress, TransferInfo};

    #[test]
    fn request_headers_override_defaults() {
        let defaults = vec![
            ("user-agent".to_string(), "default".to_string()),
            ("accept".to_string(), "*/*".to_string()),
        ];
        let map = merge_headers(
            &defaults,
            [("User-Agent", "mine"), ("X-Multi", "a"), ("x-multi", "b")],
        )
        .unwrap();
        assert_eq!(map.get("user-agent").unwrap(), "mine");
        assert_eq!(map.get("accept").unwrap(), "*/*");
        assert_eq!(map.get("x-multi").unwrap(), "a,b");
        assert!(merge_headers(&defaults, [("bad header", "x")]).is_err());
    }

    #[test]
    fn urls_need_scheme_and_host() {
        assert!(parse_url("http://example.com/path").is_ok());
        assert!(parse_url("/just/a/path").is_err());
        assert!(parse_url("http://").is_err());
        assert!(parse_url("not a url").is_err());
    }

    #[monoio::test(enable_timer = true)]
    async fn invalid_requests_reject_without_registering() {
        let client = MultiClient::new();
        let err = client.get("nope").await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        let err = client
            .request("GET", "ftp://example.com/", no_headers(), ())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportInit(_)));
        assert_eq!(err.code(), Some(1));
        assert!(client.is_idle());
    }

    #[derive(Default)]
    struct Probe {
        ready: Cell<bool>,
        progress: Cell<Progress>,
        done: Cell<bool>,
        ids: Cell<u64>,
    }

    /// A transport whose readiness and counters the test sets by hand.
    struct Manual(Rc<Probe>);

    impl Transport for Manual {
        fn add(&mut self, _spec: TransferSpec) -> Result<TransferId, TransportError> {
            let id = self.0.ids.get();
            self.0.ids.set(id + 1);
            Ok(TransferId::new(id))
        }

        fn remove(&mut self, _id: TransferId) -> bool {
            true
        }

        fn drive_once(&mut self) -> usize {
            usize::from(!self.0.done.get())
        }

        fn is_running(&self, _id: TransferId) -> bool {
            !self.0.done.get()
        }

        fn is_ready(&self, _id: TransferId) -> bool {
            self.0.ready.get()
        }

        fn progress(&self, _id: TransferId) -> Option<Progress> {
            Some(self.0.progress.get())
        }

        fn take_completed(
            &mut self,
            _id: TransferId,
        ) -> Option<Result<TransferInfo, TransportError>> {
            Some(Err(TransportError::Timeout))
        }

        fn suggested_delay(&self) -> Duration {
            Duration::from_millis(100)
        }

        fn len(&self) -> usize {
            1
        }
    }

    #[monoio::test(enable_timer = true)]
    async fn tick_delay_follows_transfer_state() {
        let probe = Rc::new(Probe::default());
        let client = MultiClient::with_transport(Manual(probe.clone()));
        let fut = client.get("http://example.com/");

        assert_eq!(tick(&client.shared), Some(Duration::from_millis(100)));

        probe.progress.set(Progress {
            upload_total: 100,
            upload_now: 10,
            ..Default::default()
        });
        assert_eq!(tick(&client.shared), Some(UPLOAD_POLL_DELAY));

        probe.ready.set(true);
        assert_eq!(tick(&client.shared), Some(Duration::ZERO));

        probe.done.set(true);
        assert_eq!(tick(&client.shared), None);
        assert!(!client.shared.borrow().ticking);
        assert!(fut.await.unwrap_err().is_timeout());
    }

    #[monoio::test(enable_timer = true)]
    async fn cancel_during_a_borrow_is_deferred() {
        let client = MultiClient::with_transport(Manual(Rc::new(Probe::default())));
        let fut = client.get("http://example.com/");
        {
            let _busy = client.shared.borrow();
            drop(fut);
        }
        assert_eq!(client.in_flight(), 1);

        monoio::time::sleep(Duration::from_millis(5)).await;
        assert!(client.is_idle());
    }
}
