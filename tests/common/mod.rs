#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    future::Future,
    io,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;
use http::{StatusCode, Uri};
use monoio::{
    io::{AsyncReadRent, AsyncWriteRentExt},
    net::{TcpListener, TcpStream},
};
use monoio_multi_http::{
    fifo::BLOCK_SIZE,
    transport::{
        ByteSink, Progress, Pull, TransferBody, TransferId, TransferInfo, TransferSpec, Transport,
    },
    TransportError,
};

/// Route crate logs to the test output when built with `logging`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// One scripted action of a mock transfer, run on one `drive_once`.
pub enum Step {
    /// Do nothing this round.
    Idle,
    /// Do nothing, but report the transfer ready for another pass right away.
    Ready,
    Head(&'static str),
    /// Announce the download size.
    Total(u64),
    Body(Bytes),
    /// Pull the upload source until it ends. Stays on this step while the
    /// source has nothing to give.
    Upload,
    Complete(u16),
    Fail(TransportError),
}

pub type Script = Box<dyn Fn(&TransferSpec) -> Vec<Step>>;

struct MockTransfer {
    spec: TransferSpec,
    steps: VecDeque<Step>,
    progress: Progress,
    outcome: Option<Result<TransferInfo, TransportError>>,
    uploaded: Vec<u8>,
    ready: bool,
}

impl MockTransfer {
    fn step(&mut self) {
        self.ready = false;
        let Some(step) = self.steps.pop_front() else {
            self.finish(Ok(200));
            return;
        };
        match step {
            Step::Idle => {}
            Step::Ready => self.ready = true,
            Step::Head(raw) => {
                self.spec.header_sink.write(raw.as_bytes());
            }
            Step::Total(total) => self.progress.download_total = total,
            Step::Body(data) => {
                if self.spec.body_sink.write(&data) != data.len() {
                    self.finish(Err(TransportError::WriteAborted));
                    return;
                }
                self.progress.download_now += data.len() as u64;
            }
            Step::Upload => {
                let TransferBody::Source { source, .. } = &mut self.spec.body else {
                    return;
                };
                loop {
                    match source.pull(BLOCK_SIZE) {
                        Pull::Data(chunk) => {
                            self.uploaded.extend_from_slice(&chunk);
                            self.progress.upload_now += chunk.len() as u64;
                        }
                        Pull::Pending => {
                            self.spec.control.pause_send();
                            self.steps.push_front(Step::Upload);
                            return;
                        }
                        Pull::End => return,
                    }
                }
            }
            Step::Complete(status) => self.finish(Ok(status)),
            Step::Fail(e) => self.finish(Err(e)),
        }
    }

    fn finish(&mut self, result: Result<u16, TransportError>) {
        self.outcome = Some(result.map(|status| {
            let mut info = TransferInfo::new(
                StatusCode::from_u16(status).unwrap(),
                self.spec.uri.clone(),
                self.spec.method.clone(),
            );
            info.download_size = self.progress.download_now;
            info.upload_size = self.progress.upload_now;
            info
        }));
    }
}

#[derive(Default)]
pub struct MockState {
    next: u64,
    transfers: HashMap<TransferId, MockTransfer>,
    pub drives: usize,
    pub added: usize,
    pub removed: Vec<TransferId>,
    pub uploads: HashMap<TransferId, Vec<u8>>,
    pub refuse_add: bool,
    /// Poll delay the transport suggests, 1ms unless set.
    pub delay: Option<Duration>,
}

/// A transport that plays scripted steps instead of doing I/O.
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
    script: Script,
}

impl MockTransport {
    pub fn new(script: impl Fn(&TransferSpec) -> Vec<Step> + 'static) -> (Self, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState::default()));
        (
            Self {
                state: state.clone(),
                script: Box::new(script),
            },
            state,
        )
    }
}

impl Transport for MockTransport {
    fn add(&mut self, spec: TransferSpec) -> Result<TransferId, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.refuse_add {
            return Err(TransportError::Exhausted);
        }
        let id = TransferId::new(state.next);
        state.next += 1;
        state.added += 1;
        let steps = (self.script)(&spec).into();
        state.transfers.insert(
            id,
            MockTransfer {
                spec,
                steps,
                progress: Progress::default(),
                outcome: None,
                uploaded: Vec::new(),
                ready: false,
            },
        );
        Ok(id)
    }

    fn remove(&mut self, id: TransferId) -> bool {
        let mut state = self.state.borrow_mut();
        match state.transfers.remove(&id) {
            Some(transfer) => {
                state.uploads.insert(id, transfer.uploaded);
                state.removed.push(id);
                true
            }
            None => false,
        }
    }

    fn drive_once(&mut self) -> usize {
        let mut state = self.state.borrow_mut();
        state.drives += 1;
        let mut running = 0;
        for transfer in state.transfers.values_mut() {
            if transfer.outcome.is_some() {
                continue;
            }
            transfer.step();
            if transfer.outcome.is_none() {
                running += 1;
            }
        }
        running
    }

    fn is_running(&self, id: TransferId) -> bool {
        self.state
            .borrow()
            .transfers
            .get(&id)
            .is_some_and(|t| t.outcome.is_none())
    }

    fn is_ready(&self, id: TransferId) -> bool {
        self.state
            .borrow()
            .transfers
            .get(&id)
            .is_some_and(|t| t.ready)
    }

    fn progress(&self, id: TransferId) -> Option<Progress> {
        self.state.borrow().transfers.get(&id).map(|t| t.progress)
    }

    fn take_completed(&mut self, id: TransferId) -> Option<Result<TransferInfo, TransportError>> {
        self.state
            .borrow_mut()
            .transfers
            .get_mut(&id)
            .and_then(|t| t.outcome.take())
    }

    fn suggested_delay(&self) -> Duration {
        self.state
            .borrow()
            .delay
            .unwrap_or(Duration::from_millis(1))
    }

    fn len(&self) -> usize {
        self.state.borrow().transfers.len()
    }
}

/// Steps of a plain 200 response carrying `body`.
pub fn ok_steps(body: &'static str) -> Vec<Step> {
    vec![
        Step::Head("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n"),
        Step::Total(body.len() as u64),
        Step::Body(Bytes::from_static(body.as_bytes())),
        Step::Complete(200),
    ]
}

pub fn path(spec: &TransferSpec) -> &str {
    spec.uri.path()
}

/// A request as seen by [`serve`].
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub uri: Uri,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Start a keep-alive HTTP/1.1 server on a random local port. `handler` turns
/// each request into raw response bytes.
pub fn serve<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request) -> Fut + 'static,
    Fut: Future<Output = Vec<u8>> + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Rc::new(handler);
    monoio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            monoio::spawn(async move {
                let _ = connection(stream, handler).await;
            });
        }
    });
    addr
}

async fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<usize> {
    let (res, chunk) = stream.read(Vec::with_capacity(16 * 1024)).await;
    let n = res?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Decode a chunked request body without trailers. `None` if the peer hung up.
async fn read_chunked(stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    loop {
        let (consumed, size) = loop {
            match httparse::parse_chunk_size(buf) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) => {
                    if fill(stream, buf).await? == 0 {
                        return Ok(None);
                    }
                }
                Err(_) => return Err(io::Error::new(io::ErrorKind::InvalidData, "bad chunk size")),
            }
        };
        buf.drain(..consumed);
        let size = size as usize;
        // Payload plus its CRLF; the last chunk's CRLF ends the empty trailer.
        while buf.len() < size + 2 {
            if fill(stream, buf).await? == 0 {
                return Ok(None);
            }
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
        if size == 0 {
            return Ok(Some(body));
        }
    }
}

async fn connection<F, Fut>(mut stream: TcpStream, handler: Rc<F>) -> io::Result<()>
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Vec<u8>>,
{
    let mut buf = Vec::new();
    loop {
        let end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if fill(&mut stream, &mut buf).await? == 0 {
                return Ok(());
            }
        };
        let head = String::from_utf8_lossy(&buf[..end]).into_owned();
        buf.drain(..end);

        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap_or_default().split(' ');
        let method = request_line.next().unwrap_or_default().to_string();
        let uri = request_line.next().unwrap_or("/").parse().unwrap();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        let chunked = headers
            .iter()
            .any(|(n, v)| n == "transfer-encoding" && v.eq_ignore_ascii_case("chunked"));
        let body = if chunked {
            match read_chunked(&mut stream, &mut buf).await? {
                Some(body) => body,
                None => return Ok(()),
            }
        } else {
            let length: usize = headers
                .iter()
                .find(|(n, _)| n == "content-length")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(0);
            while buf.len() < length {
                if fill(&mut stream, &mut buf).await? == 0 {
                    return Ok(());
                }
            }
            buf.drain(..length).collect()
        };

        let reply = handler(Request {
            method,
            uri,
            headers,
            body,
        })
        .await;
        let (res, _) = stream.write_all(reply).await;
        res?;
    }
}

/// Raw bytes of a 200 response with a content-length delimited body.
pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    reply.extend_from_slice(body);
    reply
}

/// FNV-1a, to compare large uploads without echoing them back.
pub fn fnv1a(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf29ce484222325, |hash, b| {
        (hash ^ *b as u64).wrapping_mul(0x100000001b3)
    })
}

/// Block `index` of a deterministic test payload.
pub fn pattern(index: usize, len: usize) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| ((index * 31 + i) % 251) as u8)
            .collect::<Vec<u8>>(),
    )
}
