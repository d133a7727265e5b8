//! Response objects and their assembly from raw transport output.
use std::{
    fmt,
    future::Future,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use http::{
    header::{HeaderName, HeaderValue, CONTENT_LENGTH},
    HeaderMap, Method, StatusCode, Uri, Version,
};
use local_sync::mpsc::unbounded;
use smol_str::SmolStr;

use crate::{error::Error, transport::TransferInfo};

pub const SERVER_TIMING: HeaderName = HeaderName::from_static("server-timing");
pub const X_CONNECTION: HeaderName = HeaderName::from_static("x-connection");

/// Body of a [`Response`].
pub enum ResponseBody {
    Buffered(Bytes),
    Stream(BodyStream),
}

impl ResponseBody {
    /// Collect the whole body. A streamed body yields the first error it carries.
    pub async fn bytes(self) -> Result<Bytes, Error> {
        match self {
            ResponseBody::Buffered(b) => Ok(b),
            ResponseBody::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.recv().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        matches!(self, ResponseBody::Stream(_))
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            ResponseBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Live response body of a streaming request. Chunks arrive in transport
/// delivery order; a failure after the response resolved arrives as an error
/// item and ends the stream.
pub struct BodyStream {
    rx: unbounded::Rx<Result<Bytes, Error>>,
}

impl BodyStream {
    pub(crate) fn new(rx: unbounded::Rx<Result<Bytes, Error>>) -> Self {
        Self { rx }
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, Error>>> {
        self.rx.poll_recv(cx)
    }

    pub async fn recv(&mut self) -> Option<Result<Bytes, Error>> {
        self.rx.recv().await
    }
}

impl monoio::io::stream::Stream for BodyStream {
    type Item = Result<Bytes, Error>;

    #[inline]
    fn next(&mut self) -> impl Future<Output = Option<Self::Item>> {
        self.rx.recv()
    }
}

pub struct Response {
    status: StatusCode,
    reason: SmolStr,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
    length_hint: Option<u64>,
    effective_uri: Uri,
}

impl Response {
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// "1.0", "1.1" or "2".
    pub fn protocol_version(&self) -> &'static str {
        match self.version {
            Version::HTTP_2 => "2",
            Version::HTTP_11 => "1.1",
            _ => "1.0",
        }
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    #[inline]
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    #[inline]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Buffered body bytes; `None` for streaming responses.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Buffered(b) => Some(b),
            ResponseBody::Stream(_) => None,
        }
    }

    /// Expected body size: 0 when the exchange cannot carry a body, otherwise the
    /// advertised content length.
    #[inline]
    pub fn length_hint(&self) -> Option<u64> {
        self.length_hint
    }

    #[inline]
    pub fn effective_uri(&self) -> &Uri {
        &self.effective_uri
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status.as_u16())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

/// Headers and reason phrase recovered from a raw header block.
#[derive(Debug, Default)]
pub(crate) struct ParsedHead {
    pub reason: Option<SmolStr>,
    pub headers: HeaderMap,
}

/// Parse the raw header bytes a transport emitted.
///
/// Lines without a colon (status lines) are skipped. When redirects were
/// followed, a blank line marks the start of the next hop and everything
/// collected so far is dropped, so only the final hop survives.
pub(crate) fn parse_header_block(raw: &[u8], redirect_count: u32) -> ParsedHead {
    let mut head = ParsedHead::default();
    let text = String::from_utf8_lossy(raw);
    for line in text.trim().split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if redirect_count > 0 {
                head.headers.clear();
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            if line.starts_with("HTTP/") {
                head.reason = status_line_reason(line);
            }
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) else {
            #[cfg(feature = "logging")]
            tracing::debug!("dropping malformed response header line {:?}", line);
            continue;
        };
        head.headers.append(name, value);
    }
    head
}

/// Status and version of the last status line in a raw header block, plus how
/// many status lines came before it.
pub(crate) fn last_status(raw: &[u8]) -> Option<(StatusCode, Version, u32)> {
    let text = String::from_utf8_lossy(raw);
    let mut found = None;
    let mut hops = 0u32;
    for line in text.split('\n').filter(|l| l.starts_with("HTTP/")) {
        let mut parts = line.split_whitespace();
        let version = match parts.next()? {
            "HTTP/1.0" => Version::HTTP_10,
            "HTTP/2" | "HTTP/2.0" => Version::HTTP_2,
            _ => Version::HTTP_11,
        };
        let Some(status) = parts.next().and_then(|s| s.parse::<StatusCode>().ok()) else {
            continue;
        };
        if found.is_some() {
            hops += 1;
        }
        found = Some((status, version));
    }
    found.map(|(status, version)| (status, version, hops))
}

fn status_line_reason(line: &str) -> Option<SmolStr> {
    let mut parts = line.splitn(3, ' ');
    parts.next()?;
    parts.next()?;
    parts
        .next()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(SmolStr::from)
}

fn append_diagnostics(headers: &mut HeaderMap, info: &TransferInfo) {
    let t = &info.timing;
    for (key, dur) in [
        ("namelookup_time", t.namelookup),
        ("connect_time", t.connect),
        ("appconnect_time", t.appconnect),
        ("pretransfer_time", t.pretransfer),
        ("redirect_time", t.redirect),
        ("starttransfer_time", t.starttransfer),
        ("total_time", t.total),
    ] {
        let value = format!("{key};dur={:.6}", dur.as_secs_f64());
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(SERVER_TIMING, value);
        }
    }

    let total = t.total.as_secs_f64();
    let speed = |size: u64| {
        if total > 0.0 {
            (size as f64 / total) as u64
        } else {
            0
        }
    };
    let upload_size = info.request_size + info.upload_size;
    let download_size = info.header_size + info.download_size;
    for value in [
        format!("effective_url={}", info.effective_uri),
        format!("connection;count={}", info.num_connects),
        format!("redirect;count={}", info.redirect_count),
        format!("upload;size={upload_size};speed={}", speed(info.upload_size)),
        format!("download;size={download_size};speed={}", speed(info.download_size)),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(X_CONNECTION, value);
        }
    }
}

fn length_hint(method: &Method, status: StatusCode, headers: &HeaderMap) -> Option<u64> {
    let code = status.as_u16();
    if method == Method::HEAD || (100..200).contains(&code) || code == 204 || code == 304 {
        return Some(0);
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Build the caller facing response of a finished transfer.
pub(crate) fn assemble(
    raw_headers: &[u8],
    info: &TransferInfo,
    body: ResponseBody,
    diagnostics: bool,
) -> Response {
    let ParsedHead {
        reason,
        mut headers,
    } = parse_header_block(raw_headers, info.redirect_count);
    let length_hint = length_hint(&info.effective_method, info.status, &headers);
    if diagnostics {
        append_diagnostics(&mut headers, info);
    }
    let reason = reason.unwrap_or_else(|| {
        SmolStr::new(info.status.canonical_reason().unwrap_or_default())
    });
    Response {
        status: info.status,
        reason,
        version: info.version,
        headers,
        body,
        length_hint,
        effective_uri: info.effective_uri.clone(),
    }
}
