//! HTTP/1.x request serialisation and incremental response parsing.
use bytes::{Buf, Bytes, BytesMut};
use http::{
    header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    uri::{Parts, PathAndQuery, Scheme},
    HeaderMap, Method, StatusCode, Uri, Version,
};

use crate::error::TransportError;

/// Upper bound for a response head; anything larger is treated as garbage.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestFraming {
    None,
    Length(u64),
    Chunked,
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Read until the peer closes; the connection cannot be reused.
    Close,
}

fn default_port(scheme: Option<&Scheme>) -> u16 {
    match scheme {
        Some(s) if s == &Scheme::HTTPS => 443,
        _ => 80,
    }
}

/// `host[:port]` for the `Host` header, omitting the scheme's default port.
pub(crate) fn host_header(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    Some(match uri.port_u16() {
        Some(port) if port != default_port(uri.scheme()) => format!("{host}:{port}"),
        _ => host.to_string(),
    })
}

pub(crate) fn encode_request_head(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    version: Version,
    framing: RequestFraming,
) -> Vec<u8> {
    let mut req = Vec::with_capacity(256);
    req.extend_from_slice(method.as_str().as_bytes());
    req.push(b' ');
    let target = uri.path_and_query().map(PathAndQuery::as_str).unwrap_or("/");
    req.extend_from_slice(if target.is_empty() { "/" } else { target }.as_bytes());
    req.extend_from_slice(if version == Version::HTTP_10 {
        b" HTTP/1.0\r\n"
    } else {
        b" HTTP/1.1\r\n"
    });

    if !headers.contains_key(HOST) {
        if let Some(host) = host_header(uri) {
            req.extend_from_slice(b"host: ");
            req.extend_from_slice(host.as_bytes());
            req.extend_from_slice(b"\r\n");
        }
    }

    for (name, value) in headers {
        // Framing is ours to decide.
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        req.extend_from_slice(name.as_str().as_bytes());
        req.extend_from_slice(b": ");
        req.extend_from_slice(value.as_bytes());
        req.extend_from_slice(b"\r\n");
    }

    match framing {
        RequestFraming::None => {}
        RequestFraming::Length(len) => {
            req.extend_from_slice(b"content-length: ");
            req.extend_from_slice(len.to_string().as_bytes());
            req.extend_from_slice(b"\r\n");
        }
        RequestFraming::Chunked => req.extend_from_slice(b"transfer-encoding: chunked\r\n"),
    }
    req.extend_from_slice(b"\r\n");
    req
}

/// Frame one chunk of a chunked request body.
pub(crate) fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub keep_alive: bool,
    pub location: Option<String>,
}

impl ResponseHead {
    pub fn framing(&self, method: &Method) -> ResponseFraming {
        let code = self.status.as_u16();
        if method == Method::HEAD || (100..200).contains(&code) || code == 204 || code == 304 {
            return ResponseFraming::Empty;
        }
        if self.chunked {
            return ResponseFraming::Chunked;
        }
        match self.content_length {
            Some(0) => ResponseFraming::Empty,
            Some(len) => ResponseFraming::Length(len),
            None => ResponseFraming::Close,
        }
    }

    #[inline]
    pub fn is_redirect(&self) -> bool {
        matches!(self.status.as_u16(), 301 | 302 | 303 | 307 | 308) && self.location.is_some()
    }
}

fn protocol(e: httparse::Error) -> TransportError {
    TransportError::Protocol(format!("malformed response: {e}"))
}

/// Parse a response head from the front of `data`. Returns the head and its
/// length including the terminating blank line, or `None` while incomplete.
pub(crate) fn parse_response_head(
    data: &[u8],
) -> Result<Option<(ResponseHead, usize)>, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let end = match resp.parse(data).map_err(protocol)? {
        httparse::Status::Complete(end) => end,
        httparse::Status::Partial => return Ok(None),
    };

    let version = match resp.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let status = resp
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| TransportError::Protocol("bad status code".into()))?;

    let mut head = ResponseHead {
        status,
        version,
        content_length: None,
        chunked: false,
        keep_alive: version == Version::HTTP_11,
        location: None,
    };
    for header in resp.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| {
                TransportError::Protocol(format!("non-ascii value in header {}", header.name))
            })?
            .trim();
        let name = header.name;
        if name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()) {
            head.content_length = Some(value.parse().map_err(|_| {
                TransportError::Protocol(format!("bad content-length {value:?}"))
            })?);
        } else if name.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str()) {
            head.chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("chunked"));
        } else if name.eq_ignore_ascii_case(CONNECTION.as_str()) {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    head.keep_alive = false;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    head.keep_alive = true;
                }
            }
        } else if name.eq_ignore_ascii_case("location") {
            head.location = Some(value.to_string());
        }
    }
    Ok(Some((head, end)))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    Data(Bytes),
    NeedMore,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for chunked bodies. Chunk payloads are emitted as soon as
/// any part of them is buffered.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }
}

impl ChunkedDecoder {
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, TransportError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let (consumed, size) = match httparse::parse_chunk_size(buf) {
                        Ok(httparse::Status::Complete(parsed)) => parsed,
                        Ok(httparse::Status::Partial) => {
                            if buf.len() > MAX_CHUNK_LINE {
                                return Err(TransportError::Protocol(
                                    "chunk size line too long".into(),
                                ));
                            }
                            return Ok(Decoded::NeedMore);
                        }
                        Err(_) => return Err(TransportError::Protocol("bad chunk size".into())),
                    };
                    buf.advance(consumed);
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64);
                    let data = buf.split_to(take as usize).freeze();
                    self.state = if take == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - take)
                    };
                    return Ok(Decoded::Data(data));
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(TransportError::Protocol("missing chunk terminator".into()));
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    // Trailer fields are read and discarded.
                    let mut trailers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    match httparse::parse_headers(buf, &mut trailers).map_err(protocol)? {
                        httparse::Status::Complete((consumed, _)) => {
                            buf.advance(consumed);
                            self.state = ChunkState::Done;
                        }
                        httparse::Status::Partial => return Ok(Decoded::NeedMore),
                    }
                }
                ChunkState::Done => return Ok(Decoded::Done),
            }
        }
    }
}

/// Resolve a `Location` header against the URI that produced it.
pub(crate) fn resolve_location(base: &Uri, location: &str) -> Result<Uri, TransportError> {
    let bad = || TransportError::Protocol(format!("bad redirect location {location:?}"));
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Ok(uri);
        }
    }
    let scheme = base.scheme().cloned().unwrap_or(Scheme::HTTP);
    if let Some(rest) = location.strip_prefix("//") {
        return format!("{scheme}://{rest}").parse().map_err(|_| bad());
    }

    let path = if location.starts_with('/') {
        location.to_string()
    } else {
        let base_path = base.path();
        let dir = &base_path[..base_path.rfind('/').map_or(0, |i| i + 1)];
        format!("{}{}", if dir.is_empty() { "/" } else { dir }, location)
    };
    let mut parts = Parts::default();
    parts.scheme = Some(scheme);
    parts.authority = base.authority().cloned();
    parts.path_and_query = Some(path.parse().map_err(|_| bad())?);
    Uri::from_parts(parts).map_err(|_| bad())
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn request_head_layout() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", HeaderValue::from_static("1"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
        let uri = Uri::from_static("http://example.com:8080/a?b=c");
        let head = encode_request_head(
            &Method::POST,
            &uri,
            &headers,
            Version::HTTP_11,
            RequestFraming::Length(3),
        );
        assert_eq!(
            head,
            b"POST /a?b=c HTTP/1.1\r\nhost: example.com:8080\r\nx-test: 1\r\ncontent-length: 3\r\n\r\n"
        );

        let uri = Uri::from_static("https://example.com:443");
        let head = encode_request_head(
            &Method::GET,
            &uri,
            &HeaderMap::new(),
            Version::HTTP_10,
            RequestFraming::None,
        );
        assert_eq!(head, b"GET / HTTP/1.0\r\nhost: example.com\r\n\r\n");
    }

    #[test]
    fn parse_head_and_framing() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
        assert!(parse_response_head(&raw[..20]).unwrap().is_none());
        let (head, end) = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(&raw[end..], b"hello");
        assert_eq!(head.status, StatusCode::OK);
        assert!(!head.keep_alive);
        assert_eq!(head.framing(&Method::GET), ResponseFraming::Length(5));
        assert_eq!(head.framing(&Method::HEAD), ResponseFraming::Empty);

        let (head, _) = parse_response_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap().unwrap();
        assert!(!head.keep_alive);
        assert_eq!(head.framing(&Method::GET), ResponseFraming::Close);

        let (head, _) =
            parse_response_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n")
                .unwrap()
                .unwrap();
        assert_eq!(head.framing(&Method::GET), ResponseFraming::Chunked);

        assert!(parse_response_head(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
    }

    #[test]
    fn chunked_decoder_streams_partial_chunks() {
        let mut decoder = ChunkedDecoder::default();
        let mut buf = BytesMut::from(&b"5;ext=1\r\nhel"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Decoded::Data(Bytes::from_static(b"hel"))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::NeedMore);
        buf.extend_from_slice(b"lo\r\n0\r\nx-trailer: 1\r\n\r\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Decoded::Data(Bytes::from_static(b"lo"))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::Done);
        assert!(buf.is_empty());

        let mut decoder = ChunkedDecoder::default();
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn chunk_encoding() {
        assert_eq!(encode_chunk(b"hello world!"), b"c\r\nhello world!\r\n");
    }

    #[test]
    fn redirect_locations() {
        let base = Uri::from_static("https://example.com/a/b?x=1");
        assert_eq!(
            resolve_location(&base, "http://other.org/z").unwrap(),
            "http://other.org/z"
        );
        assert_eq!(
            resolve_location(&base, "/root").unwrap(),
            "https://example.com/root"
        );
        assert_eq!(
            resolve_location(&base, "c?y=2").unwrap(),
            "https://example.com/a/c?y=2"
        );
        assert_eq!(
            resolve_location(&base, "//cdn.example.com/s").unwrap(),
            "https://cdn.example.com/s"
        );
    }
}
