use std::{
    fmt::{self, Debug, Display},
    future::Future,
    io,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use http::{uri::Scheme, Uri};
use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{AsyncReadRent, AsyncWriteRent, Split},
    net::{TcpStream, UnixStream},
    BufResult,
};
use monoio_rustls::TlsConnector as MonoioTlsConnector;
use rustls::pki_types::ServerName;
use smol_str::SmolStr;

use crate::error::TransportError;

pub type TlsStream<C> = monoio_rustls::ClientTlsStream<C>;

pub trait Connector<K> {
    type Connection;
    type Error;

    fn connect(&self, key: K) -> impl Future<Output = Result<Self::Connection, Self::Error>>;
}

pub trait ConnectorExt<K>: Connector<K> {
    fn connect_with_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> impl Future<Output = Result<Result<Self::Connection, Self::Error>, monoio::time::error::Elapsed>>;
}

impl<K, T: Connector<K>> ConnectorExt<K> for T {
    #[inline]
    fn connect_with_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> impl Future<Output = Result<Result<Self::Connection, Self::Error>, monoio::time::error::Elapsed>>
    {
        monoio::time::timeout(timeout, self.connect(key))
    }
}

#[derive(Default, Clone, Copy, Debug)]
pub struct TcpConnector {
    pub no_delay: bool,
}

impl<T: ToSocketAddrs> Connector<T> for TcpConnector {
    type Connection = TcpStream;
    type Error = io::Error;

    #[inline]
    async fn connect(&self, key: T) -> Result<Self::Connection, Self::Error> {
        TcpStream::connect(key).await.map(|io| {
            if self.no_delay {
                // we will ignore the set nodelay error
                let _ = io.set_nodelay(true);
            }
            io
        })
    }
}

#[derive(Default, Clone, Copy, Debug)]
pub struct UnixConnector;

impl<P: AsRef<Path>> Connector<P> for UnixConnector {
    type Connection = UnixStream;
    type Error = io::Error;

    #[inline]
    async fn connect(&self, key: P) -> Result<Self::Connection, Self::Error> {
        UnixStream::connect(key).await
    }
}

/// rustls client handshaker with the webpki root store.
#[derive(Clone)]
pub struct TlsConnector {
    tls_connector: MonoioTlsConnector,
}

impl Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlsConnector")
    }
}

impl TlsConnector {
    pub const fn new(tls_connector: MonoioTlsConnector) -> Self {
        Self { tls_connector }
    }

    /// `resumption = false` disables TLS session tickets and ids.
    pub fn new_with_tls_default(alpn: Option<Vec<&str>>, resumption: bool) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut cfg = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        // Set ALPN from client side
        if let Some(alpn) = alpn {
            cfg.alpn_protocols = alpn.iter().map(|a| a.as_bytes().to_vec()).collect();
        }
        if !resumption {
            cfg.resumption = rustls::client::Resumption::disabled();
        }

        Self::new(cfg.into())
    }

    #[inline]
    pub async fn handshake<S: AsyncReadRent + AsyncWriteRent>(
        &self,
        sn: ServerName<'static>,
        stream: S,
    ) -> Result<TlsStream<S>, TransportError> {
        Ok(self.tls_connector.connect(sn, stream).await?)
    }
}

impl Default for TlsConnector {
    #[inline]
    fn default() -> Self {
        Self::new_with_tls_default(Some(vec!["http/1.1"]), true)
    }
}

/// Where a request goes: the origin's host and port, an optional TLS server name
/// and an optional Unix socket that replaces the TCP dial.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: SmolStr,
    pub port: u16,
    pub sn: Option<ServerName<'static>>,
    pub unix: Option<PathBuf>,
}

impl Endpoint {
    pub fn from_uri(uri: &Uri, unix: Option<&Path>) -> Result<Self, TransportError> {
        let host = match uri.host() {
            Some(h) if !h.is_empty() => h.trim_start_matches('[').trim_end_matches(']'),
            _ => return Err(TransportError::UnsupportedUrl(uri.to_string())),
        };
        let (tls, default_port) = match uri.scheme() {
            Some(scheme) if scheme == &Scheme::HTTP => (false, 80),
            Some(scheme) if scheme == &Scheme::HTTPS => (true, 443),
            _ => return Err(TransportError::UnsupportedUrl(uri.to_string())),
        };
        let host = SmolStr::from(host);
        let port = uri.port_u16().unwrap_or(default_port);
        let sn = if tls {
            Some(ServerName::try_from(host.to_string())?)
        } else {
            None
        };
        Ok(Self {
            host,
            port,
            sn,
            unix: unix.map(Path::to_path_buf),
        })
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.sn.is_some()
    }
}

impl TryFrom<&Uri> for Endpoint {
    type Error = TransportError;

    #[inline]
    fn try_from(uri: &Uri) -> Result<Self, Self::Error> {
        Self::from_uri(uri, None)
    }
}

impl ToSocketAddrs for Endpoint {
    type Iter = <(&'static str, u16) as ToSocketAddrs>::Iter;

    #[inline]
    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.is_tls() { "https" } else { "http" };
        match &self.unix {
            Some(path) => write!(f, "{scheme}://{}:{} via {:?}", self.host, self.port, path),
            None => write!(f, "{scheme}://{}:{}", self.host, self.port),
        }
    }
}

/// A plain or TLS connection over TCP or a Unix socket.
pub enum MaybeTlsStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    TcpTls(TlsStream<TcpStream>),
    UnixTls(TlsStream<UnixStream>),
}

impl Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(_) => write!(f, "Tcp"),
            Self::Unix(_) => write!(f, "Unix"),
            Self::TcpTls(_) => write!(f, "TcpTls"),
            Self::UnixTls(_) => write!(f, "UnixTls"),
        }
    }
}

impl AsyncReadRent for MaybeTlsStream {
    #[inline]
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            Self::Tcp(s) => s.read(buf).await,
            Self::Unix(s) => s.read(buf).await,
            Self::TcpTls(s) => s.read(buf).await,
            Self::UnixTls(s) => s.read(buf).await,
        }
    }

    #[inline]
    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            Self::Tcp(s) => s.readv(buf).await,
            Self::Unix(s) => s.readv(buf).await,
            Self::TcpTls(s) => s.readv(buf).await,
            Self::UnixTls(s) => s.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for MaybeTlsStream {
    #[inline]
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            Self::Tcp(s) => s.write(buf).await,
            Self::Unix(s) => s.write(buf).await,
            Self::TcpTls(s) => s.write(buf).await,
            Self::UnixTls(s) => s.write(buf).await,
        }
    }

    #[inline]
    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        match self {
            Self::Tcp(s) => s.writev(buf_vec).await,
            Self::Unix(s) => s.writev(buf_vec).await,
            Self::TcpTls(s) => s.writev(buf_vec).await,
            Self::UnixTls(s) => s.writev(buf_vec).await,
        }
    }

    #[inline]
    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush().await,
            Self::Unix(s) => s.flush().await,
            Self::TcpTls(s) => s.flush().await,
            Self::UnixTls(s) => s.flush().await,
        }
    }

    #[inline]
    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown().await,
            Self::Unix(s) => s.shutdown().await,
            Self::TcpTls(s) => s.shutdown().await,
            Self::UnixTls(s) => s.shutdown().await,
        }
    }
}

unsafe impl Split for MaybeTlsStream {}

/// A fresh connection plus how long each setup phase took, measured from the
/// start of the connect call.
#[derive(Debug)]
pub struct Connected {
    pub io: MaybeTlsStream,
    pub namelookup: Duration,
    pub connect: Duration,
    pub appconnect: Duration,
}

/// Dials an [`Endpoint`]: resolve, connect, then handshake when TLS is wanted.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    tcp: TcpConnector,
    unix: UnixConnector,
    tls: TlsConnector,
}

impl HttpConnector {
    pub fn new(tls: TlsConnector) -> Self {
        Self {
            tcp: TcpConnector { no_delay: true },
            unix: UnixConnector,
            tls,
        }
    }

    fn resolve(endpoint: &Endpoint) -> Result<Vec<SocketAddr>, TransportError> {
        let addrs: Vec<SocketAddr> = endpoint
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(endpoint.host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::Resolve(endpoint.host.to_string()));
        }
        Ok(addrs)
    }
}

impl Default for HttpConnector {
    #[inline]
    fn default() -> Self {
        Self::new(TlsConnector::default())
    }
}

impl Connector<&Endpoint> for HttpConnector {
    type Connection = Connected;
    type Error = TransportError;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, Self::Error> {
        let started = Instant::now();
        let mut namelookup = Duration::ZERO;
        let io = match &endpoint.unix {
            Some(path) => {
                let stream = self
                    .unix
                    .connect(path)
                    .await
                    .map_err(TransportError::Connect)?;
                let connect = started.elapsed();
                let io = match &endpoint.sn {
                    Some(sn) => MaybeTlsStream::UnixTls(self.tls.handshake(sn.clone(), stream).await?),
                    None => MaybeTlsStream::Unix(stream),
                };
                return Ok(Connected {
                    io,
                    namelookup,
                    connect,
                    appconnect: started.elapsed(),
                });
            }
            None => {
                let addrs = Self::resolve(endpoint)?;
                namelookup = started.elapsed();
                self.tcp
                    .connect(addrs.as_slice())
                    .await
                    .map_err(TransportError::Connect)?
            }
        };
        let connect = started.elapsed();
        let io = match &endpoint.sn {
            Some(sn) => MaybeTlsStream::TcpTls(self.tls.handshake(sn.clone(), io).await?),
            None => MaybeTlsStream::Tcp(io),
        };
        #[cfg(feature = "logging")]
        tracing::debug!("connected to {}", endpoint);
        Ok(Connected {
            io,
            namelookup,
            connect,
            appconnect: if endpoint.is_tls() {
                started.elapsed()
            } else {
                Duration::ZERO
            },
        })
    }
}
