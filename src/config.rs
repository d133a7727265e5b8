use std::{path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{fifo::DEFAULT_MAX_BLOCKS, transport::TransferOptions};

/// Default ceiling for buffered response bodies: 16 MiB.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_REDIRECTS: u32 = 20;
pub const DEFAULT_USER_AGENT: &str = concat!("monoio-multi-http/", env!("CARGO_PKG_VERSION"));

/// Preferred protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum HttpVersionPref {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "1.0")]
    Http10,
    #[serde(rename = "1.1")]
    Http11,
    #[serde(rename = "2")]
    Http2,
}

impl FromStr for HttpVersionPref {
    type Err = std::convert::Infallible;

    /// Unknown strings mean "let the transport decide".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "1.0" => HttpVersionPref::Http10,
            "1.1" => HttpVersionPref::Http11,
            "2" | "2.0" => HttpVersionPref::Http2,
            _ => HttpVersionPref::Auto,
        })
    }
}

// Same leniency as `FromStr`: unknown versions fall back to `Auto`.
impl<'de> Deserialize<'de> for HttpVersionPref {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let version = String::deserialize(d)?;
        Ok(version.as_str().into())
    }
}

impl From<&str> for HttpVersionPref {
    #[inline]
    fn from(value: &str) -> Self {
        match value.parse() {
            Ok(v) => v,
            Err(e) => match e {},
        }
    }
}

/// Redirect policy accepted by [`MultiClient::with_follow_redirects`](crate::MultiClient::with_follow_redirects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowRedirects {
    No,
    /// Follow without a hop limit.
    Unlimited,
    Max(u32),
}

impl From<bool> for FollowRedirects {
    #[inline]
    fn from(value: bool) -> Self {
        if value {
            FollowRedirects::Unlimited
        } else {
            FollowRedirects::No
        }
    }
}

impl From<u32> for FollowRedirects {
    #[inline]
    fn from(value: u32) -> Self {
        FollowRedirects::Max(value)
    }
}

/// Per client settings. Immutable once a client is built; derive a new client
/// with the `with_*` builders instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Total transfer budget, `None` means unlimited.
    #[serde(with = "secs")]
    pub timeout: Option<Duration>,
    #[serde(with = "secs")]
    pub connect_timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub max_redirects: Option<u32>,
    pub max_response_size: usize,
    pub streaming: bool,
    pub reject_error_response: bool,
    pub http_version: HttpVersionPref,
    pub default_headers: Vec<(String, String)>,
    pub disable_connection_cache: bool,
    pub upload_buffer_blocks: usize,
    pub diagnostic_headers: bool,
    pub unix_socket: Option<PathBuf>,
    /// Cap on concurrently registered transfers, `None` means unlimited.
    /// Applied to the transport [`MultiClient::from_config`](crate::MultiClient::from_config) builds.
    pub max_transfers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: None,
            follow_redirects: true,
            max_redirects: Some(DEFAULT_MAX_REDIRECTS),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            streaming: false,
            reject_error_response: true,
            http_version: HttpVersionPref::Auto,
            default_headers: vec![("user-agent".to_string(), DEFAULT_USER_AGENT.to_string())],
            disable_connection_cache: false,
            upload_buffer_blocks: DEFAULT_MAX_BLOCKS,
            diagnostic_headers: true,
            unix_socket: None,
            max_transfers: None,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Set the timeout in seconds. Zero or negative values disable the budget,
    /// as do NaN and infinity.
    pub fn set_timeout_secs(&mut self, secs: f64) {
        self.timeout = if secs.is_finite() && secs > 0.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        };
    }

    pub fn set_follow_redirects(&mut self, policy: FollowRedirects) {
        match policy {
            FollowRedirects::No => self.follow_redirects = false,
            FollowRedirects::Unlimited => {
                self.follow_redirects = true;
                self.max_redirects = None;
            }
            FollowRedirects::Max(max) => {
                self.follow_redirects = max > 0;
                self.max_redirects = Some(max);
            }
        }
    }

    /// Replace or add a default header. Names are case-insensitive.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        self.default_headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.default_headers.push((name, value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.default_headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub(crate) fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            timeout: self.timeout,
            connect_timeout: self.connect_timeout,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            http_version: self.http_version,
            fresh_connect: self.disable_connection_cache,
            forbid_reuse: self.disable_connection_cache,
            unix_socket: self.unix_socket.clone(),
        }
    }
}

// Durations travel as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64))
    }
}
