mod error;
pub use error::{Error, FifoError, Result, TransportError};

pub mod body;
mod client;
pub mod config;
pub mod fifo;
pub mod response;
mod transaction;
pub mod transport;
pub mod upload;

pub use body::{push_body, BodyWriter, PausableSource, PushBody, RequestBody};
pub use client::{MultiClient, ResponseFuture};
pub use config::{Config, FollowRedirects, HttpVersionPref};
pub use response::{BodyStream, Response, ResponseBody};
pub use transaction::TransferStatus;
