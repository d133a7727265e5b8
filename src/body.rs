//! Request bodies.
//!
//! A streamed upload is produced through a [`BodyWriter`] and consumed through the
//! matching [`PushBody`]. Data is pushed to whoever subscribed to the body; the
//! subscriber answers backpressure by pausing the body, which the producer observes
//! via [`BodyWriter::is_paused`] or by awaiting [`BodyWriter::ready`].
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use monoio::io::stream::Stream;

/// A producer that can be asked to stop and restart emitting data.
pub trait PausableSource {
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
}

/// Receives the events of a [`PushBody`].
pub trait StreamListener {
    fn on_data(&self, data: Bytes);
    fn on_close(&self);
}

#[derive(Default)]
struct PushInner {
    listener: Option<Weak<dyn StreamListener>>,
    backlog: VecDeque<Bytes>,
    paused: bool,
    closed: bool,
    close_delivered: bool,
    pauses: u64,
    waiters: Vec<Waker>,
}

impl PushInner {
    fn wake_all(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }
}

/// Create a connected producer/consumer pair for a streamed request body.
pub fn push_body() -> (BodyWriter, PushBody) {
    let inner = Rc::new(RefCell::new(PushInner::default()));
    (
        BodyWriter {
            inner: inner.clone(),
            _guard: Rc::new(CloseGuard(Rc::downgrade(&inner))),
        },
        PushBody { inner },
    )
}

fn close_inner(inner: &Rc<RefCell<PushInner>>) {
    let listener = {
        let mut inner = inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.wake_all();
        match inner.listener.as_ref().and_then(Weak::upgrade) {
            Some(listener) if inner.backlog.is_empty() => {
                inner.close_delivered = true;
                listener
            }
            _ => return,
        }
    };
    listener.on_close();
}

// Closes the body once the last writer clone goes away.
struct CloseGuard(Weak<RefCell<PushInner>>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            close_inner(&inner);
        }
    }
}

/// Producer half of a streamed body. The body is closed when the last clone is
/// dropped.
#[derive(Clone)]
pub struct BodyWriter {
    inner: Rc<RefCell<PushInner>>,
    _guard: Rc<CloseGuard>,
}

impl BodyWriter {
    /// Emit a chunk. Returns `false` when the consumer asked the producer to pause;
    /// the chunk is still accepted, further writes should wait for [`Self::ready`].
    pub fn write(&self, data: impl Into<Bytes>) -> bool {
        let data = data.into();
        let listener = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return false;
            }
            match inner.listener.as_ref().and_then(Weak::upgrade) {
                Some(listener) => listener,
                None => {
                    if !data.is_empty() {
                        inner.backlog.push_back(data);
                    }
                    return !inner.paused;
                }
            }
        };
        listener.on_data(data);
        !self.is_paused()
    }

    /// Signal end of data.
    pub fn close(&self) {
        close_inner(&self.inner);
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.inner.borrow().paused
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// How many times the consumer paused this producer.
    #[inline]
    pub fn pause_count(&self) -> u64 {
        self.inner.borrow().pauses
    }

    /// Resolves once the producer may write again (or the body is closed).
    pub fn ready(&self) -> Ready {
        Ready {
            inner: self.inner.clone(),
        }
    }

    /// Drive `stream` into this body honoring backpressure, then close it.
    pub async fn pipe_from<S>(self, mut stream: S)
    where
        S: Stream<Item = Bytes>,
    {
        while let Some(chunk) = stream.next().await {
            self.ready().await;
            if self.is_closed() {
                return;
            }
            self.write(chunk);
        }
        self.close();
    }
}

impl fmt::Debug for BodyWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(
            f,
            "BodyWriter, paused: {}, closed: {}",
            inner.paused, inner.closed
        )
    }
}

/// Future returned by [`BodyWriter::ready`].
pub struct Ready {
    inner: Rc<RefCell<PushInner>>,
}

impl Future for Ready {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.paused || inner.closed {
            return Poll::Ready(());
        }
        inner.waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

/// Consumer half of a streamed body.
pub struct PushBody {
    inner: Rc<RefCell<PushInner>>,
}

impl PushBody {
    /// Attach `listener`. Data written before the subscription is replayed to it
    /// immediately, followed by the close event if the producer already finished.
    pub fn subscribe(&self, listener: Weak<dyn StreamListener>) {
        let Some(strong) = listener.upgrade() else {
            return;
        };
        let (backlog, closed) = {
            let mut inner = self.inner.borrow_mut();
            inner.listener = Some(listener);
            let closed = inner.closed && !inner.close_delivered;
            inner.close_delivered |= closed;
            (std::mem::take(&mut inner.backlog), closed)
        };
        for data in backlog {
            strong.on_data(data);
        }
        if closed {
            strong.on_close();
        }
    }

    /// Drop the subscription. Pending producers are released.
    pub fn unsubscribe(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.listener = None;
        inner.paused = false;
        inner.wake_all();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }
}

impl PausableSource for PushBody {
    fn pause(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.paused {
            inner.paused = true;
            inner.pauses += 1;
        }
    }

    fn resume(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.paused {
            inner.paused = false;
            inner.wake_all();
        }
    }

    #[inline]
    fn is_paused(&self) -> bool {
        self.inner.borrow().paused
    }
}

impl fmt::Debug for PushBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PushBody, closed: {}", self.is_closed())
    }
}

/// Body of a request.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Full(Bytes),
    Stream(PushBody),
}

impl RequestBody {
    #[inline]
    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream(_))
    }
}

impl From<Bytes> for RequestBody {
    #[inline]
    fn from(value: Bytes) -> Self {
        if value.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Full(value)
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    #[inline]
    fn from(value: Vec<u8>) -> Self {
        Bytes::from(value).into()
    }
}

impl From<String> for RequestBody {
    #[inline]
    fn from(value: String) -> Self {
        Bytes::from(value).into()
    }
}

impl From<&'static str> for RequestBody {
    #[inline]
    fn from(value: &'static str) -> Self {
        Bytes::from_static(value.as_bytes()).into()
    }
}

impl From<&'static [u8]> for RequestBody {
    #[inline]
    fn from(value: &'static [u8]) -> Self {
        Bytes::from_static(value).into()
    }
}

impl From<PushBody> for RequestBody {
    #[inline]
    fn from(value: PushBody) -> Self {
        RequestBody::Stream(value)
    }
}

impl From<()> for RequestBody {
    #[inline]
    fn from(_: ()) -> Self {
        RequestBody::Empty
    }
}
