//! Adapter from a push driven request body to the pull driven transport.
//!
//! The bridge subscribes to a [`PushBody`] and copies every chunk into a bounded
//! FIFO channel. The transport pulls from the other end of that channel through a
//! [`BridgeReader`]. Flow control runs both ways:
//!
//! - channel full: the producer is paused and the unaccepted bytes stay in the
//!   bridge until the channel drains below half capacity.
//! - channel empty: the transport's send side is paused and the producer is
//!   nudged to emit more.
//! - channel non-empty again: the transport's send side continues.
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use bytes::{Bytes, BytesMut};

use crate::{
    body::{PausableSource, PushBody, StreamListener},
    error::FifoError,
    fifo::{ChannelKey, ChannelStats, FifoObserver, FifoReader, FifoRegistry, FifoWriter, Pull},
    transport::{TransferControl, UploadSource},
};

struct BridgeState {
    key: ChannelKey,
    writer: RefCell<Option<FifoWriter>>,
    pending: RefCell<BytesMut>,
    pending_close: Cell<bool>,
    finished: Cell<bool>,
    source: PushBody,
    control: TransferControl,
}

impl BridgeState {
    /// Move buffered bytes into the channel and settle the producer accordingly.
    fn flush(&self) {
        if self.finished.get() {
            return;
        }
        let drained = {
            let mut writer = self.writer.borrow_mut();
            let Some(writer) = writer.as_mut() else {
                return;
            };
            let mut pending = self.pending.borrow_mut();
            if !pending.is_empty() {
                let accepted = writer.push(&pending);
                let _ = pending.split_to(accepted);
            }
            pending.is_empty()
        };

        if !drained {
            self.source.pause();
            return;
        }
        if self.pending_close.get() {
            self.finish();
        } else if self.source.is_paused() {
            self.source.resume();
        }
    }

    fn finish(&self) {
        if self.finished.replace(true) {
            return;
        }
        if let Some(writer) = self.writer.borrow_mut().take() {
            writer.close();
        }
        #[cfg(feature = "logging")]
        tracing::debug!("upload bridge {} flushed and closed", self.key);
        // A consumer parked on an empty channel must observe the end of data.
        self.control.continue_send();
        self.source.unsubscribe();
    }

    fn teardown(&self) {
        self.finished.set(true);
        self.pending.borrow_mut().clear();
        drop(self.writer.borrow_mut().take());
        self.source.unsubscribe();
    }
}

impl StreamListener for BridgeState {
    fn on_data(&self, data: Bytes) {
        if self.finished.get() || data.is_empty() {
            return;
        }
        self.pending.borrow_mut().extend_from_slice(&data);
        self.flush();
    }

    fn on_close(&self) {
        self.pending_close.set(true);
        self.flush();
    }
}

// Registered on the write handle, so it goes quiet once the writer closes.
struct BridgeSignals {
    state: Weak<BridgeState>,
    control: TransferControl,
}

impl FifoObserver for BridgeSignals {
    fn on_available(&self, _key: ChannelKey) {
        self.control.continue_send();
    }

    fn on_drain(&self, _key: ChannelKey) {
        if let Some(state) = self.state.upgrade() {
            state.flush();
        }
    }

    fn on_empty(&self, _key: ChannelKey) {
        self.control.pause_send();
        if let Some(state) = self.state.upgrade() {
            state.flush();
        }
    }
}

/// Owns the producer subscription and the write side of the channel.
///
/// Dropping the bridge detaches from the producer and abandons unsent data.
pub struct UploadBridge {
    state: Rc<BridgeState>,
    registry: FifoRegistry,
}

impl UploadBridge {
    /// Subscribe to `source` and return the bridge plus the pull handle for the
    /// transport. `max_blocks` bounds the channel capacity.
    pub fn new(
        registry: &FifoRegistry,
        source: PushBody,
        control: TransferControl,
        max_blocks: usize,
    ) -> (Self, BridgeReader) {
        let key = registry.allocate_key();
        let reader = registry.open_reader(key, max_blocks, None);
        let state = Rc::new(BridgeState {
            key,
            writer: RefCell::new(None),
            pending: RefCell::new(BytesMut::new()),
            pending_close: Cell::new(false),
            finished: Cell::new(false),
            source,
            control: control.clone(),
        });
        let signals = Rc::new(BridgeSignals {
            state: Rc::downgrade(&state),
            control,
        });
        let writer = registry.open_writer(key, max_blocks, Some(signals));
        *state.writer.borrow_mut() = Some(writer);

        let listener: Rc<dyn StreamListener> = state.clone();
        state.source.subscribe(Rc::downgrade(&listener));

        (
            Self {
                state,
                registry: registry.clone(),
            },
            BridgeReader { reader },
        )
    }

    #[inline]
    pub fn key(&self) -> ChannelKey {
        self.state.key
    }

    pub fn stats(&self) -> Option<ChannelStats> {
        self.registry.stats(self.state.key)
    }

    /// Bytes accepted from the producer but not yet queued in the channel.
    #[inline]
    pub fn backlog(&self) -> usize {
        self.state.pending.borrow().len()
    }

    /// Whether the producer closed and everything reached the channel.
    #[inline]
    pub fn is_flushed(&self) -> bool {
        self.state.finished.get() && self.state.pending_close.get()
    }
}

impl Drop for UploadBridge {
    fn drop(&mut self) {
        self.state.teardown();
    }
}

impl fmt::Debug for UploadBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UploadBridge, key: {}, backlog: {}",
            self.state.key,
            self.backlog()
        )
    }
}

/// Pull side of an [`UploadBridge`], handed to the transport.
pub struct BridgeReader {
    reader: FifoReader,
}

impl BridgeReader {
    #[inline]
    pub fn key(&self) -> ChannelKey {
        self.reader.key()
    }
}

impl UploadSource for BridgeReader {
    #[inline]
    fn pull(&mut self, max: usize) -> Pull {
        self.reader.pull(max)
    }

    #[inline]
    fn close(&mut self) -> Result<(), FifoError> {
        self.reader.close()
    }
}

impl fmt::Debug for BridgeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BridgeReader, key: {}", self.reader.key())
    }
}
