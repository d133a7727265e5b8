//! Bounded, block structured byte FIFO.
//!
//! A channel is addressed by a [`ChannelKey`] inside a [`FifoRegistry`]. Producers
//! attach a [`FifoWriter`] and push bytes without ever blocking, consumers attach a
//! [`FifoReader`] and pull bytes without ever blocking. Capacity is counted in
//! blocks of [`BLOCK_SIZE`] bytes, which gives a cheap "how full am I" signal.
//!
//! Four edge triggered notifications are delivered to every attached
//! [`FifoObserver`]:
//!
//! - `on_full`: the write that made the queue reach capacity.
//! - `on_drain`: the read that brought a previously full queue to half capacity or
//!   below. The half way threshold keeps pause/resume from thrashing.
//! - `on_empty`: the read that took the last queued block.
//! - `on_available`: the write that made an empty queue non-empty.
//!
//! Observers are always invoked after the registry borrow is released, so they may
//! push or pull on the same channel.
use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt::{self, Display},
    rc::Rc,
};

use bytes::Bytes;

use crate::error::FifoError;

/// Size of one queued block. This is how much an upload reads per pull.
pub const BLOCK_SIZE: usize = 8192;
/// Default capacity: roughly 10 MB worth of blocks.
pub const DEFAULT_MAX_BLOCKS: usize = 10_000_000 / BLOCK_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(u64);

impl ChannelKey {
    #[inline]
    pub const fn new(key: u64) -> Self {
        Self(key)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fifo://{}", self.0)
    }
}

/// Flow control notifications of a channel. All methods default to no-ops.
pub trait FifoObserver {
    fn on_full(&self, _key: ChannelKey) {}
    fn on_drain(&self, _key: ChannelKey) {}
    fn on_empty(&self, _key: ChannelKey) {}
    fn on_available(&self, _key: ChannelKey) {}
}

/// Result of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    Data(Bytes),
    /// Nothing queued but a writer is still attached.
    Pending,
    /// Nothing queued and no writer remains. Terminal.
    End,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub max_blocks: usize,
    pub queued_blocks: usize,
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub full: bool,
    pub full_count: u64,
    pub drain_count: u64,
    pub writers: usize,
    pub readers: usize,
}

impl ChannelStats {
    /// Bytes currently queued.
    #[inline]
    pub fn pending_bytes(&self) -> u64 {
        self.bytes_written - self.bytes_read
    }

    #[inline]
    pub fn has_writer(&self) -> bool {
        self.writers > 0
    }
}

#[derive(Clone, Copy)]
enum Event {
    Full,
    Drain,
    Empty,
    Available,
}

struct Channel {
    blocks: VecDeque<Bytes>,
    stats: ChannelStats,
    observers: Vec<(u64, Rc<dyn FifoObserver>)>,
}

impl Channel {
    fn new(max_blocks: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            stats: ChannelStats {
                max_blocks: max_blocks.max(1),
                ..Default::default()
            },
            observers: Vec::new(),
        }
    }

    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            queued_blocks: self.blocks.len(),
            ..self.stats
        }
    }

    fn observers(&self) -> Vec<Rc<dyn FifoObserver>> {
        self.observers.iter().map(|(_, o)| o.clone()).collect()
    }
}

#[derive(Default)]
struct RegistryInner {
    channels: HashMap<ChannelKey, Channel>,
    next_key: u64,
    next_handle: u64,
}

/// Engine scoped table of FIFO channels.
///
/// Cloning is cheap and every clone addresses the same channels.
#[derive(Clone, Default)]
pub struct FifoRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl fmt::Debug for FifoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FifoRegistry, channels: {}", self.len())
    }
}

impl FifoRegistry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a key no live channel uses.
    pub fn allocate_key(&self) -> ChannelKey {
        let mut inner = self.inner.borrow_mut();
        loop {
            let key = ChannelKey(inner.next_key);
            inner.next_key = inner.next_key.wrapping_add(1);
            if !inner.channels.contains_key(&key) {
                return key;
            }
        }
    }

    /// Attach a writer, creating the channel with `max_blocks` capacity if needed.
    pub fn open_writer(
        &self,
        key: ChannelKey,
        max_blocks: usize,
        observer: Option<Rc<dyn FifoObserver>>,
    ) -> FifoWriter {
        let handle = self.attach(key, max_blocks, observer, |stats| stats.writers += 1);
        FifoWriter {
            registry: self.clone(),
            key,
            handle,
            attached: true,
        }
    }

    /// Attach a reader, creating the channel with `max_blocks` capacity if needed.
    pub fn open_reader(
        &self,
        key: ChannelKey,
        max_blocks: usize,
        observer: Option<Rc<dyn FifoObserver>>,
    ) -> FifoReader {
        let handle = self.attach(key, max_blocks, observer, |stats| stats.readers += 1);
        FifoReader {
            registry: self.clone(),
            key,
            handle,
            attached: true,
        }
    }

    pub fn stats(&self, key: ChannelKey) -> Option<ChannelStats> {
        self.inner.borrow().channels.get(&key).map(Channel::snapshot)
    }

    #[inline]
    pub fn contains(&self, key: ChannelKey) -> bool {
        self.inner.borrow().channels.contains_key(&key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn attach(
        &self,
        key: ChannelKey,
        max_blocks: usize,
        observer: Option<Rc<dyn FifoObserver>>,
        count: impl FnOnce(&mut ChannelStats),
    ) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        let channel = inner
            .channels
            .entry(key)
            .or_insert_with(|| Channel::new(max_blocks));
        count(&mut channel.stats);
        if let Some(observer) = observer {
            channel.observers.push((handle, observer));
        }
        handle
    }

    fn dispatch(key: ChannelKey, observers: Vec<Rc<dyn FifoObserver>>, events: &[Event]) {
        for event in events {
            for observer in observers.iter() {
                match event {
                    Event::Full => observer.on_full(key),
                    Event::Drain => observer.on_drain(key),
                    Event::Empty => observer.on_empty(key),
                    Event::Available => observer.on_available(key),
                }
            }
        }
    }

    fn push(&self, key: ChannelKey, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut events = Vec::new();
        let (accepted, observers) = {
            let mut inner = self.inner.borrow_mut();
            let Some(channel) = inner.channels.get_mut(&key) else {
                return 0;
            };
            let queued = channel.blocks.len();
            let max_blocks = channel.stats.max_blocks;
            if queued >= max_blocks {
                channel.stats.full = true;
                return 0;
            }

            let wanted = data.len().div_ceil(BLOCK_SIZE);
            let blocks = wanted.min(max_blocks - queued);
            // The final block may be short, count its real length.
            let accepted = (blocks * BLOCK_SIZE).min(data.len());
            for block in data[..accepted].chunks(BLOCK_SIZE) {
                channel.blocks.push_back(Bytes::copy_from_slice(block));
            }
            channel.stats.blocks_written += blocks as u64;
            channel.stats.bytes_written += accepted as u64;

            if channel.blocks.len() >= max_blocks {
                channel.stats.full = true;
                channel.stats.full_count += 1;
                events.push(Event::Full);
            }
            if queued == 0 {
                events.push(Event::Available);
            }
            (accepted, channel.observers())
        };
        Self::dispatch(key, observers, &events);
        accepted
    }

    fn pull(&self, key: ChannelKey, max: usize) -> Pull {
        let mut events = Vec::new();
        let (pulled, observers) = {
            let mut inner = self.inner.borrow_mut();
            let Some(channel) = inner.channels.get_mut(&key) else {
                return Pull::End;
            };
            let Some(mut block) = channel.blocks.pop_front() else {
                return if channel.stats.writers > 0 {
                    Pull::Pending
                } else {
                    Pull::End
                };
            };
            if max == 0 {
                channel.blocks.push_front(block);
                return Pull::Pending;
            }
            if block.len() > max {
                #[cfg(feature = "logging")]
                tracing::debug!("unaligned read of {} bytes on {}", max, key);
                let rest = block.split_off(max);
                channel.blocks.push_front(rest);
            }
            channel.stats.bytes_read += block.len() as u64;

            if channel.stats.full && channel.blocks.len() * 2 <= channel.stats.max_blocks {
                channel.stats.full = false;
                channel.stats.drain_count += 1;
                events.push(Event::Drain);
            }
            if channel.blocks.is_empty() {
                events.push(Event::Empty);
            }
            (block, channel.observers())
        };
        Self::dispatch(key, observers, &events);
        Pull::Data(pulled)
    }

    fn detach_writer(&self, key: ChannelKey, handle: u64) {
        let mut inner = self.inner.borrow_mut();
        let Some(channel) = inner.channels.get_mut(&key) else {
            return;
        };
        channel.stats.writers = channel.stats.writers.saturating_sub(1);
        channel.observers.retain(|(h, _)| *h != handle);
        if channel.stats.readers == 0 && channel.stats.writers == 0 {
            // Only bytes written after the last reader left can remain here.
            #[cfg(feature = "logging")]
            {
                let pending = channel.stats.pending_bytes();
                if pending > 0 {
                    tracing::warn!("{} destroyed with {} unread bytes and no reader", key, pending);
                }
            }
            inner.channels.remove(&key);
        }
    }

    fn detach_reader(&self, key: ChannelKey, handle: u64) -> Result<(), FifoError> {
        let mut inner = self.inner.borrow_mut();
        let Some(channel) = inner.channels.get_mut(&key) else {
            return Err(FifoError::UnknownChannel(key));
        };
        channel.stats.readers = channel.stats.readers.saturating_sub(1);
        channel.observers.retain(|(h, _)| *h != handle);
        if channel.stats.readers > 0 {
            return Ok(());
        }

        // Queued bytes are unreachable once the last reader leaves, even if a
        // writer is still attached.
        let pending = channel.stats.pending_bytes();
        if channel.stats.writers == 0 {
            inner.channels.remove(&key);
        } else {
            channel.blocks.clear();
            channel.stats.bytes_read = channel.stats.bytes_written;
            channel.stats.full = false;
        }
        if pending > 0 {
            #[cfg(feature = "logging")]
            tracing::warn!("{} closed before all data read, {} bytes dropped", key, pending);
            return Err(FifoError::ClosedWithData { key, pending });
        }
        Ok(())
    }
}

/// Push side of a channel. Detaches on drop.
pub struct FifoWriter {
    registry: FifoRegistry,
    key: ChannelKey,
    handle: u64,
    attached: bool,
}

impl FifoWriter {
    #[inline]
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Queue as many whole blocks of `data` as fit and return the accepted byte
    /// count. Never blocks; returns 0 when the channel is already full.
    pub fn push(&mut self, data: &[u8]) -> usize {
        if !self.attached {
            return 0;
        }
        self.registry.push(self.key, data)
    }

    #[inline]
    pub fn stats(&self) -> Option<ChannelStats> {
        self.registry.stats(self.key)
    }

    /// Finalize the write side. Readers see [`Pull::End`] once drained.
    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.attached {
            self.attached = false;
            self.registry.detach_writer(self.key, self.handle);
        }
    }
}

impl Drop for FifoWriter {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for FifoWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FifoWriter, key: {}", self.key)
    }
}

/// Pull side of a channel. The channel is destroyed when the last reader detaches
/// and no writer remains.
pub struct FifoReader {
    registry: FifoRegistry,
    key: ChannelKey,
    handle: u64,
    attached: bool,
}

impl FifoReader {
    #[inline]
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Dequeue at most `max` bytes from the head block.
    pub fn pull(&mut self, max: usize) -> Pull {
        if !self.attached {
            return Pull::End;
        }
        self.registry.pull(self.key, max)
    }

    #[inline]
    pub fn stats(&self) -> Option<ChannelStats> {
        self.registry.stats(self.key)
    }

    /// Detach, reporting data that was still queued when this was the last
    /// reader. Later pulls return [`Pull::End`].
    pub fn close(&mut self) -> Result<(), FifoError> {
        self.detach()
    }

    fn detach(&mut self) -> Result<(), FifoError> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        self.registry.detach_reader(self.key, self.handle)
    }
}

impl Drop for FifoReader {
    fn drop(&mut self) {
        // Readers that finish normally close explicitly; dropping one means the
        // exchange already failed and carries its own error.
        if let Err(_e) = self.detach() {
            #[cfg(feature = "logging")]
            tracing::debug!("fifo reader dropped: {}", _e);
        }
    }
}

impl fmt::Debug for FifoReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FifoReader, key: {}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Default)]
    struct Counts {
        full: Cell<u32>,
        drain: Cell<u32>,
        empty: Cell<u32>,
        available: Cell<u32>,
    }

    impl FifoObserver for Counts {
        fn on_full(&self, _key: ChannelKey) {
            self.full.set(self.full.get() + 1);
        }
        fn on_drain(&self, _key: ChannelKey) {
            self.drain.set(self.drain.get() + 1);
        }
        fn on_empty(&self, _key: ChannelKey) {
            self.empty.set(self.empty.get() + 1);
        }
        fn on_available(&self, _key: ChannelKey) {
            self.available.set(self.available.get() + 1);
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn pull_all(reader: &mut FifoReader, step: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while let Pull::Data(chunk) = reader.pull(step) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn round_trip_unaligned() {
        let registry = FifoRegistry::new();
        let key = registry.allocate_key();
        let mut writer = registry.open_writer(key, 16, None);
        let mut reader = registry.open_reader(key, 16, None);

        let data = pattern(3 * BLOCK_SIZE + 100);
        assert_eq!(writer.push(&data), data.len());
        assert_eq!(pull_all(&mut reader, 5000), data);
        assert_eq!(reader.pull(5000), Pull::Pending);
        writer.close();
        assert_eq!(reader.pull(5000), Pull::End);
    }

    #[test]
    fn partial_accept_counts_enqueued_bytes() {
        let registry = FifoRegistry::new();
        let key = registry.allocate_key();
        let mut writer = registry.open_writer(key, 4, None);
        let mut reader = registry.open_reader(key, 4, None);

        let data = pattern(6 * BLOCK_SIZE);
        let accepted = writer.push(&data);
        assert_eq!(accepted, 4 * BLOCK_SIZE);
        assert_eq!(writer.push(&data[accepted..]), 0);

        let mut total = 0;
        let mut pushed = accepted;
        loop {
            match reader.pull(BLOCK_SIZE) {
                Pull::Data(chunk) => total += chunk.len(),
                Pull::Pending if pushed < data.len() => pushed += writer.push(&data[pushed..]),
                _ => break,
            }
        }
        assert_eq!(pushed, data.len());
        assert_eq!(total, data.len());
    }

    #[test]
    fn short_final_block_is_counted_exactly() {
        let registry = FifoRegistry::new();
        let key = registry.allocate_key();
        let mut writer = registry.open_writer(key, 2, None);
        let _reader = registry.open_reader(key, 2, None);
        assert_eq!(writer.push(&pattern(BLOCK_SIZE + 10)), BLOCK_SIZE + 10);
        let stats = writer.stats().unwrap();
        assert_eq!(stats.queued_blocks, 2);
        assert_eq!(stats.bytes_written, (BLOCK_SIZE + 10) as u64);
        assert!(stats.full);
    }

    #[test]
    fn edge_notifications() {
        let registry = FifoRegistry::new();
        let key = registry.allocate_key();
        let counts = Rc::new(Counts::default());
        let mut writer = registry.open_writer(key, 4, Some(counts.clone()));
        let mut reader = registry.open_reader(key, 4, None);

        writer.push(&pattern(10));
        writer.push(&pattern(10));
        assert_eq!(counts.available.get(), 1);

        writer.push(&pattern(2 * BLOCK_SIZE));
        assert_eq!(counts.full.get(), 1);
        assert_eq!(writer.push(&pattern(1)), 0);
        assert_eq!(counts.full.get(), 1);

        // 4 queued: draining to 2 crosses the half way mark once.
        reader.pull(BLOCK_SIZE);
        assert_eq!(counts.drain.get(), 0);
        reader.pull(BLOCK_SIZE);
        assert_eq!(counts.drain.get(), 1);
        reader.pull(BLOCK_SIZE);
        assert_eq!(counts.drain.get(), 1);
        assert_eq!(counts.empty.get(), 0);
        reader.pull(BLOCK_SIZE);
        assert_eq!(counts.empty.get(), 1);

        writer.push(&pattern(1));
        assert_eq!(counts.available.get(), 2);
    }

    #[test]
    fn observer_may_push_reentrantly() {
        struct Refill {
            writer: RefCell<Option<FifoWriter>>,
        }
        impl FifoObserver for Refill {
            fn on_empty(&self, _key: ChannelKey) {
                if let Some(writer) = self.writer.borrow_mut().as_mut() {
                    writer.push(b"more");
                }
            }
        }

        let registry = FifoRegistry::new();
        let key = registry.allocate_key();
        let refill = Rc::new(Refill {
            writer: RefCell::new(None),
        });
        let mut reader = registry.open_reader(key, 4, Some(refill.clone()));
        let mut writer = registry.open_writer(key, 4, None);
        writer.push(b"first");
        *refill.writer.borrow_mut() = Some(writer);

        assert_eq!(reader.pull(64), Pull::Data(Bytes::from_static(b"first")));
        assert_eq!(reader.pull(64), Pull::Data(Bytes::from_static(b"more")));
        refill.writer.borrow_mut().take();
    }

    #[test]
    fn lifecycle_and_violation_reporting() {
        let registry = FifoRegistry::new();
        let key = registry.allocate_key();
        let mut writer = registry.open_writer(key, 4, None);
        let mut reader = registry.open_reader(key, 4, None);
        writer.push(b"left behind");
        writer.close();
        assert!(registry.contains(key));
        assert_eq!(
            reader.close(),
            Err(FifoError::ClosedWithData { key, pending: 11 })
        );
        assert!(!registry.contains(key));
        assert_eq!(reader.pull(64), Pull::End);

        let key = registry.allocate_key();
        let writer = registry.open_writer(key, 4, None);
        let mut reader = registry.open_reader(key, 4, None);
        assert_eq!(reader.close(), Ok(()));
        assert!(registry.contains(key));
        drop(writer);
        let mut reader = registry.open_reader(key, 4, None);
        assert_eq!(reader.close(), Ok(()));
        assert!(registry.is_empty());
    }

    #[test]
    fn last_reader_leaving_a_live_writer_reports_queued_bytes() {
        let registry = FifoRegistry::new();
        let key = registry.allocate_key();
        let mut writer = registry.open_writer(key, 4, None);
        let mut reader = registry.open_reader(key, 4, None);
        writer.push(b"0123456789abcdefghij");
        assert_eq!(reader.pull(10), Pull::Data(Bytes::from_static(b"0123456789")));

        assert_eq!(
            reader.close(),
            Err(FifoError::ClosedWithData { key, pending: 10 })
        );
        // The writer keeps the channel alive, but nothing is left queued.
        let stats = writer.stats().unwrap();
        assert_eq!(stats.queued_blocks, 0);
        assert_eq!(stats.pending_bytes(), 0);
        writer.close();
        assert!(registry.is_empty());
    }

    #[test]
    fn allocated_keys_skip_live_channels() {
        let registry = FifoRegistry::new();
        let _reader = registry.open_reader(ChannelKey::new(0), 1, None);
        let key = registry.allocate_key();
        assert_ne!(key, ChannelKey::new(0));
    }
}
