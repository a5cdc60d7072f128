//! Buffer Pool Manager primitives.
//!
//! # Pools
//!
//! [`BufferPool`] holds the free entries of one buffer kind (input
//! surfaces or bitstream buffers).  Accounting is kept under the same lock
//! as the free list, so a [`PoolCounts`] snapshot always satisfies
//! `free + in_flight == total`.
//!
//! # Completion FIFO
//!
//! [`BitstreamQueue`] carries submitted output buffers from the submission
//! thread to the drain thread in submission order.
//!
//! # Shutdown
//!
//! Both structures accept a shutdown sentinel ([`Slot::Shutdown`]) that is
//! distinct from any buffer.  Blocked consumers observe it as `None`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{CodecError, Result};
use crate::types::round_up;

/// Queue entry: a buffer or the shutdown sentinel.
#[derive(Debug)]
pub enum Slot<T> {
    Buffer(T),
    Shutdown,
}

// ─── Sizing ──────────────────────────────────────────────────────────────

/// Two-tier pool size step function over the frame's macroblock count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSizing {
    /// 16x16 macroblocks at or above which the smaller pool is used.
    pub macroblock_threshold: u32,
    pub large_frame_buffers: usize,
    pub small_frame_buffers: usize,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            macroblock_threshold: 8160,
            large_frame_buffers: 32,
            small_frame_buffers: 48,
        }
    }
}

impl PoolSizing {
    pub fn macroblocks(width: u32, height: u32) -> u32 {
        let mb_w = round_up(width as usize, 16) / 16;
        let mb_h = round_up(height as usize, 16) / 16;
        (mb_w * mb_h) as u32
    }

    /// Number of input (and output) buffers for a `width` x `height` stream.
    pub fn pool_size(&self, width: u32, height: u32) -> usize {
        if Self::macroblocks(width, height) >= self.macroblock_threshold {
            self.large_frame_buffers
        } else {
            self.small_frame_buffers
        }
    }
}

/// Pool size for a `width` x `height` stream under `sizing`.
pub fn pool_size_for(width: u32, height: u32, sizing: &PoolSizing) -> usize {
    sizing.pool_size(width, height)
}

// ─── Statistics ──────────────────────────────────────────────────────────

/// Snapshot of pool occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    pub total: usize,
    pub free: usize,
    pub in_flight: usize,
}

impl PoolCounts {
    pub fn is_consistent(&self) -> bool {
        self.free + self.in_flight == self.total
    }
}

pub struct PoolStats {
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    /// Acquisitions that had to block.
    pub waits: AtomicU64,
    /// Blocked acquisitions woken by the shutdown sentinel.
    pub shutdown_wakeups: AtomicU64,
}

impl PoolStats {
    fn new() -> Self {
        Self {
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            shutdown_wakeups: AtomicU64::new(0),
        }
    }
}

// ─── BufferPool ──────────────────────────────────────────────────────────

struct PoolState<T> {
    free: VecDeque<T>,
    total: usize,
    in_flight: usize,
    shutdown: bool,
}

/// Fixed-capacity pool of hardware buffers.
pub struct BufferPool<T> {
    name: &'static str,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    pub stats: PoolStats,
}

impl<T: Send> BufferPool<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                total: 0,
                in_flight: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            stats: PoolStats::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add freshly allocated entries to the pool.
    pub fn seed(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.state.lock();
        let before = state.total;
        for item in items {
            state.free.push_back(item);
            state.total += 1;
        }
        debug!(pool = self.name, added = state.total - before, "pool seeded");
        drop(state);
        self.available.notify_all();
    }

    /// Block until an entry is free.  `None` once shut down.
    pub fn acquire(&self) -> Option<T> {
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            if state.shutdown {
                if waited {
                    self.stats.shutdown_wakeups.fetch_add(1, Ordering::Relaxed);
                }
                return None;
            }
            if let Some(item) = state.free.pop_front() {
                state.in_flight += 1;
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            if !waited {
                waited = true;
                self.stats.waits.fetch_add(1, Ordering::Relaxed);
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(item) = state.free.pop_front() {
                state.in_flight += 1;
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Take an entry if one is free right now.
    pub fn try_acquire(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.shutdown {
            return None;
        }
        let item = state.free.pop_front()?;
        state.in_flight += 1;
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Return an entry.  Callable from any thread.
    pub fn release(&self, item: T) {
        let mut state = self.state.lock();
        if state.in_flight == 0 {
            error!(pool = self.name, "release without matching acquire");
        } else {
            state.in_flight -= 1;
        }
        state.free.push_back(item);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.available.notify_one();
    }

    /// Wake every waiter with the shutdown sentinel.  Sticky until
    /// [`reset`](Self::reset).
    pub fn push_shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Clear the shutdown sentinel.
    pub fn reset(&self) {
        self.state.lock().shutdown = false;
    }

    /// Remove every entry for destruction.
    ///
    /// Fails without removing anything if entries are still in flight.
    pub fn take_all(&self) -> Result<Vec<T>> {
        let mut state = self.state.lock();
        if state.in_flight != 0 {
            return Err(CodecError::InvariantViolation(format!(
                "{} pool freed with {} of {} buffers in flight",
                self.name, state.in_flight, state.total
            )));
        }
        state.total = 0;
        Ok(state.free.drain(..).collect())
    }

    pub fn counts(&self) -> PoolCounts {
        let state = self.state.lock();
        PoolCounts {
            total: state.total,
            free: state.free.len(),
            in_flight: state.in_flight,
        }
    }
}

// ─── BitstreamQueue ──────────────────────────────────────────────────────

/// FIFO of submitted output buffers awaiting completion.
pub struct BitstreamQueue<T> {
    tx: Sender<Slot<T>>,
    rx: Receiver<Slot<T>>,
}

impl<T: Send> Default for BitstreamQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> BitstreamQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(Slot::Buffer(item));
    }

    pub fn push_shutdown(&self) {
        let _ = self.tx.send(Slot::Shutdown);
    }

    /// Block for the oldest entry.  `None` when the sentinel is reached.
    pub fn pop(&self) -> Option<T> {
        match self.rx.recv() {
            Ok(Slot::Buffer(item)) => Some(item),
            Ok(Slot::Shutdown) | Err(_) => None,
        }
    }

    /// Remove every queued buffer, discarding sentinels.
    pub fn steal_all(&self) -> Vec<T> {
        self.rx
            .try_iter()
            .filter_map(|slot| match slot {
                Slot::Buffer(item) => Some(item),
                Slot::Shutdown => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Receiver handle for a drain thread.
    pub fn receiver(&self) -> BitstreamReceiver<T> {
        BitstreamReceiver {
            rx: self.rx.clone(),
        }
    }
}

/// Consumer end of a [`BitstreamQueue`], movable into a drain thread.
pub struct BitstreamReceiver<T> {
    rx: Receiver<Slot<T>>,
}

impl<T> BitstreamReceiver<T> {
    pub fn pop(&self) -> Option<T> {
        match self.rx.recv() {
            Ok(Slot::Buffer(item)) => Some(item),
            Ok(Slot::Shutdown) | Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pool_size_steps_at_threshold() {
        let sizing = PoolSizing::default();
        assert_eq!(sizing.pool_size(64, 64), 48);
        // 1920x1080 = 120 * 68 = 8160, exactly the threshold.
        assert_eq!(sizing.pool_size(1920, 1080), 32);
        // 1920x1072 = 120 * 67 = 8040.
        assert_eq!(sizing.pool_size(1920, 1072), 48);
        // 3840x2160 = 240 * 135 = 32400 macroblocks.
        assert_eq!(sizing.pool_size(3840, 2160), 32);
        // 2048x1024 = 128 * 64 = 8192.
        assert_eq!(sizing.pool_size(2048, 1024), 32);
        assert_eq!(PoolSizing::macroblocks(17, 17), 4);
    }

    #[test]
    fn counts_stay_consistent() {
        let pool = BufferPool::new("test");
        pool.seed(0..4u32);
        assert_eq!(
            pool.counts(),
            PoolCounts {
                total: 4,
                free: 4,
                in_flight: 0
            }
        );
        let a = pool.acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        let counts = pool.counts();
        assert_eq!(counts.in_flight, 2);
        assert!(counts.is_consistent());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.counts().in_flight, 0);
        assert!(pool.counts().is_consistent());
    }

    #[test]
    fn take_all_refuses_in_flight() {
        let pool = BufferPool::new("test");
        pool.seed([1u8, 2]);
        let held = pool.acquire().unwrap();
        assert!(matches!(
            pool.take_all(),
            Err(CodecError::InvariantViolation(_))
        ));
        pool.release(held);
        let all = pool.take_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(pool.counts(), PoolCounts::default());
    }

    #[test]
    fn shutdown_unblocks_all_waiters() {
        let pool = Arc::new(BufferPool::<u32>::new("test"));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.acquire())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        pool.push_shutdown();
        for w in waiters {
            assert_eq!(w.join().unwrap(), None);
        }
        pool.reset();
        pool.seed([9]);
        assert_eq!(pool.acquire(), Some(9));
    }

    #[test]
    fn release_wakes_blocked_acquire() {
        let pool = Arc::new(BufferPool::new("test"));
        pool.seed([1u32]);
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(held);
        assert_eq!(waiter.join().unwrap(), Some(1));
        assert!(pool.stats.waits.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn acquire_timeout_gives_up() {
        let pool = BufferPool::<u32>::new("test");
        assert_eq!(pool.acquire_timeout(Duration::from_millis(10)), None);
        pool.seed([3]);
        assert_eq!(pool.acquire_timeout(Duration::from_millis(10)), Some(3));
    }

    #[test]
    fn bitstream_queue_is_fifo() {
        let queue = BitstreamQueue::new();
        for i in 0..5u32 {
            queue.push(i);
        }
        let rx = queue.receiver();
        let popped: Vec<_> = (0..5).map(|_| rx.pop().unwrap()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn steal_all_drops_sentinels() {
        let queue = BitstreamQueue::new();
        queue.push(1u32);
        queue.push_shutdown();
        queue.push(2);
        assert_eq!(queue.steal_all(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn sentinel_ends_pop() {
        let queue = BitstreamQueue::<u32>::new();
        queue.push_shutdown();
        assert_eq!(queue.pop(), None);
    }
}
