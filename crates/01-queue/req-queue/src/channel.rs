//! Consumer notification channel: a counting signal object and the handle
//! table the queue resolves it through on connect.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::{QueueError, QueueResult};

/// Counting notification primitive. `release` must never block for long: it
/// is called from the producer path.
pub trait Signal: Send + Sync {
    /// Adds `count` to the signal's counter and wakes waiters.
    fn release(&self, count: usize);
}

/// Counting semaphore the consumer waits on between `get` calls.
pub struct Semaphore {
    count: Mutex<usize>,
    limit: usize,
    available: Condvar,
}

impl Semaphore {
    pub const DEFAULT_LIMIT: usize = 0x7fff_ffff;

    pub fn new() -> Self {
        Self::with_limit(Self::DEFAULT_LIMIT)
    }

    /// Creates a semaphore whose count saturates at `limit`.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            count: Mutex::new(0),
            limit: limit.max(1),
            available: Condvar::new(),
        }
    }

    /// Blocks until the count is non-zero, then decrements it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`Semaphore::acquire`] but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            let _ = self
                .available
                .wait_while_for(&mut count, |count| *count == 0, timeout);
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal for Semaphore {
    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut current = self.count.lock();
        let room = self.limit - *current;
        if count > room {
            warn!(
                "semaphore saturated: release of {count} clamped to {room} (limit {})",
                self.limit
            );
        }
        *current += count.min(room);
        drop(current);
        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Opaque handle naming a registered signal object. Zero is never issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelHandle(u64);

impl ChannelHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Live reference to a resolved signal object.
///
/// Holding it keeps the object alive even if its handle is closed.
#[derive(Clone)]
pub struct ChannelRef {
    handle: ChannelHandle,
    signal: Arc<dyn Signal>,
}

impl ChannelRef {
    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn signal(&self, count: usize) {
        self.signal.release(count);
    }
}

impl fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRef")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Handle table mapping [`ChannelHandle`]s to signal objects.
pub struct ChannelTable {
    entries: Mutex<HashMap<ChannelHandle, Arc<dyn Signal>>>,
    next: AtomicU64,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    pub fn register(&self, signal: Arc<dyn Signal>) -> ChannelHandle {
        let handle = ChannelHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(handle, signal);
        handle
    }

    /// Removes `handle` from the table. References already resolved stay valid.
    pub fn close(&self, handle: ChannelHandle) -> bool {
        self.entries.lock().remove(&handle).is_some()
    }

    pub fn resolve(&self, handle: ChannelHandle) -> QueueResult<ChannelRef> {
        let entries = self.entries.lock();
        let signal = entries
            .get(&handle)
            .cloned()
            .ok_or(QueueError::InvalidChannel(handle))?;
        Ok(ChannelRef { handle, signal })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn semaphore_counts_releases() {
        let sem = Semaphore::new();
        sem.release(3);
        assert_eq!(sem.count(), 3);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn semaphore_saturates_at_limit() {
        let sem = Semaphore::with_limit(4);
        sem.release(3);
        sem.release(3);
        assert_eq!(sem.count(), 4);
    }

    #[test]
    fn acquire_timeout_expires_without_release() {
        let sem = Semaphore::new();
        assert!(!sem.acquire_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn acquire_wakes_on_release() {
        let sem = Arc::new(Semaphore::new());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };
        sem.release(1);
        waiter.join().expect("waiter");
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn table_resolves_only_open_handles() {
        let table = ChannelTable::new();
        let sem = Arc::new(Semaphore::new());
        let handle = table.register(sem.clone());
        assert_ne!(handle.raw(), 0);

        let channel = table.resolve(handle).expect("resolve");
        assert!(table.close(handle));
        assert_eq!(
            table.resolve(handle).unwrap_err(),
            QueueError::InvalidChannel(handle)
        );
        assert_eq!(
            table.resolve(ChannelHandle::from_raw(0)).unwrap_err(),
            QueueError::InvalidChannel(ChannelHandle::from_raw(0))
        );

        channel.signal(2);
        assert_eq!(sem.count(), 2);
    }
}
