//! Ordered record storage behind a short-hold lock.
//!
//! The hot path may run in the highest-rate producer context, so the critical
//! sections only relink list nodes. Each record is wrapped in a one-element
//! [`LinkedList`] *before* the lock is taken and spliced in with `append`;
//! popping splits the head node off and frees it after the lock is released.
//! Neither direction allocates, frees or copies record bytes while locked.

use std::collections::LinkedList;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::record::Record;

/// Outcome of a size-checked pop.
#[derive(Debug, PartialEq, Eq)]
pub enum PopFront {
    /// The head record fit and was unlinked.
    Popped(Record),
    /// Nothing is queued.
    Empty,
    /// The head record needs `required` bytes and was left queued.
    TooSmall { required: usize },
}

#[derive(Default)]
pub struct FifoStore {
    list: Mutex<LinkedList<Record>>,
    len: AtomicUsize,
}

impl FifoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `record` at the tail.
    pub fn push_back(&self, record: Record) {
        let mut node = LinkedList::new();
        node.push_back(record);

        let mut list = self.list.lock();
        list.append(&mut node);
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Unlinks the head record, if any.
    pub fn pop_front(&self) -> Option<Record> {
        let mut head = {
            let mut list = self.list.lock();
            if list.is_empty() {
                return None;
            }
            self.len.fetch_sub(1, Ordering::Release);
            unlink_head(&mut list)
        };
        head.pop_front()
    }

    /// Unlinks the head record only if its wire size fits in `capacity`.
    pub fn pop_front_within(&self, capacity: usize) -> PopFront {
        let mut head = {
            let mut list = self.list.lock();
            let required = match list.front() {
                Some(record) => record.wire_len(),
                None => return PopFront::Empty,
            };
            if capacity < required {
                return PopFront::TooSmall { required };
            }
            self.len.fetch_sub(1, Ordering::Release);
            unlink_head(&mut list)
        };
        match head.pop_front() {
            Some(record) => PopFront::Popped(record),
            None => PopFront::Empty,
        }
    }

    /// Destroys every queued record and returns how many there were.
    ///
    /// Only meant for teardown, once no producer or consumer can be mid-call.
    pub fn drain_and_destroy_all(&self) -> usize {
        let drained = {
            let mut list = self.list.lock();
            self.len.store(0, Ordering::Release);
            mem::take(&mut *list)
        };
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Detaches the head node from a non-empty list in O(1).
fn unlink_head(list: &mut LinkedList<Record>) -> LinkedList<Record> {
    let rest = list.split_off(1);
    mem::replace(list, rest)
}
