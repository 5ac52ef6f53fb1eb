//! Connection manager: owns the session state and composes the lifecycle
//! guard with the FIFO store.
//!
//! Two locks with different weights are involved and they are never merged:
//! * the store's short-hold lock, taken on every insert/get;
//! * the transition lock, taken only by `connect`/`disconnect` and allowed to
//!   block for as long as a disconnect needs to drain.
//!
//! `insert` and `get` never touch the transition lock. They observe the
//! current session through an atomically swapped pointer and then need a
//! guard token before touching the store. `disconnect` closes the session's
//! guard and waits for it to drain *before* clearing the session pointer;
//! flipping the pointer first would let an insert that already saw the old
//! session race with teardown.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::channel::{ChannelHandle, ChannelRef, ChannelTable};
use crate::guard::{LifecycleGuard, SessionHold};
use crate::record::Record;
use crate::stats::{QueueStats, QueueStatsSnapshot};
use crate::store::{FifoStore, PopFront};
use crate::{QueueError, QueueResult};

/// Tunables fixed at module init.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Upper bound on concurrent `insert`/`get` calls inside one session.
    ///
    /// The session's own hold is not counted; zero is treated as one.
    pub max_in_flight: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 0x7fff_ffff,
        }
    }
}

/// What happened to a record handed to [`RequestQueue::insert`].
///
/// Dropped records are destroyed; producers are not expected to react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was queued and the channel (if any) signalled.
    Queued,
    /// No consumer is connected.
    DroppedDisconnected,
    /// A disconnect was draining the session.
    DroppedDraining,
}

struct Session {
    guard: LifecycleGuard,
    channel: ArcSwapOption<ChannelRef>,
}

struct ActiveSession {
    session: Arc<Session>,
    hold: SessionHold,
}

#[derive(Default)]
struct Transition {
    active: Option<ActiveSession>,
}

pub struct RequestQueue {
    config: QueueConfig,
    store: FifoStore,
    session: ArcSwapOption<Session>,
    transition: Mutex<Transition>,
    channels: ChannelTable,
    stats: QueueStats,
}

impl RequestQueue {
    /// Module init: an empty store, no session, an empty channel table.
    pub fn new(config: QueueConfig) -> Self {
        debug!("request queue init max_in_flight={}", config.max_in_flight);
        Self {
            config,
            store: FifoStore::new(),
            session: ArcSwapOption::empty(),
            transition: Mutex::new(Transition::default()),
            channels: ChannelTable::new(),
            stats: QueueStats::default(),
        }
    }

    /// Registers the consumer, optionally with the signal object named by `channel`.
    ///
    /// When a channel is attached it is immediately signalled with the number
    /// of records already queued.
    pub fn connect(&self, channel: Option<ChannelHandle>) -> QueueResult<()> {
        let mut transition = self.transition.lock();
        if transition.active.is_some() {
            debug!("request queue connect rejected: already registered");
            return Err(QueueError::AlreadyRegistered);
        }

        let channel = channel
            .map(|handle| self.channels.resolve(handle))
            .transpose()?;

        let (guard, hold) = LifecycleGuard::armed(self.config.max_in_flight);
        let session = Arc::new(Session {
            guard,
            channel: ArcSwapOption::from(channel.clone().map(Arc::new)),
        });
        self.session.store(Some(Arc::clone(&session)));
        transition.active = Some(ActiveSession { session, hold });

        let backlog = self.store.len();
        if let Some(channel) = &channel {
            if backlog > 0 {
                channel.signal(backlog);
            }
        }
        debug!(
            "request queue connected channel={:?} backlog={backlog}",
            channel.as_ref().map(ChannelRef::handle)
        );
        Ok(())
    }

    /// Ends the current session, waiting for in-flight inserts/gets first.
    ///
    /// Queued records stay queued for the next session.
    pub fn disconnect(&self) {
        let mut transition = self.transition.lock();
        let Some(ActiveSession { session, hold }) = transition.active.take() else {
            return;
        };

        session.guard.release_and_wait(hold);
        session.channel.store(None);
        self.session.store(None);
        debug!("request queue disconnected queued={}", self.store.len());
    }

    /// Queues `record` for the consumer, or destroys it when nobody is listening.
    pub fn insert(&self, record: Record) -> InsertOutcome {
        let kind = record.kind();
        let outcome = self.insert_inner(record);
        self.stats.record_insert(outcome);
        trace!("request queue insert kind={kind:?} outcome={outcome:?}");
        outcome
    }

    fn insert_inner(&self, record: Record) -> InsertOutcome {
        let session = self.session.load();
        let Some(session) = &*session else {
            return InsertOutcome::DroppedDisconnected;
        };
        let Ok(_token) = session.guard.try_enter() else {
            return InsertOutcome::DroppedDraining;
        };

        self.store.push_back(record);
        if let Some(channel) = &*session.channel.load() {
            channel.signal(1);
        }
        InsertOutcome::Queued
    }

    /// Copies the oldest record into `buffer` and returns its size.
    ///
    /// A record that does not fit stays queued; the error carries the size
    /// needed to retry.
    pub fn get(&self, buffer: &mut [u8]) -> QueueResult<usize> {
        let result = self.get_inner(buffer);
        trace!(
            "request queue get capacity={} result={result:?}",
            buffer.len()
        );
        result
    }

    fn get_inner(&self, buffer: &mut [u8]) -> QueueResult<usize> {
        let session = self.session.load();
        let Some(session) = &*session else {
            return Err(QueueError::NotConnected);
        };
        let Ok(_token) = session.guard.try_enter() else {
            return Err(QueueError::NotConnected);
        };

        match self.store.pop_front_within(buffer.len()) {
            PopFront::Popped(record) => {
                let len = record.wire_len();
                buffer[..len].copy_from_slice(&record.as_bytes()[..len]);
                self.stats.record_delivered();
                Ok(len)
            }
            PopFront::Empty => Err(QueueError::Empty),
            PopFront::TooSmall { required } => {
                self.stats.record_too_small();
                Err(QueueError::TooSmall { required })
            }
        }
    }

    /// Module teardown: ends any session and destroys every queued record.
    ///
    /// Returns the number of records destroyed.
    pub fn finit(&self) -> usize {
        self.disconnect();
        let destroyed = self.store.drain_and_destroy_all();
        debug!("request queue finit destroyed={destroyed}");
        destroyed
    }

    pub fn is_connected(&self) -> bool {
        self.session.load().is_some()
    }

    /// True while a disconnect is waiting for in-flight calls to finish.
    pub fn is_draining(&self) -> bool {
        self.session
            .load()
            .as_ref()
            .is_some_and(|session| session.guard.is_draining())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Handle table consumers register their signal objects in.
    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::channel::Semaphore;
    use crate::record::{RecordHeader, RecordKind, RecordView};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn event(seq: u32) -> Record {
        Record::new(RecordHeader::new(RecordKind::Event).with_flags(seq))
    }

    fn attach_semaphore(queue: &RequestQueue) -> (Arc<Semaphore>, ChannelHandle) {
        let sem = Arc::new(Semaphore::new());
        let handle = queue.channels().register(sem.clone());
        (sem, handle)
    }

    #[test]
    fn connect_insert_get_round_trip() {
        init_logger();
        let queue = RequestQueue::default();
        queue.connect(None).expect("connect");

        let payload: Vec<u8> = (0..RecordKind::Event.payload_len() as u8).collect();
        let header = RecordHeader::new(RecordKind::Event).with_origin(100, 200);
        let record = Record::with_payload(header, &payload).expect("record");
        let expected = record.as_bytes().to_vec();
        assert_eq!(queue.insert(record), InsertOutcome::Queued);

        let mut buffer = vec![0u8; 512];
        let written = queue.get(&mut buffer).expect("get");
        assert_eq!(written, RecordKind::Event.wire_size());
        assert_eq!(&buffer[..written], expected.as_slice());
        let view = RecordView::parse(&buffer[..written]).expect("view");
        assert_eq!(view.header, header);
        assert_eq!(view.payload, payload.as_slice());

        let err = queue.get(&mut buffer).unwrap_err();
        assert_eq!(err, QueueError::Empty);
        assert_eq!(err.required_size(), Some(0));
    }

    #[test]
    fn smallest_in_flight_budgets_still_serve_calls() {
        init_logger();
        for max_in_flight in [0, 1] {
            let queue = RequestQueue::new(QueueConfig { max_in_flight });
            queue.connect(None).expect("connect");
            assert_eq!(queue.insert(event(max_in_flight)), InsertOutcome::Queued);

            let mut buffer = vec![0u8; RecordKind::Event.wire_size()];
            let written = queue.get(&mut buffer).expect("get");
            let view = RecordView::parse(&buffer[..written]).expect("view");
            assert_eq!(view.header.flags, max_in_flight);
            assert!(!queue.is_draining());
            queue.disconnect();
        }
    }

    #[test]
    fn get_requires_connection() {
        let queue = RequestQueue::default();
        let mut buffer = [0u8; 256];
        assert_eq!(queue.get(&mut buffer), Err(QueueError::NotConnected));
    }

    #[test]
    fn disconnected_insert_is_dropped() {
        let queue = RequestQueue::default();
        for seq in 0..4 {
            assert_eq!(queue.insert(event(seq)), InsertOutcome::DroppedDisconnected);
        }
        queue.connect(None).expect("connect");
        assert!(queue.is_empty());
        let mut buffer = [0u8; 256];
        assert_eq!(queue.get(&mut buffer), Err(QueueError::Empty));
        assert_eq!(queue.stats().dropped_disconnected, 4);
    }

    #[test]
    fn undersized_buffer_reports_exact_size_and_keeps_record() {
        let queue = RequestQueue::default();
        queue.connect(None).expect("connect");
        queue.insert(Record::new(RecordHeader::new(RecordKind::EventCompletion)));
        let required = RecordKind::EventCompletion.wire_size();

        let mut small = vec![0u8; required - 1];
        let err = queue.get(&mut small).unwrap_err();
        assert_eq!(err, QueueError::TooSmall { required });
        assert_eq!(err.required_size(), Some(required));
        assert_eq!(queue.len(), 1);

        let mut exact = vec![0u8; required];
        assert_eq!(queue.get(&mut exact), Ok(required));
        assert!(queue.is_empty());
    }

    #[test]
    fn second_connect_is_rejected_without_touching_session() {
        let queue = RequestQueue::default();
        let (sem, handle) = attach_semaphore(&queue);
        queue.connect(Some(handle)).expect("connect");

        assert_eq!(queue.connect(None), Err(QueueError::AlreadyRegistered));
        queue.insert(event(0));
        assert_eq!(sem.count(), 1, "original channel still attached");
    }

    #[test]
    fn invalid_channel_leaves_queue_disconnected() {
        let queue = RequestQueue::default();
        let bogus = ChannelHandle::from_raw(0xbad);
        assert_eq!(
            queue.connect(Some(bogus)),
            Err(QueueError::InvalidChannel(bogus))
        );
        assert!(!queue.is_connected());
        assert_eq!(queue.insert(event(0)), InsertOutcome::DroppedDisconnected);
        queue.connect(None).expect("connect after failed attempt");
    }

    #[test]
    fn insert_signals_channel_per_record() {
        let queue = RequestQueue::default();
        let (sem, handle) = attach_semaphore(&queue);
        queue.connect(Some(handle)).expect("connect");
        for seq in 0..3 {
            queue.insert(event(seq));
        }
        assert_eq!(sem.count(), 3);
    }

    #[test]
    fn reconnect_signals_backlog() {
        let queue = RequestQueue::default();
        queue.connect(None).expect("connect");
        for seq in 0..5 {
            queue.insert(event(seq));
        }
        queue.disconnect();
        assert_eq!(queue.len(), 5, "records survive a disconnect");

        let (sem, handle) = attach_semaphore(&queue);
        queue.connect(Some(handle)).expect("reconnect");
        assert_eq!(sem.count(), 5);

        let mut buffer = [0u8; 256];
        for seq in 0..5 {
            let len = queue.get(&mut buffer).expect("get");
            let view = RecordView::parse(&buffer[..len]).expect("view");
            assert_eq!(view.header.flags, seq);
        }
    }

    #[test]
    fn disconnect_releases_channel_reference() {
        let queue = RequestQueue::default();
        let (sem, handle) = attach_semaphore(&queue);
        queue.connect(Some(handle)).expect("connect");
        assert!(queue.channels().close(handle));
        assert!(Arc::strong_count(&sem) > 1, "session keeps the object alive");

        queue.disconnect();
        assert_eq!(Arc::strong_count(&sem), 1);
        assert!(!queue.is_connected());
        assert_eq!(queue.insert(event(0)), InsertOutcome::DroppedDisconnected);
    }

    #[test]
    fn disconnect_without_session_is_noop() {
        let queue = RequestQueue::default();
        queue.disconnect();
        queue.disconnect();
        assert!(!queue.is_connected());
    }

    #[test]
    fn finit_destroys_everything_queued() {
        let queue = RequestQueue::default();
        queue.connect(None).expect("connect");
        for kind in RecordKind::ALL {
            queue.insert(Record::new(RecordHeader::new(kind)));
        }
        assert_eq!(queue.finit(), RecordKind::ALL.len());
        assert!(queue.is_empty());
        assert!(!queue.is_connected());
    }
}
