#![deny(missing_docs)]
//! Native consumer harness for the request queue, shared by integration tests
//! and demos.
//!
//! [`DrainAgent`] plays the user-space draining agent: it registers a
//! semaphore, connects with it, parks on the semaphore between records and
//! forwards every decoded record over a channel. [`spawn_burst`] drives the
//! producer side from several threads at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, trace};
use req_queue::{
    ChannelHandle, InsertOutcome, QueueError, QueueResult, Record, RecordHeader, RecordKind,
    RecordView, RequestQueue, Semaphore, Signal, RECORD_HEADER_LEN,
};
use smallvec::SmallVec;

/// Knobs for a [`DrainAgent`].
#[derive(Clone, Copy, Debug)]
pub struct DrainConfig {
    /// Starting size of the copy-out buffer; grown on demand.
    pub initial_buffer: usize,
    /// How long the drain thread parks before re-checking for a stop request.
    pub poll_interval: Duration,
    /// Bound on undelivered records in the output channel; `None` is unbounded.
    pub channel_capacity: Option<usize>,
    /// Saturation limit of the agent's semaphore.
    pub signal_limit: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            initial_buffer: 64,
            poll_interval: Duration::from_millis(50),
            channel_capacity: None,
            signal_limit: Semaphore::DEFAULT_LIMIT,
        }
    }
}

/// A record copied out of the queue and decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainedRecord {
    /// Decoded fixed header.
    pub header: RecordHeader,
    /// Payload bytes following the header.
    pub payload: Vec<u8>,
}

impl DrainedRecord {
    fn from_view(view: RecordView<'_>) -> Self {
        Self {
            header: view.header,
            payload: view.payload.to_vec(),
        }
    }
}

/// Counters reported when the agent stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Records forwarded to the output channel.
    pub delivered: usize,
    /// Times the copy-out buffer had to grow after a too-small report.
    pub resized: usize,
    /// Wakeups that found the queue empty.
    pub spurious_wakeups: usize,
}

/// Background consumer connected to a [`RequestQueue`].
pub struct DrainAgent {
    queue: Arc<RequestQueue>,
    handle: ChannelHandle,
    signal: Arc<Semaphore>,
    stop: Arc<AtomicBool>,
    records: Receiver<DrainedRecord>,
    worker: Option<JoinHandle<DrainSummary>>,
}

impl DrainAgent {
    /// Connects to `queue` with a fresh semaphore and starts the drain thread.
    pub fn spawn(queue: Arc<RequestQueue>, config: DrainConfig) -> anyhow::Result<Self> {
        let signal = Arc::new(Semaphore::with_limit(config.signal_limit));
        let handle = queue.channels().register(signal.clone());
        if let Err(err) = queue.connect(Some(handle)) {
            queue.channels().close(handle);
            return Err(err).context("connect drain agent");
        }

        let (tx, records) = match config.channel_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let spawned = {
            let queue = Arc::clone(&queue);
            let signal = Arc::clone(&signal);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("req-queue-drain".into())
                .spawn(move || drain_loop(&queue, &signal, &stop, &tx, config))
        };
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                queue.disconnect();
                queue.channels().close(handle);
                return Err(err).context("spawn drain thread");
            }
        };
        debug!("drain agent started channel={handle}");

        Ok(Self {
            queue,
            handle,
            signal,
            stop,
            records,
            worker: Some(worker),
        })
    }

    /// Receiving end of the decoded record stream.
    pub fn records(&self) -> &Receiver<DrainedRecord> {
        &self.records
    }

    /// Drains whatever is still queued, stops the thread and disconnects.
    pub fn stop(mut self) -> anyhow::Result<DrainSummary> {
        self.shutdown()
            .ok_or_else(|| anyhow!("drain agent already stopped"))?
    }

    fn shutdown(&mut self) -> Option<anyhow::Result<DrainSummary>> {
        let worker = self.worker.take()?;
        self.stop.store(true, Ordering::Release);
        self.signal.release(1);
        let summary = worker
            .join()
            .map_err(|_| anyhow!("drain thread panicked"));
        self.queue.disconnect();
        self.queue.channels().close(self.handle);
        debug!("drain agent stopped summary={summary:?}");
        Some(summary)
    }
}

impl Drop for DrainAgent {
    fn drop(&mut self) {
        if let Some(Err(err)) = self.shutdown() {
            error!("drain agent shutdown failed: {err:#}");
        }
    }
}

fn drain_loop(
    queue: &RequestQueue,
    signal: &Semaphore,
    stop: &AtomicBool,
    tx: &Sender<DrainedRecord>,
    config: DrainConfig,
) -> DrainSummary {
    let mut buffer = vec![0u8; config.initial_buffer.max(RECORD_HEADER_LEN)];
    let mut summary = DrainSummary::default();

    loop {
        if stop.load(Ordering::Acquire) {
            match drain_available(queue, &mut buffer, usize::MAX, &mut summary) {
                Ok(batch) => {
                    forward(tx, batch, &mut summary);
                }
                Err(err) => error!("final drain failed: {err}"),
            }
            return summary;
        }
        if !signal.acquire_timeout(config.poll_interval) {
            continue;
        }
        match fetch_one(queue, &mut buffer, &mut summary) {
            Ok(Some(record)) => {
                if !forward(tx, [record], &mut summary) {
                    return summary;
                }
            }
            Ok(None) => summary.spurious_wakeups += 1,
            Err(QueueError::NotConnected) => {
                debug!("drain agent lost its session");
                return summary;
            }
            Err(err) => {
                error!("drain agent get failed: {err}");
                return summary;
            }
        }
    }
}

fn forward(
    tx: &Sender<DrainedRecord>,
    records: impl IntoIterator<Item = DrainedRecord>,
    summary: &mut DrainSummary,
) -> bool {
    for record in records {
        if tx.send(record).is_err() {
            return false;
        }
        summary.delivered += 1;
    }
    true
}

/// Copies out the head record, growing `buffer` when the queue asks for more room.
///
/// Returns `Ok(None)` when the queue is empty.
pub fn fetch_one(
    queue: &RequestQueue,
    buffer: &mut Vec<u8>,
    summary: &mut DrainSummary,
) -> QueueResult<Option<DrainedRecord>> {
    loop {
        match queue.get(buffer) {
            Ok(len) => {
                let view = RecordView::parse(&buffer[..len])?;
                trace!("drained {:?} ({len} bytes)", view.kind());
                return Ok(Some(DrainedRecord::from_view(view)));
            }
            Err(QueueError::TooSmall { required }) => {
                buffer.resize(required, 0);
                summary.resized += 1;
            }
            Err(QueueError::Empty) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
}

/// Pulls up to `max` records without waiting on the channel.
pub fn drain_available(
    queue: &RequestQueue,
    buffer: &mut Vec<u8>,
    max: usize,
    summary: &mut DrainSummary,
) -> QueueResult<SmallVec<[DrainedRecord; 8]>> {
    let mut batch = SmallVec::new();
    while batch.len() < max {
        match fetch_one(queue, buffer, summary)? {
            Some(record) => batch.push(record),
            None => break,
        }
    }
    Ok(batch)
}

/// Inserts `per_producer` records of `kind` from `producers` threads at once.
///
/// Each record carries its producer index as the process id and its sequence
/// number in the header flags. Every handle yields how many records were queued.
pub fn spawn_burst(
    queue: &Arc<RequestQueue>,
    producers: u32,
    per_producer: u32,
    kind: RecordKind,
) -> Vec<JoinHandle<usize>> {
    (0..producers)
        .map(|producer| {
            let queue = Arc::clone(queue);
            thread::spawn(move || {
                (0..per_producer)
                    .filter(|seq| {
                        let header = RecordHeader::new(kind)
                            .with_origin(producer, 0)
                            .with_flags(*seq);
                        queue.insert(Record::new(header)) == InsertOutcome::Queued
                    })
                    .count()
            })
        })
        .collect()
}
