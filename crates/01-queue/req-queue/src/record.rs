//! Record catalog and the owned record value carried by the queue.
//!
//! Wire layout (little-endian, fixed per kind):
//!
//! ```text
//! +---------+---------+--------------+------------+-----------+----------------+
//! | kind u32| flags u32| timestamp u64| process u32| thread u32| payload ...    |
//! +---------+---------+--------------+------------+-----------+----------------+
//!  <------------------- RECORD_HEADER_LEN (24) ------------------>
//! ```
//!
//! The total size of a record is fully determined by its kind. Producers build
//! records through [`Record::new`] / [`Record::with_payload`], so every queued
//! record carries a tag the catalog knows how to size.

use core::fmt;

use crate::{QueueError, QueueResult};

/// Size of the fixed header that prefixes every record.
pub const RECORD_HEADER_LEN: usize = 24;

const EVENT_PAYLOAD_LEN: usize = 64;
const EVENT_COMPLETION_PAYLOAD_LEN: usize = 40;
const FAST_PATH_PAYLOAD_LEN: usize = 56;
const DEVICE_ARRIVAL_PAYLOAD_LEN: usize = 32;
const UNLOAD_PAYLOAD_LEN: usize = 8;
#[cfg(not(feature = "legacy-start-size"))]
const START_PAYLOAD_LEN: usize = 16;
// Older consumers size start notifications like unload notifications.
#[cfg(feature = "legacy-start-size")]
const START_PAYLOAD_LEN: usize = UNLOAD_PAYLOAD_LEN;

/// Closed set of record shapes the queue can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordKind {
    /// Intercepted request event.
    Event = 1,
    /// Completion of a previously reported event.
    EventCompletion = 2,
    /// Event observed on the fast path.
    FastPathEvent = 3,
    /// A new device was attached.
    DeviceArrival = 4,
    /// A monitored driver is unloading.
    UnloadNotification = 5,
    /// A monitored driver started an I/O.
    StartNotification = 6,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Event,
        RecordKind::EventCompletion,
        RecordKind::FastPathEvent,
        RecordKind::DeviceArrival,
        RecordKind::UnloadNotification,
        RecordKind::StartNotification,
    ];

    pub fn from_raw(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::Event),
            2 => Some(RecordKind::EventCompletion),
            3 => Some(RecordKind::FastPathEvent),
            4 => Some(RecordKind::DeviceArrival),
            5 => Some(RecordKind::UnloadNotification),
            6 => Some(RecordKind::StartNotification),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Number of payload bytes following the header.
    pub fn payload_len(self) -> usize {
        match self {
            RecordKind::Event => EVENT_PAYLOAD_LEN,
            RecordKind::EventCompletion => EVENT_COMPLETION_PAYLOAD_LEN,
            RecordKind::FastPathEvent => FAST_PATH_PAYLOAD_LEN,
            RecordKind::DeviceArrival => DEVICE_ARRIVAL_PAYLOAD_LEN,
            RecordKind::UnloadNotification => UNLOAD_PAYLOAD_LEN,
            RecordKind::StartNotification => START_PAYLOAD_LEN,
        }
    }

    /// Exact on-the-wire size: header plus payload.
    pub fn wire_size(self) -> usize {
        RECORD_HEADER_LEN + self.payload_len()
    }
}

/// Catalog lookup over a raw tag. `None` marks a tag outside the enumeration.
pub fn size_of(tag: u32) -> Option<usize> {
    RecordKind::from_raw(tag).map(RecordKind::wire_size)
}

/// Catalog lookup for a tag read back from a queued record.
///
/// Queued records are only ever built from a [`RecordKind`], so an unknown tag
/// here means the catalog and a producer disagree about the record set.
/// Continuing would copy the wrong number of bytes, so this aborts.
pub(crate) fn required_size(tag: u32) -> usize {
    match size_of(tag) {
        Some(size) => size,
        None => unknown_tag(tag),
    }
}

#[cold]
#[track_caller]
fn unknown_tag(tag: u32) -> ! {
    log::error!("invalid request type: {tag}");
    panic!("record catalog has no size for tag {tag:#x}");
}

/// Fixed header carried at the front of every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    pub flags: u32,
    pub timestamp: u64,
    pub process_id: u32,
    pub thread_id: u32,
}

impl RecordHeader {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            flags: 0,
            timestamp: 0,
            process_id: 0,
            thread_id: 0,
        }
    }

    pub fn with_origin(mut self, process_id: u32, thread_id: u32) -> Self {
        self.process_id = process_id;
        self.thread_id = thread_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.kind.raw().to_le_bytes());
        dst[4..8].copy_from_slice(&self.flags.to_le_bytes());
        dst[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        dst[16..20].copy_from_slice(&self.process_id.to_le_bytes());
        dst[20..24].copy_from_slice(&self.thread_id.to_le_bytes());
    }

    fn decode(kind: RecordKind, src: &[u8]) -> Self {
        Self {
            kind,
            flags: read_u32(src, 4),
            timestamp: read_u64(src, 8),
            process_id: read_u32(src, 16),
            thread_id: read_u32(src, 20),
        }
    }
}

/// Owned, heap-allocated record in its exact wire shape.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    bytes: Box<[u8]>,
}

impl Record {
    /// Allocates a record of `header.kind` with a zeroed payload.
    pub fn new(header: RecordHeader) -> Self {
        let mut bytes = vec![0u8; header.kind.wire_size()].into_boxed_slice();
        header.encode(&mut bytes[..RECORD_HEADER_LEN]);
        Self { bytes }
    }

    /// Allocates a record and copies `payload` behind the header.
    ///
    /// The payload length must match the kind's catalog entry exactly.
    pub fn with_payload(header: RecordHeader, payload: &[u8]) -> QueueResult<Self> {
        let expected = header.kind.payload_len();
        if payload.len() != expected {
            return Err(QueueError::PayloadSize {
                kind: header.kind,
                expected,
                actual: payload.len(),
            });
        }
        let mut record = Self::new(header);
        record.payload_mut().copy_from_slice(payload);
        Ok(record)
    }

    /// Raw type tag as stored in the header.
    pub fn tag(&self) -> u32 {
        read_u32(&self.bytes, 0)
    }

    pub fn kind(&self) -> RecordKind {
        let tag = self.tag();
        RecordKind::from_raw(tag).unwrap_or_else(|| unknown_tag(tag))
    }

    pub fn header(&self) -> RecordHeader {
        RecordHeader::decode(self.kind(), &self.bytes)
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[RECORD_HEADER_LEN..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[RECORD_HEADER_LEN..]
    }

    /// Exact number of bytes `get` copies out for this record.
    pub fn wire_len(&self) -> usize {
        required_size(self.tag())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("kind", &RecordKind::from_raw(self.tag()))
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Borrowed view over a record copied out of the queue.
#[derive(Debug, PartialEq, Eq)]
pub struct RecordView<'a> {
    pub header: RecordHeader,
    pub payload: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Decodes the record at the front of `bytes`.
    ///
    /// Trailing bytes past the kind's wire size are ignored, so callers can
    /// pass the whole buffer they handed to `get`.
    pub fn parse(bytes: &'a [u8]) -> QueueResult<Self> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Err(QueueError::Truncated {
                needed: RECORD_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let tag = read_u32(bytes, 0);
        let kind = RecordKind::from_raw(tag).ok_or(QueueError::UnknownRecordType(tag))?;
        let needed = kind.wire_size();
        if bytes.len() < needed {
            return Err(QueueError::Truncated {
                needed,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            header: RecordHeader::decode(kind, bytes),
            payload: &bytes[RECORD_HEADER_LEN..needed],
        })
    }

    pub fn kind(&self) -> RecordKind {
        self.header.kind
    }
}

fn read_u32(src: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[at..at + 8]);
    u64::from_le_bytes(buf)
}
