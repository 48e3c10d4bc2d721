use crate::{CardId, StreamKey};
use failure::Fail;

/// Capacity violations reported by `RingBuffer`. These are expected during normal streaming and
/// are handled by the caller's own drop/backpressure policy
#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[fail(display = "ring buffer is full")]
    Full,
    #[fail(display = "ring buffer is empty")]
    Empty,
    /// The index can never be valid for a buffer with this many slots
    #[fail(display = "index {} is outside the {} physical slots", index, slots)]
    OutOfRange { index: usize, slots: usize },
    /// The index is within the buffer but no element has been written there yet
    #[fail(display = "index {} exceeds the {} buffered elements", index, size)]
    ExceedsSize { index: usize, size: usize },
}

/// Non-success statuses from `RadioReceiver::receive_block`. "No data" is not an error and is
/// reported as `Ok(None)` instead
#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    /// The device overwrote data software had not yet retrieved. The condition clears on the
    /// next receive call
    #[fail(display = "receive overrun")]
    Overrun,
    #[fail(display = "received a malformed packet")]
    Malformed,
    #[fail(display = "no receive handles are streaming")]
    NotStreaming,
    #[fail(display = "receive failed with status {}", _0)]
    Generic(i32),
}

impl RxError {
    /// Whether the worker that saw this status has to give up on its card
    pub fn is_fatal(&self) -> bool {
        match self {
            RxError::Overrun => false,
            _ => true,
        }
    }
}

/// What a `RadioTransmitter` reports for a block it did not accept
#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The device's send queue is full. The block was *not* sent
    #[fail(display = "transmit queue is full")]
    QueueFull,
    #[fail(display = "transmit failed with status {}", _0)]
    Fatal(i32),
}

/// Errors from `TransmitPipeline`
#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// Backpressure: wait for space and resubmit the same block
    #[fail(display = "transmit pipeline is busy")]
    Busy,
    #[fail(display = "transmit failed with status {}", _0)]
    Fatal(i32),
    /// The session stopped while waiting for space
    #[fail(display = "transmit pipeline was closed")]
    Closed,
    /// The payload is not a whole number of 32-bit words, or has more words than the transport
    /// can describe
    #[fail(display = "transmit block of {} bytes is malformed", bytes)]
    Malformed { bytes: usize },
}

impl From<SubmitError> for TransmitError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::QueueFull => TransmitError::Busy,
            SubmitError::Fatal(code) => TransmitError::Fatal(code),
        }
    }
}

/// Problems setting up a streaming session
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum StreamError {
    #[fail(display = "stream {} is already driven by another worker", _0)]
    DuplicateStream(StreamKey),
    #[fail(display = "no handles given for card {}", _0)]
    NoHandles(CardId),
    #[fail(display = "invalid configuration: {}", _0)]
    Config(String),
    #[fail(display = "unable to spawn worker: {}", _0)]
    Spawn(String),
}

/// Reasons a finished session fails its configured pass/fail thresholds
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum ThresholdError {
    #[fail(
        display = "measured throughput ({:.1} MB/s) did not meet target ({:.1} MB/s)",
        measured, target
    )]
    BelowTarget { measured: f64, target: f64 },
    #[fail(display = "no throughput was measured, target was {:.1} MB/s", target)]
    NotMeasured { target: f64 },
    #[fail(
        display = "number of timestamp gaps ({}) on {} exceeded threshold ({})",
        gaps, key, threshold
    )]
    TooManyGaps {
        key: StreamKey,
        gaps: u64,
        threshold: u64,
    },
    #[fail(
        display = "number of late blocks ({}) on {} exceeded threshold ({})",
        late, key, threshold
    )]
    TooManyLate {
        key: StreamKey,
        late: u64,
        threshold: u64,
    },
    #[fail(display = "worker for card {} faulted: {}", card, reason)]
    Faulted { card: CardId, reason: String },
}
