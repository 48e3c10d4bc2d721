//! Backpressure-aware transmission. The transport accepts blocks until its send queue is full and
//! reports each block it finishes through a `CompletionNotifier`, usually from its own thread.
//! `TransmitPipeline` turns "queue full" into a wait on that notification, and `TransmitStream`
//! drives a pipeline from a staged ring of blocks.

use crate::error::{SubmitError, TransmitError};
use crate::ring_buffer::RingBuffer;
use crate::session::Session;
use crate::{CardId, Handle, RadioTransmitter, StreamKey};

use failure::Error;
use parking_lot::{Condvar, Mutex};
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Instant;

/// Blocks staged ahead of the pipeline by `TransmitStream`
const TX_STAGING_DEPTH: usize = 16;

/// A block of samples to transmit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxBlock {
    /// RF timestamp at which the block should go out, when the transport runs with timestamps
    pub timestamp: u64,
    /// Unpacked I/Q payload, one 32-bit word per sample
    pub data: Vec<u8>,
}

impl TxBlock {
    pub fn new(data: Vec<u8>) -> Self {
        TxBlock { timestamp: 0, data }
    }

    /// Whole 32-bit words in the payload, saturating at `u32::MAX`. `TransmitPipeline::submit`
    /// rejects blocks this cannot describe exactly
    pub fn words(&self) -> u32 {
        u32::try_from(self.data.len() / 4).unwrap_or(u32::MAX)
    }

    fn is_well_formed(&self) -> bool {
        self.data.len() % 4 == 0 && u32::try_from(self.data.len() / 4).is_ok()
    }
}

/// How a submitted block finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Complete,
    /// Sent, but after its timestamp (or the device ran dry waiting for it)
    Late,
    Failed(i32),
}

#[derive(Debug, Default)]
struct SpaceState {
    completed: u64,
    late: u64,
    failed: u64,
    /// Threads currently blocked in `wait`
    waiters: usize,
    /// Completions handed to a waiter but not yet claimed. Never exceeds `waiters`
    permits: usize,
    closed: bool,
}

/// The wait/notify primitive between a producer and the transport's completion thread. Each
/// completion releases at most one waiter
#[derive(Debug, Default)]
pub struct SpaceSignal {
    state: Mutex<SpaceState>,
    /// Wakes a single thread waiting for queue space
    space: Condvar,
    /// Wakes everybody waiting for the queue to drain
    drained: Condvar,
}

impl SpaceSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    pub fn late(&self) -> u64 {
        self.state.lock().late
    }

    pub fn failed(&self) -> u64 {
        self.state.lock().failed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Block until the next completion. Returns `Closed` if the signal is closed first
    pub fn wait(&self) -> Result<(), TransmitError> {
        let mut state = self.state.lock();
        Self::wait_for_permit(&self.space, &mut state)
    }

    /// Like `wait`, but returns immediately if a completion already arrived after `seen`
    /// completions had been counted
    pub fn wait_after(&self, seen: u64) -> Result<(), TransmitError> {
        let mut state = self.state.lock();
        if state.completed > seen {
            return Ok(());
        }
        Self::wait_for_permit(&self.space, &mut state)
    }

    fn wait_for_permit(
        space: &Condvar,
        state: &mut parking_lot::MutexGuard<'_, SpaceState>,
    ) -> Result<(), TransmitError> {
        if state.closed {
            return Err(TransmitError::Closed);
        }
        state.waiters += 1;
        while state.permits == 0 && !state.closed {
            space.wait(state);
        }
        state.waiters -= 1;
        if state.permits > 0 {
            state.permits -= 1;
            Ok(())
        } else {
            Err(TransmitError::Closed)
        }
    }

    /// Block until at least `count` blocks have completed
    pub fn wait_for_completed(&self, count: u64) -> Result<(), TransmitError> {
        let mut state = self.state.lock();
        while state.completed < count {
            if state.closed {
                return Err(TransmitError::Closed);
            }
            self.drained.wait(&mut state);
        }
        Ok(())
    }

    fn notify(&self, status: TxStatus) {
        let mut state = self.state.lock();
        state.completed += 1;
        match status {
            TxStatus::Complete => {}
            TxStatus::Late => state.late += 1,
            TxStatus::Failed(_) => state.failed += 1,
        }
        if state.permits < state.waiters {
            state.permits += 1;
            self.space.notify_one();
        }
        self.drained.notify_all();
    }

    /// Release every waiter with `Closed`. Used when the session stops
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.space.notify_all();
        self.drained.notify_all();
    }
}

/// Handed to the transport, which calls `on_complete` once for every block it accepted
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    signal: Arc<SpaceSignal>,
}

impl CompletionNotifier {
    pub fn new(signal: Arc<SpaceSignal>) -> Self {
        CompletionNotifier { signal }
    }

    pub fn on_complete(&self, status: TxStatus) {
        match status {
            TxStatus::Complete => {}
            TxStatus::Late => log::debug!("transmit block completed late"),
            TxStatus::Failed(code) => log::error!(
                "transmit block {} failed with status {}",
                self.signal.completed(),
                code
            ),
        }
        self.signal.notify(status);
    }
}

/// Counters of a transmit pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransmitReport {
    pub submitted: u64,
    pub completed: u64,
    /// Late or underrun completions
    pub late: u64,
    pub failed: u64,
    /// Completions per second since the pipeline was created
    pub completion_rate: f64,
}

/// Submits blocks for one transmit handle, turning a full send queue into a wait for the next
/// completion instead of an error
pub struct TransmitPipeline<T: RadioTransmitter> {
    handle: Handle,
    transmitter: T,
    signal: Arc<SpaceSignal>,
    submitted: u64,
    /// Completions counted just before the submission that came back busy
    busy_mark: Option<u64>,
    created: Instant,
}

impl<T: RadioTransmitter> TransmitPipeline<T> {
    pub fn new(handle: Handle, mut transmitter: T) -> Self {
        let signal = Arc::new(SpaceSignal::new());
        transmitter.register_completion(CompletionNotifier::new(signal.clone()));
        TransmitPipeline {
            handle,
            transmitter,
            signal,
            submitted: 0,
            busy_mark: None,
            created: Instant::now(),
        }
    }

    /// Hand `block` to the transport. `Busy` means it was not queued: call `wait_for_space` and
    /// submit it again
    pub fn submit(&mut self, block: &TxBlock) -> Result<(), TransmitError> {
        if !block.is_well_formed() {
            log::error!(
                "refusing {}-byte block on {}: not a whole number of words",
                block.data.len(),
                self.handle
            );
            return Err(TransmitError::Malformed {
                bytes: block.data.len(),
            });
        }
        let seen = self.signal.completed();
        match self.transmitter.submit_block(self.handle, block) {
            Ok(()) => {
                self.submitted += 1;
                self.busy_mark = None;
                Ok(())
            }
            Err(SubmitError::QueueFull) => {
                self.busy_mark = Some(seen);
                Err(TransmitError::Busy)
            }
            Err(err @ SubmitError::Fatal(_)) => {
                log::error!("transmit on {} failed: {}", self.handle, err);
                Err(err.into())
            }
        }
    }

    /// Block until a completion frees space in the transport's queue
    pub fn wait_for_space(&mut self) -> Result<(), TransmitError> {
        match self.busy_mark.take() {
            Some(seen) => self.signal.wait_after(seen),
            None => self.signal.wait(),
        }
    }

    /// Block until every submitted block has completed
    pub fn flush(&self) -> Result<(), TransmitError> {
        self.signal.wait_for_completed(self.submitted)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn signal(&self) -> Arc<SpaceSignal> {
        self.signal.clone()
    }

    pub fn notifier(&self) -> CompletionNotifier {
        CompletionNotifier::new(self.signal.clone())
    }

    /// Same as the registered notifier's `on_complete`, for transports that report through the
    /// pipeline itself
    pub fn on_complete(&self, status: TxStatus) {
        self.notifier().on_complete(status);
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted
    }

    pub fn completed_count(&self) -> u64 {
        self.signal.completed()
    }

    /// Late completions plus whatever the device counted on its own
    pub fn late_count(&self) -> u64 {
        self.signal.late() + self.transmitter.device_late_count(self.handle)
    }

    /// Blocks accepted by the transport that have not completed yet
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.signal.completed())
    }

    pub fn completion_rate(&self) -> f64 {
        let secs = self.created.elapsed().as_secs_f64();
        if secs > 0. {
            self.signal.completed() as f64 / secs
        } else {
            0.
        }
    }

    pub fn report(&self) -> TransmitReport {
        TransmitReport {
            submitted: self.submitted,
            completed: self.signal.completed(),
            late: self.late_count(),
            failed: self.signal.failed(),
            completion_rate: self.completion_rate(),
        }
    }

    pub fn transmitter(&self) -> &T {
        &self.transmitter
    }

    pub fn transmitter_mut(&mut self) -> &mut T {
        &mut self.transmitter
    }
}

struct Timestamping {
    next: u64,
    /// `None` steps by the sample count of each block
    increment: Option<u64>,
}

/// Drives a `TransmitPipeline` from a source of blocks, staging them in a ring ahead of the
/// transport
pub struct TransmitStream<T: RadioTransmitter> {
    card: CardId,
    pipeline: TransmitPipeline<T>,
    staged: RingBuffer<TxBlock, TX_STAGING_DEPTH>,
    source: Box<dyn Iterator<Item = TxBlock> + Send>,
    timestamps: Option<Timestamping>,
}

impl<T: RadioTransmitter> TransmitStream<T> {
    pub fn new<I>(card: CardId, pipeline: TransmitPipeline<T>, source: I) -> Self
    where
        I: IntoIterator<Item = TxBlock>,
        I::IntoIter: Send + 'static,
    {
        TransmitStream {
            card,
            pipeline,
            staged: RingBuffer::new(),
            source: Box::new(source.into_iter()),
            timestamps: None,
        }
    }

    /// Send `blocks` in order, `repeat` times over
    pub fn replay(
        card: CardId,
        pipeline: TransmitPipeline<T>,
        blocks: Vec<TxBlock>,
        repeat: usize,
    ) -> Self {
        let source = (0..repeat).flat_map(move |_| blocks.clone());
        Self::new(card, pipeline, source)
    }

    /// Stamp blocks with consecutive timestamps starting at `start`, advancing by `increment` per
    /// block (or by the block's sample count if `None`)
    pub fn with_timestamps(mut self, start: u64, increment: Option<u64>) -> Self {
        self.timestamps = Some(Timestamping {
            next: start,
            increment,
        });
        self
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.card, self.pipeline.handle())
    }

    pub fn pipeline(&self) -> &TransmitPipeline<T> {
        &self.pipeline
    }

    fn refill(&mut self) {
        while !self.staged.is_full() {
            let mut block = match self.source.next() {
                Some(block) => block,
                None => return,
            };
            if let Some(ts) = self.timestamps.as_mut() {
                block.timestamp = ts.next;
                ts.next += ts.increment.unwrap_or_else(|| u64::from(block.words()));
            }
            // Cannot fail, we checked for space
            let _ = self.staged.push(block);
        }
    }

    /// Transmit until the source runs dry or the session stops, then wait for every block in
    /// flight to complete
    pub fn run(&mut self, session: &Session) -> Result<TransmitReport, Error> {
        let key = self.key();
        session.watch(&self.pipeline.signal());
        session.register_stream(key);
        self.pipeline.transmitter.start_streaming(key.handle)?;
        log::info!("started transmit streaming on {}", key);

        let result = self.pump(session);

        if result.is_ok() && session.is_running() {
            log::debug!("{}: waiting for {} blocks in flight", key, self.pipeline.in_flight());
            match self.pipeline.flush() {
                Ok(()) | Err(TransmitError::Closed) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.pipeline.transmitter.stop_streaming(key.handle)?;
        result?;

        let report = self.pipeline.report();
        log::info!(
            "transmit on {} done: {} submitted, {} completed, {} late",
            key,
            report.submitted,
            report.completed,
            report.late
        );
        Ok(report)
    }

    fn pump(&mut self, session: &Session) -> Result<(), TransmitError> {
        let key = self.key();
        // Taken off the ring but turned away as busy
        let mut pending: Option<TxBlock> = None;
        while session.is_running() {
            self.refill();
            let block = match pending.take() {
                Some(block) => block,
                None => match self.staged.pop() {
                    Ok(block) => block,
                    Err(_) => break,
                },
            };
            match self.pipeline.submit(&block) {
                Ok(()) => session.record_tx(key, block.data.len() as u64),
                Err(TransmitError::Busy) => {
                    pending = Some(block);
                    match self.pipeline.wait_for_space() {
                        Ok(()) => {}
                        Err(TransmitError::Closed) => break,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
