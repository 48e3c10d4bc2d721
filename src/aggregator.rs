//! Fan-out of receive (and transmit) streams over worker threads. Each worker exclusively owns
//! the transport for its card together with one `ContinuityTracker` and one staging
//! `RingBuffer` per handle. The only state workers share is the `Session`, which the monitor
//! samples once per interval.

use crate::config::{Staging, StreamConfig};
use crate::continuity::{ContinuityResult, ContinuityTracker};
use crate::error::{RxError, StreamError};
use crate::report::AggregateReport;
use crate::ring_buffer::RingBuffer;
use crate::session::Session;
use crate::transmit::{TransmitReport, TransmitStream};
use crate::{
    BlockSink, CardId, Handle, NullSink, RadioReceiver, RadioTransmitter, RxBlock, StreamKey,
};

use crossbeam::channel::{select, tick};
use failure::Error;
use std::collections::{HashMap, HashSet};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Blocks a handle stages before they are handed to the sink in one go
const STAGING_DEPTH: usize = 20;

/// Lifecycle of a single worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Streaming,
    /// The session stopped, every handle is complete, or the blocks could not be delivered:
    /// stop the transport gracefully
    Stopping,
    /// The transport failed to start or returned a non-retryable status. Goes straight to
    /// `Stopped`
    Faulted,
    Stopped,
}

/// What a worker hands back when its thread exits
#[derive(Debug)]
pub(crate) struct WorkerOutcome {
    pub card: CardId,
    /// `Stopping` or `Faulted`, whichever the worker went through on its way to `Stopped`
    pub shutdown: WorkerState,
    pub fault: Option<String>,
    pub transmit: Option<(StreamKey, TransmitReport)>,
}

/// Why a receive worker left its loop early
#[derive(Debug)]
enum WorkerFault {
    Start(Error),
    Receive(RxError),
    /// The sink refused a block. The transport itself is still healthy
    Sink(Error),
}

impl WorkerFault {
    /// State the worker winds down through
    fn shutdown(&self) -> WorkerState {
        match self {
            WorkerFault::Start(_) | WorkerFault::Receive(_) => WorkerState::Faulted,
            WorkerFault::Sink(_) => WorkerState::Stopping,
        }
    }
}

impl std::fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WorkerFault::Start(err) | WorkerFault::Sink(err) => write!(f, "{}", err),
            WorkerFault::Receive(err) => write!(f, "{}", err),
        }
    }
}

struct StagedBlock {
    timestamp: u64,
    data: Vec<u8>,
}

struct HandleState {
    key: StreamKey,
    tracker: ContinuityTracker,
    staged: RingBuffer<StagedBlock, STAGING_DEPTH>,
    acquired: u64,
    complete: bool,
}

impl HandleState {
    fn flush(&mut self, sink: &mut dyn BlockSink) -> Result<(), Error> {
        for block in self.staged.drain() {
            sink.write_block(self.key, block.timestamp, &block.data)?;
        }
        Ok(())
    }
}

/// Everything a receive worker owns apart from the transport, so a block borrowed from the
/// transport can be processed while it is still borrowed
struct WorkerCore<S: BlockSink> {
    card: CardId,
    config: StreamConfig,
    session: Session,
    sink: S,
    handles: HashMap<Handle, HandleState>,
    state: WorkerState,
}

impl<S: BlockSink> WorkerCore<S> {
    fn transition(&mut self, next: WorkerState) {
        log::debug!("card {} worker: {:?} -> {:?}", self.card, self.state, next);
        self.state = next;
    }

    fn all_complete(&self) -> bool {
        self.handles.values().all(|h| h.complete)
    }

    /// Check, stage and count one block. An `Err` means the block could not be delivered
    fn on_block(&mut self, block: RxBlock<'_>) -> Result<(), Error> {
        let card = self.card;
        let state = match self.handles.get_mut(&block.handle) {
            Some(state) => state,
            None => {
                log::warn!(
                    "card {}: received unexpected data from handle {}",
                    card,
                    block.handle
                );
                self.session.record_unexpected(card);
                return Ok(());
            }
        };
        if state.complete {
            return Ok(());
        }

        let (gaps, backward) = match state.tracker.observe(block.timestamp, block.payload_words) {
            ContinuityResult::ForwardGap { expected, actual } => {
                log::warn!(
                    "timestamp error in block {} for {}...expected 0x{:016x} but got 0x{:016x}",
                    state.acquired,
                    state.key,
                    expected,
                    actual
                );
                (1, 0)
            }
            ContinuityResult::BackwardJump { expected, actual } => {
                log::error!(
                    "{} backward timestamp detected: current = 0x{:016x}, expected = 0x{:016x}",
                    state.key,
                    actual,
                    expected
                );
                (1, 1)
            }
            ContinuityResult::FirstBlock | ContinuityResult::Continuous => (0, 0),
        };

        match self.config.staging {
            Staging::WriteThrough => {
                self.sink
                    .write_block(state.key, block.timestamp, block.data)?;
            }
            Staging::Buffered => {
                if state.staged.is_full() {
                    state.flush(&mut self.sink)?;
                }
                let staged = StagedBlock {
                    timestamp: block.timestamp,
                    data: block.data.to_vec(),
                };
                if state.staged.push(staged).is_err() {
                    return Err(failure::format_err!(
                        "staging ring for {} still full after flush",
                        state.key
                    ));
                }
            }
        }

        self.session
            .record_block(state.key, block.data.len() as u64, gaps, backward);

        state.acquired += 1;
        if Some(state.acquired) == self.config.blocks_per_handle {
            log::info!("{}: acquired {} blocks", state.key, state.acquired);
            state.complete = true;
        }
        Ok(())
    }

    fn flush_all(&mut self) -> Result<(), Error> {
        for state in self.handles.values_mut() {
            state.flush(&mut self.sink)?;
        }
        Ok(())
    }
}

struct RxWorker<R: RadioReceiver, S: BlockSink> {
    receiver: R,
    handles: Vec<Handle>,
    core: WorkerCore<S>,
}

impl<R: RadioReceiver, S: BlockSink> RxWorker<R, S> {
    fn run(mut self) -> WorkerOutcome {
        let card = self.core.card;
        let result = self.stream();
        let shutdown = match &result {
            Ok(()) => WorkerState::Stopping,
            Err(fault) => fault.shutdown(),
        };
        let fault = result.err().map(|fault| fault.to_string());
        if let Some(reason) = &fault {
            log::error!("card {}: {}", card, reason);
        }

        self.core.transition(shutdown);
        if shutdown == WorkerState::Stopping {
            log::info!(
                "stopping {} receive handle(s) on card {}",
                self.handles.len(),
                card
            );
            if let Err(err) = self.receiver.stop_streaming(&self.handles) {
                log::warn!("card {}: failed to stop streaming: {}", card, err);
            }
        }
        // Blocks already received are still good, even from a faulted card
        if let Err(err) = self.core.flush_all() {
            log::error!("card {}: failed to flush staged blocks: {}", card, err);
        }
        self.core.transition(WorkerState::Stopped);

        WorkerOutcome {
            card,
            shutdown,
            fault,
            transmit: None,
        }
    }

    fn stream(&mut self) -> Result<(), WorkerFault> {
        let card = self.core.card;
        log::info!(
            "starting {} receive handle(s) on card {}",
            self.handles.len(),
            card
        );
        self.receiver
            .start_streaming(&self.handles)
            .map_err(WorkerFault::Start)?;
        self.core.transition(WorkerState::Streaming);

        while self.core.session.is_running() && !self.core.all_complete() {
            // The transport is polled: "no data" comes straight back and we ask again, which
            // keeps per-block latency low at the cost of a busy core
            match self.receiver.receive_block() {
                Ok(Some(block)) => self.core.on_block(block).map_err(WorkerFault::Sink)?,
                Ok(None) => std::hint::spin_loop(),
                Err(err) if !err.is_fatal() => {
                    log::warn!("card {}: {}", card, err);
                    self.core.session.record_overrun(card);
                }
                Err(err) => return Err(WorkerFault::Receive(err)),
            }
        }
        Ok(())
    }
}

/// Runs one session: workers per card (or per handle), plus the monitor
pub struct StreamAggregator {
    config: StreamConfig,
    session: Session,
    streams: HashSet<StreamKey>,
    workers: Vec<(CardId, JoinHandle<WorkerOutcome>)>,
    monitor: Option<JoinHandle<()>>,
}

impl StreamAggregator {
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(StreamAggregator {
            config,
            session: Session::new(),
            streams: HashSet::new(),
            workers: Vec::new(),
            monitor: None,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Handle to the shared running flag and counters
    pub fn session(&self) -> Session {
        self.session.clone()
    }

    fn claim(&mut self, keys: &[StreamKey]) -> Result<(), StreamError> {
        let mut seen = HashSet::new();
        for key in keys {
            if self.streams.contains(key) || !seen.insert(*key) {
                return Err(StreamError::DuplicateStream(*key));
            }
        }
        for key in keys {
            self.streams.insert(*key);
            self.session.register_stream(*key);
        }
        Ok(())
    }

    /// Start a worker receiving `handles` of `card`, discarding the data
    pub fn spawn_card<R>(
        &mut self,
        card: CardId,
        handles: Vec<Handle>,
        receiver: R,
    ) -> Result<(), StreamError>
    where
        R: RadioReceiver + 'static,
    {
        self.spawn_card_with_sink(card, handles, receiver, NullSink)
    }

    /// Start a worker receiving `handles` of `card` and handing the blocks to `sink`
    pub fn spawn_card_with_sink<R, S>(
        &mut self,
        card: CardId,
        handles: Vec<Handle>,
        receiver: R,
        sink: S,
    ) -> Result<(), StreamError>
    where
        R: RadioReceiver + 'static,
        S: BlockSink + 'static,
    {
        if handles.is_empty() {
            return Err(StreamError::NoHandles(card));
        }
        let keys: Vec<StreamKey> = handles.iter().map(|h| StreamKey::new(card, *h)).collect();
        self.claim(&keys)?;

        let states = keys
            .iter()
            .map(|key| {
                let state = HandleState {
                    key: *key,
                    tracker: ContinuityTracker::new(self.config.pack_mode),
                    staged: RingBuffer::new(),
                    acquired: 0,
                    complete: false,
                };
                (key.handle, state)
            })
            .collect();
        let worker = RxWorker {
            receiver,
            handles,
            core: WorkerCore {
                card,
                config: self.config.clone(),
                session: self.session.clone(),
                sink,
                handles: states,
                state: WorkerState::Starting,
            },
        };

        let thread = thread::Builder::new()
            .name(format!("rx-card-{}", card))
            .spawn(move || worker.run())
            .map_err(|e| StreamError::Spawn(e.to_string()))?;
        self.workers.push((card, thread));
        Ok(())
    }

    /// Start one worker per `(card, handles, receiver)` entry and the monitor
    pub fn run<R, I>(&mut self, workers: I) -> Result<(), StreamError>
    where
        R: RadioReceiver + 'static,
        I: IntoIterator<Item = (CardId, Vec<Handle>, R)>,
    {
        for (card, handles, receiver) in workers {
            self.spawn_card(card, handles, receiver)?;
        }
        self.start_monitor()
    }

    /// Start a worker running `stream` until its source is exhausted or the session stops
    pub fn spawn_transmitter<T>(&mut self, mut stream: TransmitStream<T>) -> Result<(), StreamError>
    where
        T: RadioTransmitter + 'static,
    {
        let key = stream.key();
        self.claim(&[key])?;
        let session = self.session.clone();

        let thread = thread::Builder::new()
            .name(format!("tx-{}-{}", key.card, key.handle))
            .spawn(move || {
                log::debug!("{} transmit worker: {:?}", key, WorkerState::Streaming);
                let (shutdown, fault, report) = match stream.run(&session) {
                    Ok(report) => (WorkerState::Stopping, None, report),
                    Err(err) => {
                        log::error!("transmit on {} failed: {}", key, err);
                        let report = stream.pipeline().report();
                        (WorkerState::Faulted, Some(err.to_string()), report)
                    }
                };
                log::debug!("{} transmit worker: {:?}", key, WorkerState::Stopped);
                WorkerOutcome {
                    card: key.card,
                    shutdown,
                    fault,
                    transmit: Some((key, report)),
                }
            })
            .map_err(|e| StreamError::Spawn(e.to_string()))?;
        self.workers.push((key.card, thread));
        Ok(())
    }

    /// Start sampling the shared counters once per monitor interval. Does nothing if the monitor
    /// is already running
    pub fn start_monitor(&mut self) -> Result<(), StreamError> {
        if self.monitor.is_some() {
            return Ok(());
        }
        let session = self.session.clone();
        let interval = self.config.monitor_interval();
        let run_time = self.config.run_time_secs.map(Duration::from_secs);
        let thread = thread::Builder::new()
            .name("stream-monitor".to_string())
            .spawn(move || monitor(session, interval, run_time))
            .map_err(|e| StreamError::Spawn(e.to_string()))?;
        self.monitor = Some(thread);
        Ok(())
    }

    pub fn stop(&self) {
        self.session.stop();
    }

    /// Wait for every worker to exit, then stop the monitor and build the report
    pub fn join(mut self) -> AggregateReport {
        let mut outcomes = Vec::with_capacity(self.workers.len());
        for (card, worker) in self.workers.drain(..) {
            match worker.join() {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => {
                    log::error!("worker for card {} panicked", card);
                    outcomes.push(WorkerOutcome {
                        card,
                        shutdown: WorkerState::Faulted,
                        fault: Some("worker panicked".to_string()),
                        transmit: None,
                    });
                }
            }
        }

        self.session.stop();
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                log::error!("monitor panicked");
            }
        }

        AggregateReport::build(self.session.counters(), outcomes)
    }
}

fn monitor(session: Session, interval: Duration, run_time: Option<Duration>) {
    let ticker = tick(interval);
    let stop = session.stop_requested();
    let deadline = run_time.map(|t| Instant::now() + t);
    let mut last_gaps: HashMap<StreamKey, u64> = HashMap::new();
    let mut last = Instant::now();

    while session.is_running() {
        select! {
            recv(ticker) -> _ => {}
            recv(stop) -> _ => break,
        }
        if !session.is_running() {
            break;
        }

        let now = Instant::now();
        let sample = session.sample(now - last);
        last = now;

        let streams: Vec<String> = sample
            .streams
            .iter()
            .map(|(key, packets, gaps)| {
                let prev = last_gaps.insert(*key, *gaps).unwrap_or(0);
                format!(
                    "({} pkts {}, timestamp gaps total {}, delta {})",
                    key,
                    packets,
                    gaps,
                    gaps - prev
                )
            })
            .collect();
        log::info!(
            "throughput: {:.1} MB/s {}",
            sample.throughput_mbps,
            streams.join(" ")
        );

        if deadline.map_or(false, |d| now >= d) {
            log::info!("run time elapsed");
            session.stop();
        }
    }
}
