//! Stream against a simulation of a card rather than a real device. `SimulatedCard` produces
//! receive blocks with consistent timestamps on every configured handle, with discontinuities
//! and transport failures injected as described by `SimulatorConfig::faults`.
//! `SimulatedTransmitter` models a device with a bounded send queue that completes blocks from
//! its own thread.

use crate::config::PackMode;
use crate::error::{RxError, SubmitError};
use crate::transmit::{CompletionNotifier, TxBlock, TxStatus};
use crate::{Handle, RadioReceiver, RadioTransmitter, RxBlock};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use failure::{format_err, Error};
use num::Complex;
use parking_lot::Mutex;
use rand::{distributions::Distribution, rngs::StdRng, Rng, SeedableRng};
use rand_distr::Normal;
use std::f32::consts::PI;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Something going wrong in the simulated transport
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Block number `block` (counting from 0) on `handle` arrives `samples` later than it should
    Gap {
        handle: Handle,
        block: u64,
        samples: u64,
    },
    /// Block number `block` on `handle` arrives `samples` earlier than it should
    Backward {
        handle: Handle,
        block: u64,
        samples: u64,
    },
    /// One overrun is reported once this many blocks have been delivered on the card
    Overrun { after_blocks: u64 },
    /// Every receive call fails with `code` once this many blocks have been delivered
    Fatal { after_blocks: u64, code: i32 },
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Handles the card produces blocks on, served round-robin. Streaming a subset of these makes
    /// the rest show up as unexpected blocks
    pub handles: Vec<Handle>,
    /// Payload words per block. The real transport never delivers more than
    /// `MAX_RX_BLOCK_SIZE_IN_WORDS - RX_HEADER_SIZE_IN_WORDS`
    pub payload_words: u32,
    /// RF timestamp of the first block on every handle
    pub start_timestamp: u64,
    pub pack_mode: PackMode,
    /// Stop producing blocks on a handle after this many
    pub blocks_per_handle: Option<u64>,
    pub faults: Vec<Fault>,
    /// Probability that a receive call finds no block ready
    pub no_data_probability: f64,
    /// Frequency of the test tone in cycles/sample
    pub tone: f32,
    /// Amplitude of the test tone in ADC counts
    pub amplitude: f32,
    /// Standard deviation of the gaussian noise added to the tone, in ADC counts
    pub noise: f32,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            handles: vec![Handle::A1],
            payload_words: crate::MAX_RX_BLOCK_SIZE_IN_WORDS - crate::RX_HEADER_SIZE_IN_WORDS,
            start_timestamp: 0,
            pack_mode: PackMode::Unpacked,
            blocks_per_handle: None,
            faults: Vec::new(),
            no_data_probability: 0.,
            tone: 0.01,
            amplitude: 1000.,
            noise: 50.,
            seed: 0,
        }
    }
}

struct HandleSim {
    handle: Handle,
    next_timestamp: u64,
    delivered: u64,
}

pub struct SimulatedCard {
    config: SimulatorConfig,
    rng: StdRng,
    noise: Normal<f32>,
    handles: Vec<HandleSim>,
    /// Next handle to serve
    cursor: usize,
    /// Blocks delivered on all handles together
    delivered: u64,
    /// Which faults have already fired. Only overruns consult this
    fired: Vec<bool>,
    streaming: bool,
    buf: Vec<u8>,
}

impl SimulatedCard {
    pub fn new(config: SimulatorConfig) -> Result<Self, Error> {
        if config.handles.is_empty() {
            return Err(format_err!("simulated card needs at least one handle"));
        }
        if config.payload_words == 0 {
            return Err(format_err!("simulated blocks need a non-empty payload"));
        }
        let noise = Normal::new(0., config.noise)?;
        let handles = config
            .handles
            .iter()
            .map(|handle| HandleSim {
                handle: *handle,
                next_timestamp: config.start_timestamp,
                delivered: 0,
            })
            .collect();
        Ok(SimulatedCard {
            rng: StdRng::seed_from_u64(config.seed),
            noise,
            handles,
            cursor: 0,
            delivered: 0,
            fired: vec![false; config.faults.len()],
            streaming: false,
            buf: Vec::with_capacity(config.payload_words as usize * 4),
            config,
        })
    }

    /// Blocks delivered so far, over all handles
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn exhausted(&self, sim: &HandleSim) -> bool {
        self.config
            .blocks_per_handle
            .map_or(false, |n| sim.delivered >= n)
    }

    /// Transport-level fault due at this point, if any
    fn transport_fault(&mut self) -> Option<RxError> {
        for (i, fault) in self.config.faults.iter().enumerate() {
            match *fault {
                Fault::Fatal { after_blocks, code } if self.delivered >= after_blocks => {
                    return Some(RxError::Generic(code));
                }
                Fault::Overrun { after_blocks } if self.delivered >= after_blocks => {
                    if !self.fired[i] {
                        self.fired[i] = true;
                        return Some(RxError::Overrun);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Timestamp shift to apply before delivering block `block` on `handle`
    fn discontinuity(&self, handle: Handle, block: u64) -> i128 {
        self.config
            .faults
            .iter()
            .map(|fault| match *fault {
                Fault::Gap {
                    handle: h,
                    block: b,
                    samples,
                } if h == handle && b == block => i128::from(samples),
                Fault::Backward {
                    handle: h,
                    block: b,
                    samples,
                } if h == handle && b == block => -i128::from(samples),
                _ => 0,
            })
            .sum()
    }

    /// Fill `buf` with one block of payload starting at sample `timestamp`
    fn fill(&mut self, timestamp: u64) {
        self.buf.clear();
        let words = self.config.payload_words;
        match self.config.pack_mode {
            PackMode::Unpacked => {
                for i in 0..u64::from(words) {
                    let n = timestamp.wrapping_add(i);
                    // Keep the phase argument small so f32 does not lose the tone
                    let cycles = (n as f64 * f64::from(self.config.tone)).fract() as f32;
                    let mut samp = Complex::from_polar(&self.config.amplitude, &(2. * PI * cycles));
                    samp += Complex::new(
                        self.noise.sample(&mut self.rng),
                        self.noise.sample(&mut self.rng),
                    );
                    let iq: Complex<i16> = Complex::new(clamp(samp.re), clamp(samp.im));
                    self.buf.extend_from_slice(&iq.re.to_le_bytes());
                    self.buf.extend_from_slice(&iq.im.to_le_bytes());
                }
            }
            PackMode::Packed => {
                // 12-bit samples straddle word boundaries, so only the length matters here
                for _ in 0..words {
                    let word: u32 = self.rng.gen();
                    self.buf.extend_from_slice(&word.to_le_bytes());
                }
            }
        }
    }
}

fn clamp(x: f32) -> i16 {
    x.round().max(f32::from(i16::MIN)).min(f32::from(i16::MAX)) as i16
}

impl RadioReceiver for SimulatedCard {
    fn start_streaming(&mut self, handles: &[Handle]) -> Result<(), Error> {
        for handle in handles {
            if !self.config.handles.contains(handle) {
                return Err(format_err!("handle {} is not configured on this card", handle));
            }
        }
        self.streaming = true;
        Ok(())
    }

    fn receive_block(&mut self) -> Result<Option<RxBlock<'_>>, RxError> {
        if !self.streaming {
            return Err(RxError::NotStreaming);
        }
        if let Some(err) = self.transport_fault() {
            return Err(err);
        }
        if self.config.no_data_probability > 0.
            && self.rng.gen::<f64>() < self.config.no_data_probability
        {
            return Ok(None);
        }

        // Next handle that still has blocks to give, round-robin
        let n = self.handles.len();
        let idx = match (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&i| !self.exhausted(&self.handles[i]))
        {
            Some(idx) => idx,
            None => return Ok(None),
        };
        self.cursor = (idx + 1) % n;

        let (handle, block) = (self.handles[idx].handle, self.handles[idx].delivered);
        let shift = self.discontinuity(handle, block);
        let samples = self.config.pack_mode.samples_in_words(self.config.payload_words);
        let sim = &mut self.handles[idx];
        // A backward fault larger than the elapsed time pins the timestamp at 0
        let timestamp =
            (i128::from(sim.next_timestamp) + shift).clamp(0, i128::from(u64::MAX)) as u64;
        sim.next_timestamp = timestamp.wrapping_add(samples);
        sim.delivered += 1;
        self.delivered += 1;

        self.fill(timestamp);
        Ok(Some(RxBlock {
            handle,
            timestamp,
            payload_words: self.config.payload_words,
            data: &self.buf,
        }))
    }

    fn stop_streaming(&mut self, _handles: &[Handle]) -> Result<(), Error> {
        self.streaming = false;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TransmitterConfig {
    /// Blocks the send queue holds before submissions are rejected as full
    pub queue_depth: usize,
    /// Time the device spends on each block
    pub block_time: Duration,
    /// Probability that a block completes late
    pub late_probability: f64,
    /// Reject every submission with a fatal status once this many blocks have been accepted
    pub fail_after: Option<u64>,
    pub seed: u64,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        TransmitterConfig {
            queue_depth: 4,
            block_time: Duration::from_micros(100),
            late_probability: 0.,
            fail_after: None,
            seed: 0,
        }
    }
}

/// Completes blocks in submission order from its own thread, calling the registered notifier
/// for each one
pub struct SimulatedTransmitter {
    config: TransmitterConfig,
    queue: Option<Sender<TxBlock>>,
    /// Taken by the completion thread once a notifier is registered
    pending: Option<Receiver<TxBlock>>,
    completer: Option<JoinHandle<()>>,
    /// Timestamps of completed blocks, in completion order
    completed: Arc<Mutex<Vec<u64>>>,
    accepted: u64,
    rejected: u64,
}

impl SimulatedTransmitter {
    pub fn new(config: TransmitterConfig) -> Self {
        let (queue, pending) = channel::bounded(config.queue_depth);
        SimulatedTransmitter {
            config,
            queue: Some(queue),
            pending: Some(pending),
            completer: None,
            completed: Arc::new(Mutex::new(Vec::new())),
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn completed_timestamps(&self) -> Vec<u64> {
        self.completed.lock().clone()
    }

    /// Blocks the queue accepted
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Submissions turned away because the queue was full
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

impl RadioTransmitter for SimulatedTransmitter {
    fn register_completion(&mut self, notifier: CompletionNotifier) {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => {
                log::warn!("simulated transmitter already has a completion notifier");
                return;
            }
        };
        let completed = self.completed.clone();
        let block_time = self.config.block_time;
        let late_probability = self.config.late_probability;
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let spawned = thread::Builder::new()
            .name("sim-tx-complete".to_string())
            .spawn(move || {
                for block in pending.iter() {
                    thread::sleep(block_time);
                    completed.lock().push(block.timestamp);
                    let status = if late_probability > 0. && rng.gen::<f64>() < late_probability {
                        TxStatus::Late
                    } else {
                        TxStatus::Complete
                    };
                    notifier.on_complete(status);
                }
            });
        match spawned {
            Ok(completer) => self.completer = Some(completer),
            Err(err) => log::error!("unable to start simulated completion thread: {}", err),
        }
    }

    fn submit_block(&mut self, _handle: Handle, block: &TxBlock) -> Result<(), SubmitError> {
        if self.config.fail_after.map_or(false, |n| self.accepted >= n) {
            return Err(SubmitError::Fatal(-1));
        }
        let queue = match &self.queue {
            Some(queue) => queue,
            None => return Err(SubmitError::Fatal(-1)),
        };
        match queue.try_send(block.clone()) {
            Ok(()) => {
                self.accepted += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.rejected += 1;
                Err(SubmitError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::Fatal(-1)),
        }
    }
}

impl Drop for SimulatedTransmitter {
    fn drop(&mut self) {
        // Closing the queue lets the completion thread finish what is left and exit
        self.queue = None;
        if let Some(completer) = self.completer.take() {
            let _ = completer.join();
        }
    }
}
