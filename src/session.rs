use crate::transmit::SpaceSignal;
use crate::{CardId, StreamKey};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct StreamCounters {
    pub packets: u64,
    pub gaps: u64,
    pub backward_jumps: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CardCounters {
    pub overruns: u64,
    pub unexpected_blocks: u64,
}

/// Everything workers share. Only ever touched under `Inner::counters`
#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    pub bytes_this_interval: u64,
    pub total_bytes: u64,
    pub streams: BTreeMap<StreamKey, StreamCounters>,
    pub cards: BTreeMap<CardId, CardCounters>,
    pub last_throughput_mbps: Option<f64>,
    pub peak_throughput_mbps: Option<f64>,
}

/// One monitor interval's view of the counters
#[derive(Debug, Clone)]
pub(crate) struct IntervalSample {
    pub throughput_mbps: f64,
    /// (stream, packets, gaps)
    pub streams: Vec<(StreamKey, u64, u64)>,
}

struct Inner {
    running: AtomicBool,
    counters: Mutex<Counters>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    /// Transmit pipelines to wake when the session stops
    signals: Mutex<Vec<Weak<SpaceSignal>>>,
}

/// State shared by every worker of one streaming session: the running flag and the aggregate
/// counters. Cloning gives another handle to the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = channel::bounded(1);
        Session {
            inner: Arc::new(Inner {
                running: AtomicBool::new(true),
                counters: Mutex::new(Counters::default()),
                stop_tx,
                stop_rx,
                signals: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Ask every worker to wind down. Workers notice between transport calls
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            log::info!("stopping streaming session");
        }
        let _ = self.inner.stop_tx.try_send(());
        for signal in self.inner.signals.lock().drain(..) {
            if let Some(signal) = signal.upgrade() {
                signal.close();
            }
        }
    }

    /// Close `signal` when the session stops, so nobody stays parked in `wait_for_space`
    pub(crate) fn watch(&self, signal: &Arc<SpaceSignal>) {
        let mut signals = self.inner.signals.lock();
        if !self.is_running() {
            signal.close();
            return;
        }
        signals.retain(|s| s.strong_count() > 0);
        signals.push(Arc::downgrade(signal));
    }

    /// Fires once `stop` has been called
    pub(crate) fn stop_requested(&self) -> Receiver<()> {
        self.inner.stop_rx.clone()
    }

    /// Make `key` show up in reports even if it never delivers a block
    pub(crate) fn register_stream(&self, key: StreamKey) {
        let mut counters = self.inner.counters.lock();
        counters.streams.entry(key).or_default();
        counters.cards.entry(key.card).or_default();
    }

    pub(crate) fn record_block(&self, key: StreamKey, bytes: u64, gaps: u64, backward: u64) {
        let mut counters = self.inner.counters.lock();
        counters.bytes_this_interval += bytes;
        counters.total_bytes += bytes;
        let stream = counters.streams.entry(key).or_default();
        stream.packets += 1;
        stream.bytes += bytes;
        stream.gaps += gaps;
        stream.backward_jumps += backward;
    }

    pub(crate) fn record_tx(&self, key: StreamKey, bytes: u64) {
        self.record_block(key, bytes, 0, 0);
    }

    pub(crate) fn record_overrun(&self, card: CardId) {
        self.inner.counters.lock().cards.entry(card).or_default().overruns += 1;
    }

    pub(crate) fn record_unexpected(&self, card: CardId) {
        self.inner
            .counters
            .lock()
            .cards
            .entry(card)
            .or_default()
            .unexpected_blocks += 1;
    }

    /// Compute throughput over the last `elapsed` and start a new interval
    pub(crate) fn sample(&self, elapsed: Duration) -> IntervalSample {
        let mut counters = self.inner.counters.lock();
        let secs = elapsed.as_secs_f64();
        let throughput_mbps = if secs > 0. {
            counters.bytes_this_interval as f64 / secs / 1e6
        } else {
            0.
        };
        counters.bytes_this_interval = 0;
        counters.last_throughput_mbps = Some(throughput_mbps);
        counters.peak_throughput_mbps = Some(
            counters
                .peak_throughput_mbps
                .map_or(throughput_mbps, |peak| peak.max(throughput_mbps)),
        );
        IntervalSample {
            throughput_mbps,
            streams: counters
                .streams
                .iter()
                .map(|(key, s)| (*key, s.packets, s.gaps))
                .collect(),
        }
    }

    pub(crate) fn counters(&self) -> Counters {
        self.inner.counters.lock().clone()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handle;

    #[test]
    fn sample_resets_interval_bytes_only() {
        let session = Session::new();
        let key = StreamKey::new(0, Handle::A1);
        session.record_block(key, 2_000_000, 0, 0);
        session.record_block(key, 2_000_000, 1, 0);

        let sample = session.sample(Duration::from_secs(2));
        assert!((sample.throughput_mbps - 2.0).abs() < 1e-9);
        assert_eq!(sample.streams, vec![(key, 2, 1)]);

        let sample = session.sample(Duration::from_secs(1));
        assert_eq!(sample.throughput_mbps, 0.);
        let counters = session.counters();
        assert_eq!(counters.total_bytes, 4_000_000);
        assert_eq!(counters.peak_throughput_mbps, Some(2.0));
        assert_eq!(counters.last_throughput_mbps, Some(0.));
    }

    #[test]
    fn stop_closes_watched_signals() {
        let session = Session::new();
        let signal = Arc::new(SpaceSignal::new());
        session.watch(&signal);
        assert!(!signal.is_closed());
        session.stop();
        assert!(!session.is_running());
        assert!(signal.is_closed());
        assert!(session.stop_requested().try_recv().is_ok());

        // Watching after the fact closes straight away
        let late = Arc::new(SpaceSignal::new());
        session.watch(&late);
        assert!(late.is_closed());
    }

    #[test]
    fn clones_share_state() {
        let session = Session::new();
        let other = session.clone();
        other.record_overrun(3);
        other.stop();
        assert!(!session.is_running());
        assert_eq!(session.counters().cards[&3].overruns, 1);
    }
}
