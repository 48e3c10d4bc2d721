use failure::{format_err, Error};
use iqstream::{
    BlockSink, Fault, Handle, PackMode, RadioReceiver, RxBlock, RxError, SimulatedCard,
    SimulatorConfig, Staging, StreamAggregator, StreamConfig, StreamKey, ThresholdError,
    Thresholds, WorkerState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn card(handles: Vec<Handle>, blocks: Option<u64>, faults: Vec<Fault>) -> SimulatedCard {
    SimulatedCard::new(SimulatorConfig {
        handles,
        payload_words: 256,
        blocks_per_handle: blocks,
        faults,
        ..SimulatorConfig::default()
    })
    .unwrap()
}

/// Hands out `blocks` continuous blocks on A1, then keeps returning `then` (or "no data").
/// Logs every start and stop call
struct RecordingReceiver {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_start: bool,
    blocks: u64,
    then: Option<RxError>,
    timestamp: u64,
    data: Vec<u8>,
}

impl RecordingReceiver {
    fn new(blocks: u64, then: Option<RxError>) -> Self {
        RecordingReceiver {
            calls: Arc::default(),
            fail_start: false,
            blocks,
            then,
            timestamp: 0,
            data: vec![0; 4 * 64],
        }
    }
}

impl RadioReceiver for RecordingReceiver {
    fn start_streaming(&mut self, _handles: &[Handle]) -> Result<(), Error> {
        self.calls.lock().push("start");
        if self.fail_start {
            return Err(format_err!("device not found"));
        }
        Ok(())
    }

    fn receive_block(&mut self) -> Result<Option<RxBlock<'_>>, RxError> {
        if self.blocks == 0 {
            return match self.then {
                Some(err) => Err(err),
                None => Ok(None),
            };
        }
        self.blocks -= 1;
        let timestamp = self.timestamp;
        self.timestamp += 64;
        Ok(Some(RxBlock {
            handle: Handle::A1,
            timestamp,
            payload_words: 64,
            data: &self.data,
        }))
    }

    fn stop_streaming(&mut self, _handles: &[Handle]) -> Result<(), Error> {
        self.calls.lock().push("stop");
        Ok(())
    }
}

struct FullDisk;

impl BlockSink for FullDisk {
    fn write_block(&mut self, _key: StreamKey, _timestamp: u64, _data: &[u8]) -> Result<(), Error> {
        Err(format_err!("disk full"))
    }
}

fn blocks(n: u64) -> StreamConfig {
    StreamConfig {
        blocks_per_handle: Some(n),
        ..StreamConfig::default()
    }
}

#[test]
fn gap_is_attributed_to_its_handle() {
    let mut agg = StreamAggregator::new(blocks(100)).unwrap();
    let sim = card(
        vec![Handle::A1, Handle::B1],
        Some(100),
        vec![Fault::Gap {
            handle: Handle::B1,
            block: 50,
            samples: 1000,
        }],
    );
    agg.spawn_card(0, vec![Handle::A1, Handle::B1], sim).unwrap();
    let report = agg.join();

    let a = report.stream(StreamKey::new(0, Handle::A1)).unwrap();
    let b = report.stream(StreamKey::new(0, Handle::B1)).unwrap();
    assert_eq!(a.gaps, 0);
    assert_eq!(b.gaps, 1);
    assert_eq!(b.backward_jumps, 0);
    assert_eq!(report.total_packets(), 200);
    assert_eq!(report.total_bytes, 200 * 256 * 4);
    assert_eq!(report.faults().count(), 0);

    let thresholds = Thresholds {
        max_gaps: Some(1),
        ..Thresholds::default()
    };
    match report.evaluate(&thresholds) {
        Err(ThresholdError::TooManyGaps { key, gaps, .. }) => {
            assert_eq!(key, StreamKey::new(0, Handle::B1));
            assert_eq!(gaps, 1);
        }
        other => panic!("unexpected evaluation {:?}", other),
    }
}

#[test]
fn backward_jump_counts_as_gap() {
    let mut agg = StreamAggregator::new(blocks(40)).unwrap();
    let sim = card(
        vec![Handle::A1],
        Some(40),
        vec![Fault::Backward {
            handle: Handle::A1,
            block: 20,
            samples: 500,
        }],
    );
    agg.spawn_card(0, vec![Handle::A1], sim).unwrap();
    let report = agg.join();
    let a = report.stream(StreamKey::new(0, Handle::A1)).unwrap();
    assert_eq!((a.packets, a.gaps, a.backward_jumps), (40, 1, 1));
}

#[test]
fn faulted_card_does_not_stop_the_others() {
    let mut agg = StreamAggregator::new(blocks(50)).unwrap();
    agg.spawn_card(0, vec![Handle::A1], card(vec![Handle::A1], Some(50), vec![]))
        .unwrap();
    agg.spawn_card(
        1,
        vec![Handle::A1],
        card(
            vec![Handle::A1],
            Some(50),
            vec![Fault::Fatal {
                after_blocks: 10,
                code: -6,
            }],
        ),
    )
    .unwrap();
    let report = agg.join();

    assert_eq!(report.stream(StreamKey::new(0, Handle::A1)).unwrap().packets, 50);
    assert_eq!(report.stream(StreamKey::new(1, Handle::A1)).unwrap().packets, 10);
    assert_eq!(report.cards[&0].fault, None);
    let faults: Vec<_> = report.faults().collect();
    assert_eq!(faults, vec![(1, "receive failed with status -6")]);
    assert!(matches!(
        report.evaluate(&Thresholds::default()),
        Err(ThresholdError::Faulted { card: 1, .. })
    ));
}

#[test]
fn overrun_is_counted_not_fatal() {
    let mut agg = StreamAggregator::new(blocks(20)).unwrap();
    let sim = card(
        vec![Handle::A1],
        Some(20),
        vec![Fault::Overrun { after_blocks: 5 }],
    );
    agg.spawn_card(3, vec![Handle::A1], sim).unwrap();
    let report = agg.join();
    assert_eq!(report.cards[&3].overruns, 1);
    assert_eq!(report.cards[&3].fault, None);
    assert_eq!(report.total_packets(), 20);
}

#[test]
fn blocks_from_unrequested_handles_are_counted() {
    let mut agg = StreamAggregator::new(blocks(10)).unwrap();
    let sim = card(vec![Handle::A1, Handle::B1], Some(10), vec![]);
    agg.spawn_card(0, vec![Handle::A1], sim).unwrap();
    let report = agg.join();
    assert_eq!(report.total_packets(), 10);
    // B1 interleaves with A1 and gets one block in before each A1 block but the first
    assert_eq!(report.cards[&0].unexpected_blocks, 9);
    assert!(report.stream(StreamKey::new(0, Handle::B1)).is_none());
}

#[test]
fn packed_buffered_stream_is_continuous() {
    let config = StreamConfig {
        pack_mode: PackMode::Packed,
        staging: Staging::Buffered,
        blocks_per_handle: Some(100),
        ..StreamConfig::default()
    };
    let mut agg = StreamAggregator::new(config).unwrap();
    let sim = SimulatedCard::new(SimulatorConfig {
        handles: vec![Handle::A1, Handle::A2],
        payload_words: 1017,
        pack_mode: PackMode::Packed,
        blocks_per_handle: Some(100),
        ..SimulatorConfig::default()
    })
    .unwrap();
    agg.spawn_card(0, vec![Handle::A1, Handle::A2], sim).unwrap();
    let report = agg.join();
    assert_eq!(report.total_packets(), 200);
    assert_eq!(report.total_gaps(), 0);
}

#[test]
fn stop_ends_an_unbounded_session() {
    let mut agg = StreamAggregator::new(StreamConfig::default()).unwrap();
    let sim = SimulatedCard::new(SimulatorConfig {
        payload_words: 64,
        no_data_probability: 0.5,
        ..SimulatorConfig::default()
    })
    .unwrap();
    agg.spawn_card(0, vec![Handle::A1], sim).unwrap();
    agg.start_monitor().unwrap();

    let session = agg.session();
    thread::sleep(Duration::from_millis(50));
    agg.stop();
    assert!(!session.is_running());

    let report = agg.join();
    assert!(report.total_packets() > 0);
    assert_eq!(report.total_gaps(), 0);
    assert_eq!(report.faults().count(), 0);
}

#[test]
fn run_time_stops_the_session_and_measures_throughput() {
    let config = StreamConfig {
        monitor_interval_ms: 100,
        run_time_secs: Some(1),
        ..StreamConfig::default()
    };
    let mut agg = StreamAggregator::new(config).unwrap();
    agg.run(vec![
        (0, vec![Handle::A1], card(vec![Handle::A1], None, vec![])),
        (1, vec![Handle::A1], card(vec![Handle::A1], None, vec![])),
    ])
    .unwrap();
    let report = agg.join();

    let last = report.last_throughput_mbps.unwrap();
    let peak = report.peak_throughput_mbps.unwrap();
    assert!(last > 0.);
    assert!(peak >= last);
    assert_eq!(report.cards.len(), 2);
    assert_eq!(report.cards[&0].workers, 1);
}

#[test]
fn completed_card_stops_its_transport() {
    let rx = RecordingReceiver::new(8, None);
    let calls = rx.calls.clone();
    let mut agg = StreamAggregator::new(blocks(8)).unwrap();
    agg.spawn_card(0, vec![Handle::A1], rx).unwrap();
    let report = agg.join();

    assert_eq!(*calls.lock(), vec!["start", "stop"]);
    let card = &report.cards[&0];
    assert_eq!(card.shutdown, Some(WorkerState::Stopping));
    assert_eq!(card.fault, None);
    assert_eq!(report.stream(StreamKey::new(0, Handle::A1)).unwrap().gaps, 0);
}

#[test]
fn fatal_receive_status_skips_the_stop_call() {
    let rx = RecordingReceiver::new(3, Some(RxError::Generic(-6)));
    let calls = rx.calls.clone();
    let mut agg = StreamAggregator::new(blocks(8)).unwrap();
    agg.spawn_card(0, vec![Handle::A1], rx).unwrap();
    let report = agg.join();

    assert_eq!(*calls.lock(), vec!["start"]);
    let card = &report.cards[&0];
    assert_eq!(card.shutdown, Some(WorkerState::Faulted));
    assert!(card.fault.is_some());
    assert_eq!(report.stream(StreamKey::new(0, Handle::A1)).unwrap().packets, 3);
}

#[test]
fn failed_start_is_a_fault() {
    let mut rx = RecordingReceiver::new(8, None);
    rx.fail_start = true;
    let calls = rx.calls.clone();
    let mut agg = StreamAggregator::new(blocks(8)).unwrap();
    agg.spawn_card(0, vec![Handle::A1], rx).unwrap();
    let report = agg.join();

    assert_eq!(*calls.lock(), vec!["start"]);
    let card = &report.cards[&0];
    assert_eq!(card.shutdown, Some(WorkerState::Faulted));
    assert_eq!(card.fault.as_deref(), Some("device not found"));
}

#[test]
fn sink_failure_still_stops_the_transport() {
    let rx = RecordingReceiver::new(8, None);
    let calls = rx.calls.clone();
    let mut agg = StreamAggregator::new(blocks(8)).unwrap();
    agg.spawn_card_with_sink(0, vec![Handle::A1], rx, FullDisk)
        .unwrap();
    let report = agg.join();

    assert_eq!(*calls.lock(), vec!["start", "stop"]);
    let card = &report.cards[&0];
    assert_eq!(card.shutdown, Some(WorkerState::Stopping));
    assert_eq!(card.fault.as_deref(), Some("disk full"));
    // A sink that cannot keep up fails the session like any other fault
    assert!(report
        .violations(&Thresholds::default())
        .iter()
        .any(|v| matches!(v, ThresholdError::Faulted { card: 0, .. })));
}
