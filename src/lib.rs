mod aggregator;
mod config;
mod continuity;
mod error;
mod report;
mod ring_buffer;
mod session;
#[cfg(feature = "sidekiq")]
mod sidekiq;
mod simulator;
mod transmit;

pub use aggregator::{StreamAggregator, WorkerState};
pub use config::{PackMode, Staging, StreamConfig, Thresholds};
pub use continuity::{ContinuityResult, ContinuityTracker};
pub use error::{RingError, RxError, StreamError, SubmitError, ThresholdError, TransmitError};
pub use report::{AggregateReport, CardReport, HandleReport};
pub use ring_buffer::RingBuffer;
pub use session::Session;
#[cfg(feature = "sidekiq")]
pub use sidekiq::{Sidekiq, SidekiqCard, SidekiqTx};
pub use simulator::{Fault, SimulatedCard, SimulatedTransmitter, SimulatorConfig, TransmitterConfig};
pub use transmit::{
    CompletionNotifier, SpaceSignal, TransmitPipeline, TransmitReport, TransmitStream, TxBlock,
    TxStatus,
};

use failure::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of 32-bit words of metadata in front of every receive block's payload
pub const RX_HEADER_SIZE_IN_WORDS: u32 = 6;
/// Largest receive block (header included) the transport hands out, in words
pub const MAX_RX_BLOCK_SIZE_IN_WORDS: u32 = 1024;

/// Index of a card in the system
pub type CardId = u8;

/// One antenna/RF chain on a card, streamed independently of the others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u8);

impl Handle {
    pub const A1: Handle = Handle(0);
    pub const A2: Handle = Handle(1);
    pub const B1: Handle = Handle(2);
    pub const B2: Handle = Handle(3);
    pub const C1: Handle = Handle(4);
    pub const D1: Handle = Handle(5);
}

const HANDLE_NAMES: [&str; 6] = ["A1", "A2", "B1", "B2", "C1", "D1"];

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match HANDLE_NAMES.get(self.0 as usize) {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "H{}", self.0),
        }
    }
}

impl FromStr for Handle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if let Some(i) = HANDLE_NAMES.iter().position(|n| n.eq_ignore_ascii_case(s)) {
            return Ok(Handle(i as u8));
        }
        if s.len() > 1 && (s.starts_with('H') || s.starts_with('h')) {
            if let Ok(n) = s[1..].parse::<u8>() {
                return Ok(Handle(n));
            }
        }
        Err(failure::format_err!("unknown handle '{}'", s))
    }
}

/// A handle on a particular card. This is the key all per-stream state is tracked under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub card: CardId,
    pub handle: Handle,
}

impl StreamKey {
    pub fn new(card: CardId, handle: Handle) -> Self {
        StreamKey { card, handle }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.card, self.handle)
    }
}

/// A block of samples as delivered by the transport. `data` borrows the transport's buffer and is
/// only valid until the next call to `receive_block`
#[derive(Debug)]
pub struct RxBlock<'a> {
    pub handle: Handle,
    /// RF timestamp of the first sample in the block
    pub timestamp: u64,
    /// Number of 32-bit payload words (header excluded)
    pub payload_words: u32,
    pub data: &'a [u8],
}

/// Receive sample blocks from a real or simulated card
pub trait RadioReceiver: Send {
    /// Start streaming on the given handles
    fn start_streaming(&mut self, handles: &[Handle]) -> Result<(), Error>;
    /// Poll for the next block from any streaming handle. Returns `Ok(None)` when no block is
    /// ready yet. Implementations should not block indefinitely, since workers only observe a
    /// stop request between calls
    fn receive_block(&mut self) -> Result<Option<RxBlock<'_>>, RxError>;
    fn stop_streaming(&mut self, handles: &[Handle]) -> Result<(), Error>;
}

/// Submit blocks for transmission to a real or simulated card
pub trait RadioTransmitter: Send {
    /// Hand over the notifier the transport must call (from any thread) whenever a block it
    /// accepted finishes transmission
    fn register_completion(&mut self, notifier: CompletionNotifier);
    /// Queue `block` on `handle`. `SubmitError::QueueFull` means nothing was queued
    fn submit_block(&mut self, handle: Handle, block: &TxBlock) -> Result<(), SubmitError>;
    fn start_streaming(&mut self, _handle: Handle) -> Result<(), Error> {
        Ok(())
    }
    fn stop_streaming(&mut self, _handle: Handle) -> Result<(), Error> {
        Ok(())
    }
    /// Late and underrun blocks on `handle` that the device counted itself rather than flagging
    /// on the individual completions
    fn device_late_count(&self, _handle: Handle) -> u64 {
        0
    }
}

/// Where received blocks end up (a file, a socket, ...)
pub trait BlockSink: Send {
    fn write_block(&mut self, key: StreamKey, timestamp: u64, data: &[u8]) -> Result<(), Error>;
}

/// Discards every block
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl BlockSink for NullSink {
    fn write_block(&mut self, _key: StreamKey, _timestamp: u64, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_names_round_trip() {
        for (i, name) in HANDLE_NAMES.iter().enumerate() {
            let handle: Handle = name.parse().unwrap();
            assert_eq!(handle, Handle(i as u8));
            assert_eq!(handle.to_string(), *name);
        }
        assert_eq!("h9".parse::<Handle>().unwrap(), Handle(9));
        assert_eq!(Handle(9).to_string(), "H9");
        assert!("Z1".parse::<Handle>().is_err());
    }

    #[test]
    fn stream_keys_order_by_card_then_handle() {
        let mut keys = vec![
            StreamKey::new(1, Handle::A1),
            StreamKey::new(0, Handle::B1),
            StreamKey::new(0, Handle::A1),
        ];
        keys.sort();
        assert_eq!(keys[0], StreamKey::new(0, Handle::A1));
        assert_eq!(keys[2].to_string(), "1/A1");
    }
}
