#![allow(non_upper_case_globals, non_camel_case_types, non_snake_case, dead_code)]
include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

use crate::config::PackMode;
use crate::error::{RxError, SubmitError};
use crate::transmit::{CompletionNotifier, TxBlock, TxStatus};
use crate::{CardId, Handle, RadioReceiver, RadioTransmitter, RxBlock, RX_HEADER_SIZE_IN_WORDS};

use failure::{format_err, Error};
use std::collections::HashMap;
use std::os::raw::c_void;
use std::ptr;

/// Words of metadata in front of a transmit block's samples
const TX_HEADER_SIZE_IN_WORDS: usize = 4;

/// libsidekiq is initialised once for every card the process uses, and shut down when this is
/// dropped. Keep it alive for as long as any `SidekiqCard` or `SidekiqTx` is in use
pub struct Sidekiq {
    cards: Vec<CardId>,
}

impl Sidekiq {
    pub fn init(cards: &[CardId]) -> Result<Self, Error> {
        let mut list = cards.to_vec();
        let status = unsafe {
            skiq_init(
                skiq_xport_type_auto,
                skiq_xport_init_level_full,
                list.as_mut_ptr(),
                list.len() as u8,
            )
        };
        if status != 0 {
            return Err(format_err!(
                "unable to initialise libsidekiq for cards {:?}: status {}",
                cards,
                status
            ));
        }
        log::info!("libsidekiq initialised for cards {:?}", cards);
        Ok(Sidekiq { cards: list })
    }

    pub fn cards(&self) -> &[CardId] {
        &self.cards
    }
}

impl Drop for Sidekiq {
    fn drop(&mut self) {
        unsafe {
            skiq_exit();
        }
    }
}

fn rx_handles(handles: &[Handle]) -> Vec<skiq_rx_hdl_t> {
    handles.iter().map(|h| h.0 as skiq_rx_hdl_t).collect()
}

/// Receives from the handles of one card through `skiq_receive`
pub struct SidekiqCard {
    card: CardId,
    /// Block most recently handed out by `skiq_receive`. Owned by libsidekiq and only valid until
    /// the next receive call
    block: *mut skiq_rx_block_t,
}

/// Each card is driven from exactly one worker thread
unsafe impl Send for SidekiqCard {}

impl SidekiqCard {
    pub fn new(card: CardId, pack_mode: PackMode) -> Result<Self, Error> {
        let packed = pack_mode == PackMode::Packed;
        let status = unsafe { skiq_write_iq_pack_mode(card, packed) };
        if status != 0 {
            return Err(format_err!(
                "unable to set pack mode on card {}: status {}",
                card,
                status
            ));
        }
        Ok(SidekiqCard {
            card,
            block: ptr::null_mut(),
        })
    }
}

impl RadioReceiver for SidekiqCard {
    fn start_streaming(&mut self, handles: &[Handle]) -> Result<(), Error> {
        let mut hdls = rx_handles(handles);
        let status = unsafe {
            skiq_start_rx_streaming_multi_immediate(self.card, hdls.as_mut_ptr(), hdls.len() as u8)
        };
        if status != 0 {
            return Err(format_err!(
                "receive streaming failed to start on card {}: status {}",
                self.card,
                status
            ));
        }
        Ok(())
    }

    fn receive_block(&mut self) -> Result<Option<RxBlock<'_>>, RxError> {
        let mut hdl: skiq_rx_hdl_t = 0;
        let mut len: u32 = 0;
        let status = unsafe { skiq_receive(self.card, &mut hdl, &mut self.block, &mut len) } as i32;
        match status {
            0 => {}
            -1 => return Ok(None),
            -11 => return Err(RxError::Overrun),
            -12 => return Err(RxError::Malformed),
            -29 => return Err(RxError::NotStreaming),
            code => return Err(RxError::Generic(code)),
        }

        let header_bytes = RX_HEADER_SIZE_IN_WORDS as usize * 4;
        if self.block.is_null() || (len as usize) < header_bytes {
            return Err(RxError::Malformed);
        }
        // The RF timestamp is the first field of the header
        let base = self.block as *const u8;
        let (timestamp, data) = unsafe {
            (
                ptr::read_unaligned(base as *const u64),
                std::slice::from_raw_parts(base.add(header_bytes), len as usize - header_bytes),
            )
        };
        Ok(Some(RxBlock {
            handle: Handle(hdl as u8),
            timestamp,
            payload_words: len / 4 - RX_HEADER_SIZE_IN_WORDS,
            data,
        }))
    }

    fn stop_streaming(&mut self, handles: &[Handle]) -> Result<(), Error> {
        let mut hdls = rx_handles(handles);
        let status = unsafe {
            skiq_stop_rx_streaming_multi_immediate(self.card, hdls.as_mut_ptr(), hdls.len() as u8)
        };
        if status != 0 {
            return Err(format_err!(
                "receive streaming failed to stop on card {}: status {}",
                self.card,
                status
            ));
        }
        Ok(())
    }
}

/// Called by libsidekiq from its own thread for every block `skiq_transmit` accepted
unsafe extern "C" fn tx_complete(status: i32, block: *mut skiq_tx_block_t, user: *mut c_void) {
    if !user.is_null() {
        let notifier = &*(user as *const CompletionNotifier);
        let status = if status == 0 {
            TxStatus::Complete
        } else {
            TxStatus::Failed(status)
        };
        notifier.on_complete(status);
    }
    if !block.is_null() {
        skiq_tx_block_free(block);
    }
}

/// Asynchronous transmit on one card. Blocks are copied into libsidekiq-allocated buffers, which
/// are freed once their completion arrives.
///
/// libsidekiq does not flag late blocks on their completions. It counts late timestamps and
/// underruns per handle instead, and those counts are read when streaming stops.
pub struct SidekiqTx {
    card: CardId,
    /// Boxed so the pointer handed to libsidekiq stays put
    notifier: Option<Box<CompletionNotifier>>,
    /// Late timestamps plus underruns, per handle, as of the last `stop_streaming`
    late: HashMap<Handle, u64>,
}

unsafe impl Send for SidekiqTx {}

impl SidekiqTx {
    pub fn new(card: CardId) -> Self {
        SidekiqTx {
            card,
            notifier: None,
            late: HashMap::new(),
        }
    }

    fn read_late(&self, hdl: skiq_tx_hdl_t) -> Result<u64, Error> {
        let mut late_timestamps: u32 = 0;
        let mut underruns: u32 = 0;
        let status = unsafe {
            match skiq_read_tx_num_late_timestamps(self.card, hdl, &mut late_timestamps) {
                0 => skiq_read_tx_num_underruns(self.card, hdl, &mut underruns),
                status => status,
            }
        };
        if status != 0 {
            return Err(format_err!(
                "unable to read transmit error counters on card {}: status {}",
                self.card,
                status
            ));
        }
        log::info!(
            "card {}: {} late timestamps, {} underruns",
            self.card,
            late_timestamps,
            underruns
        );
        Ok(u64::from(late_timestamps) + u64::from(underruns))
    }
}

impl RadioTransmitter for SidekiqTx {
    fn register_completion(&mut self, notifier: CompletionNotifier) {
        let status = unsafe { skiq_register_tx_complete_callback(self.card, Some(tx_complete)) };
        if status != 0 {
            log::error!(
                "unable to register transmit completion on card {}: status {}",
                self.card,
                status
            );
        }
        self.notifier = Some(Box::new(notifier));
    }

    fn submit_block(&mut self, handle: Handle, block: &TxBlock) -> Result<(), SubmitError> {
        let user = match &self.notifier {
            Some(notifier) => &**notifier as *const CompletionNotifier as *mut c_void,
            None => ptr::null_mut(),
        };
        let raw = unsafe { skiq_tx_block_allocate(block.words()) };
        if raw.is_null() {
            return Err(SubmitError::Fatal(-12));
        }
        let status = unsafe {
            let dst = (raw as *mut u8).add(TX_HEADER_SIZE_IN_WORDS * 4);
            ptr::copy_nonoverlapping(block.data.as_ptr(), dst, block.words() as usize * 4);
            skiq_tx_set_block_timestamp(raw, block.timestamp);
            skiq_transmit(self.card, handle.0 as skiq_tx_hdl_t, raw, user)
        };

        if status == 0 {
            return Ok(());
        }
        // Not accepted, so no completion will ever free it
        unsafe { skiq_tx_block_free(raw) };
        if status == SKIQ_TX_ASYNC_SEND_QUEUE_FULL as i32 {
            Err(SubmitError::QueueFull)
        } else {
            Err(SubmitError::Fatal(status))
        }
    }

    fn start_streaming(&mut self, handle: Handle) -> Result<(), Error> {
        let hdl = handle.0 as skiq_tx_hdl_t;
        let status = unsafe {
            match skiq_write_tx_transfer_mode(self.card, hdl, skiq_tx_transfer_mode_async) {
                0 => skiq_start_tx_streaming(self.card, hdl),
                status => status,
            }
        };
        if status != 0 {
            return Err(format_err!(
                "transmit streaming failed to start on card {}: status {}",
                self.card,
                status
            ));
        }
        Ok(())
    }

    fn stop_streaming(&mut self, handle: Handle) -> Result<(), Error> {
        let hdl = handle.0 as skiq_tx_hdl_t;
        let status = unsafe { skiq_stop_tx_streaming(self.card, hdl) };
        if status != 0 {
            return Err(format_err!(
                "transmit streaming failed to stop on card {}: status {}",
                self.card,
                status
            ));
        }
        let late = self.read_late(hdl)?;
        self.late.insert(handle, late);
        Ok(())
    }

    fn device_late_count(&self, handle: Handle) -> u64 {
        self.late.get(&handle).cloned().unwrap_or(0)
    }
}

impl Drop for SidekiqTx {
    fn drop(&mut self) {
        // Completions may still reference the notifier until streaming stops
        unsafe {
            skiq_register_tx_complete_callback(self.card, None);
        }
    }
}
