//! Software fakes used by this crate's own unit tests. Not part of the
//! public API surface firmware crates build against.

#![cfg(test)]

extern crate std;
use std::vec::Vec;
use std::collections::VecDeque;

use crate::radio::{Radio, RadioError, RfConfig};

/// A `Radio` that hands back pre-queued rx frames and records every tx frame.
pub struct FakeRadio {
    rx_queue: VecDeque<Vec<u8>>,
    tx_log: Vec<Vec<u8>>,
    random_seq: VecDeque<u32>,
    busy: bool,
}

impl FakeRadio {
    pub fn new() -> Self {
        FakeRadio {
            rx_queue: VecDeque::new(),
            tx_log: Vec::new(),
            random_seq: VecDeque::new(),
            busy: false,
        }
    }

    pub fn queue_rx(&mut self, frame: &[u8]) {
        self.rx_queue.push_back(frame.to_vec());
    }

    pub fn last_sent(&self) -> Option<&[u8]> {
        self.tx_log.last().map(|v| v.as_slice())
    }

    pub fn set_random_sequence(&mut self, seq: &[u32]) {
        self.random_seq = seq.iter().copied().collect();
    }
}

impl Default for FakeRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl Radio for FakeRadio {
    fn init(&mut self, _cfg: &RfConfig) -> Result<(), RadioError> {
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        self.tx_log.push(frame.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, RadioError> {
        match self.rx_queue.pop_front() {
            None => Ok(None),
            Some(frame) => {
                if frame.len() > buf.len() {
                    return Err(RadioError::Hardware);
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(Some(frame.len()))
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    fn last_pkt_rssi_snr(&self) -> (i16, i16) {
        (-80, 8)
    }

    fn get_random_u32(&mut self) -> u32 {
        self.random_seq.pop_front().unwrap_or(0xDEAD_BEEF)
    }
}
