//! Scripted radio for protocol and scheduler tests. Inbound frames are
//! served from a queue in push order; outbound frames are recorded.

use std::collections::VecDeque;
use std::time::Duration;

use crate::{LinkError, Radio};

#[derive(Default)]
pub struct ScriptedRadio {
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<Vec<u8>>,
    send_failures: u32,
    recv_failures: u32,
    pub rssi: Option<i16>,
    pub asleep: bool,
    pub tx_enabled: bool,
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self { tx_enabled: true, ..Self::default() }
    }

    pub fn push_inbound(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
    }

    /// The next `n` sends return `LinkError::Radio`.
    pub fn fail_next_sends(&mut self, n: u32) {
        self.send_failures = n;
    }

    /// The next `n` receives return `LinkError::Radio`.
    pub fn fail_next_receives(&mut self, n: u32) {
        self.recv_failures = n;
    }

    pub fn outbound(&self) -> Vec<Vec<u8>> {
        self.outbound.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.outbound.len()
    }
}

impl Radio for ScriptedRadio {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if self.send_failures > 0 {
            self.send_failures -= 1;
            return Err(LinkError::Radio("scripted send failure".into()));
        }
        self.outbound.push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        if self.recv_failures > 0 {
            self.recv_failures -= 1;
            return Err(LinkError::Radio("scripted receive failure".into()));
        }
        Ok(self.inbound.pop_front())
    }

    fn last_rssi(&self) -> Option<i16> {
        self.rssi
    }

    fn sleep(&mut self) {
        self.asleep = true;
    }

    fn wake(&mut self) {
        self.asleep = false;
    }

    fn set_transmit_enable(&mut self, enabled: bool) {
        self.tx_enabled = enabled;
    }
}
