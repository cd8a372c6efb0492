pub mod testing;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use sparrow_proto::{Packet, ProtocolError};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("radio receive timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt frame: {0}")]
    CorruptFrame(ProtocolError),

    #[error("radio fault: {0}")]
    Radio(String),
}

/// Seam to the radio transceiver. The chip itself (LoRa modulation,
/// SPI plumbing, interrupt handling) lives behind this trait; flight
/// code only ever sees framed bytes with mandatory receive timeouts.
pub trait Radio {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Blocks at most `timeout`. `Ok(None)` means nothing arrived, which
    /// is the common case on a quiet pass and is not an error.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, LinkError>;

    fn last_rssi(&self) -> Option<i16>;

    /// Park the transceiver in its low-power state.
    fn sleep(&mut self);
    fn wake(&mut self);

    /// Gate the PA enable line. Transmit attempts while disabled fail.
    fn set_transmit_enable(&mut self, enabled: bool);
}

#[derive(Debug, Clone)]
pub struct LinkHealth {
    pub last_rssi: Option<i16>,
    pub quality: u8, // 0-100
    pub consecutive_failures: u32,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self {
            last_rssi: None,
            quality: 100,
            consecutive_failures: 0,
        }
    }
}

/// Frames `Packet`s over a `Radio` and keeps a running health score.
/// The radio is singly owned; every component that talks to the ground
/// goes through this one value, so access serializes by construction.
pub struct PacketLink<R: Radio> {
    radio: R,
    health: LinkHealth,
}

impl<R: Radio> PacketLink<R> {
    pub fn new(radio: R) -> Self {
        Self { radio, health: LinkHealth::default() }
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn send_packet(&mut self, packet: &Packet) -> Result<(), LinkError> {
        let wire = packet.encode().map_err(LinkError::CorruptFrame)?;
        match self.radio.send(&wire) {
            Ok(()) => {
                self.on_success();
                debug!("link: sent {:?} ({} bytes)", packet.kind(), wire.len());
                Ok(())
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Receive and decode one packet. Garbage on the air decodes to
    /// `Packet::Error` rather than failing, per the protocol contract;
    /// only structurally truncated known-kind frames surface as corrupt.
    pub fn receive_packet(&mut self, timeout: Duration) -> Result<Option<Packet>, LinkError> {
        let Some(frame) = self.receive_raw(timeout)? else {
            return Ok(None);
        };
        match Packet::decode(&frame) {
            Ok(p) => Ok(Some(p)),
            Err(e) => {
                warn!("link: corrupt frame ({}): {}", e, hex::encode(&frame));
                Err(LinkError::CorruptFrame(e))
            }
        }
    }

    /// Raw frame passthrough, used for authenticated command frames that
    /// carry their own link header instead of a packet kind byte.
    pub fn receive_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        match self.radio.receive(timeout) {
            Ok(Some(frame)) => {
                self.on_success();
                self.health.last_rssi = self.radio.last_rssi();
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    pub fn send_raw(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        match self.radio.send(frame) {
            Ok(()) => {
                self.on_success();
                Ok(())
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn on_success(&mut self) {
        self.health.consecutive_failures = 0;
        self.health.quality = (self.health.quality + 10).min(100);
    }

    fn on_failure(&mut self) {
        self.health.consecutive_failures += 1;
        self.health.quality = self.health.quality.saturating_sub(20);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRadio;
    use sparrow_proto::PacketKind;

    #[test]
    fn packet_roundtrip_through_link() {
        let mut radio = ScriptedRadio::new();
        radio.push_inbound(Packet::Ack { seq: 7 }.encode().unwrap());
        let mut link = PacketLink::new(radio);

        link.send_packet(&Packet::Handshake3 { artifact_count: 2 }).unwrap();
        let got = link.receive_packet(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(got, Packet::Ack { seq: 7 });

        let sent = link.radio_mut().outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(sparrow_proto::categorize(&sent[0]), PacketKind::Handshake3);
    }

    #[test]
    fn health_degrades_on_failure_and_recovers() {
        let mut radio = ScriptedRadio::new();
        radio.fail_next_sends(2);
        let mut link = PacketLink::new(radio);

        let p = Packet::Ack { seq: 0 };
        assert!(link.send_packet(&p).is_err());
        assert!(link.send_packet(&p).is_err());
        assert_eq!(link.health().consecutive_failures, 2);
        assert_eq!(link.health().quality, 60);

        link.send_packet(&p).unwrap();
        assert_eq!(link.health().consecutive_failures, 0);
        assert_eq!(link.health().quality, 70);
    }

    #[test]
    fn quiet_receive_is_not_an_error() {
        let mut link = PacketLink::new(ScriptedRadio::new());
        let got = link.receive_packet(Duration::from_millis(5)).unwrap();
        assert!(got.is_none());
    }
}
