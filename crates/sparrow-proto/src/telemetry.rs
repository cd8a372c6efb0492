use serde::{Deserialize, Serialize};

use crate::{ProtocolError, MAX_PAYLOAD_SIZE};

/// State-of-health snapshot carried in the Handshake1 payload and in the
/// periodic beacon. Sensor fields are optional because each collaborator
/// may fail independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub ts_unix_ms: i64,
    pub callsign: String,
    pub power_mode: String,
    pub boot_count: u32,
    pub battery_voltage: Option<f32>,
    pub system_voltage: Option<f32>,
    pub current_draw_ma: Option<f32>,
    pub battery_temp_c: Option<f32>,
    pub cpu_temp_c: Option<f32>,
    pub last_rssi: Option<i16>,
    pub link_quality: Option<u8>,
}

impl TelemetryFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        // serde_json over this struct cannot fail; the bound check can.
        let raw = serde_json::to_vec(self).unwrap_or_default();
        if raw.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPayload { len: raw.len() });
        }
        Ok(raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Option<TelemetryFrame> {
        serde_json::from_slice(raw).ok()
    }

    /// Human-readable beacon line, ham-radio style: callsign first and last.
    pub fn beacon_text(&self) -> String {
        let vb = self
            .battery_voltage
            .map(|v| format!("{:.2}V", v))
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "{cs} hello from sparrow, mode={mode} vbatt={vb} boot={boot} {cs}",
            cs = self.callsign,
            mode = self.power_mode,
            vb = vb,
            boot = self.boot_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> TelemetryFrame {
        TelemetryFrame {
            ts_unix_ms: 1_700_000_000_000,
            callsign: "KN6NAQ".into(),
            power_mode: "normal".into(),
            boot_count: 12,
            battery_voltage: Some(7.12),
            system_voltage: Some(7.30),
            current_draw_ma: Some(210.0),
            battery_temp_c: Some(18.5),
            cpu_temp_c: Some(31.0),
            last_rssi: Some(-92),
            link_quality: Some(80),
        }
    }

    #[test]
    fn telemetry_roundtrip_and_bounds() {
        let f = frame();
        let raw = f.to_bytes().expect("within payload budget");
        assert!(raw.len() <= MAX_PAYLOAD_SIZE);
        assert_eq!(TelemetryFrame::from_bytes(&raw), Some(f));
    }

    #[test]
    fn beacon_text_reports_unknown_voltage() {
        let mut f = frame();
        f.battery_voltage = None;
        let line = f.beacon_text();
        assert!(line.starts_with("KN6NAQ"));
        assert!(line.contains("vbatt=unknown"));
    }
}
