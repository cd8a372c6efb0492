use std::collections::BTreeSet;

use tracing::{info, warn};

use sparrow_proto::ProtocolError;

use crate::storage::Storage;

/// Keys a ground-proposed camera settings object must carry, no more
/// and no fewer. A partial update is indistinguishable from a corrupted
/// one, so the whole object is accepted or rejected atomically.
pub const CAMERA_SETTINGS_KEYS: [&str; 7] = [
    "exposure",
    "white_balance",
    "night_mode",
    "height",
    "width",
    "quality",
    "effect",
];

/// Validate and persist a config update carried in Handshake2. The
/// stored settings are only replaced when the proposed key set matches
/// the schema exactly.
pub fn apply_settings_update(
    storage: &mut dyn Storage,
    settings_path: &str,
    proposed: &[u8],
) -> Result<(), ProtocolError> {
    let expected: BTreeSet<&str> = CAMERA_SETTINGS_KEYS.iter().copied().collect();

    let parsed: serde_json::Value = match serde_json::from_slice(proposed) {
        Ok(v) => v,
        Err(_) => {
            return Err(ProtocolError::SchemaMismatch {
                expected: keys_to_string(&expected),
                got: "<not valid json>".to_string(),
            })
        }
    };
    let Some(obj) = parsed.as_object() else {
        return Err(ProtocolError::SchemaMismatch {
            expected: keys_to_string(&expected),
            got: "<not a json object>".to_string(),
        });
    };

    let got: BTreeSet<&str> = obj.keys().map(String::as_str).collect();
    if got != expected {
        return Err(ProtocolError::SchemaMismatch {
            expected: keys_to_string(&expected),
            got: keys_to_string(&got),
        });
    }

    if let Err(e) = storage.write(settings_path, proposed) {
        // Reported but non-fatal: the session continues with the old
        // settings still in effect.
        warn!("settings: failed to persist update: {}", e);
        return Ok(());
    }
    info!("settings: camera settings updated from ground");
    Ok(())
}

fn keys_to_string(keys: &BTreeSet<&str>) -> String {
    keys.iter().copied().collect::<Vec<_>>().join(",")
}
