//! Main manifest loading.
//!
//! Both sides of the diode load the same `config.txt`; device indices
//! assigned here must line up exactly, because a record crossing the
//! link carries only `deviceType` + `deviceID` and the receive side
//! resolves metadata by position. Manifest order is therefore
//! significant, and a line that fails to parse is skipped on both sides
//! identically (it never produces a device).

use std::path::Path;

use tracing::error;

use crate::devices::modbus_device::{parse_devices, ModbusDevice};
use crate::devices::{build_recorder, Recorder};
use crate::error::{DiodeError, Result};

/// Which half of the diode this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Transmit,
    Receive,
}

/// Everything the manifest defines: the process role and the device
/// lists in manifest order.
pub struct Manifest {
    pub role: Option<Role>,
    pub recorders: Vec<Recorder>,
    pub modbus_devices: Vec<ModbusDevice>,
}

/// Read a file as ISO-8859-1 text, split into lines. Vendor dumps and
/// the manifest use this encoding; every byte maps to the same code
/// point, so the conversion is total.
pub fn read_lines_latin1(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| DiodeError::config(format!("reading {}: {e}", path.display())))?;
    let text: String = bytes.iter().map(|&b| b as char).collect();
    Ok(text.lines().map(str::to_string).collect())
}

/// Load the main manifest. Recorders and Modbus devices get their IDs
/// from independent counters in manifest order.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest> {
    let lines = read_lines_latin1(path)?;
    let mut manifest = Manifest {
        role: None,
        recorders: Vec::new(),
        modbus_devices: Vec::new(),
    };
    let mut recorder_id: u32 = 0;
    let mut device_id: u32 = 0;

    for raw in &lines {
        let line = raw.trim();
        if line.starts_with("**") || line.is_empty() {
            continue;
        }

        if let Some(value) = line.strip_prefix("Function:") {
            manifest.role = parse_role(value.trim());
            continue;
        }

        if line.starts_with("Modbus") {
            let Some((_, file)) = line.split_once(',') else {
                error!("Modbus manifest line is missing a file path: {line}");
                continue;
            };
            match read_lines_latin1(file.trim()) {
                Ok(config_lines) => {
                    for mut device in parse_devices(&config_lines) {
                        device.set_device_id(device_id);
                        device_id += 1;
                        manifest.modbus_devices.push(device);
                    }
                }
                Err(e) => error!("Error reading Modbus devices config file: {e}"),
            }
            continue;
        }

        if let Some(mut recorder) = build_recorder(line) {
            recorder.set_recorder_id(recorder_id);
            recorder_id += 1;
            manifest.recorders.push(recorder);
        }
    }

    Ok(manifest)
}

fn parse_role(value: &str) -> Option<Role> {
    // The original deployment's manifests carried a misspelled
    // "Recieve"; both spellings are accepted.
    if value.eq_ignore_ascii_case("Transmit") {
        Some(Role::Transmit)
    } else if value.eq_ignore_ascii_case("Receive") || value.eq_ignore_ascii_case("Recieve") {
        Some(Role::Receive)
    } else {
        error!("Unknown function in manifest: {value}");
        None
    }
}
