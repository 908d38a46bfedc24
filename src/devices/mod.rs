//! Device adapters: Yokogawa recorders and generic Modbus devices.

pub mod dx1000;
pub mod gx20;
pub mod modbus_device;
pub mod recorder;

pub use dx1000::DxRecorder;
pub use gx20::Gx20Recorder;
pub use modbus_device::ModbusDevice;

use tracing::{error, warn};

use crate::codec::DataTable;
use crate::db::{Database, RecorderInfo};
use crate::devices::recorder::{PointMeta, UNUSED};
use crate::error::{DiodeError, Result};

/// Split a vendor config line into its uppercased prefix token, the
/// remainder after the first comma, and the comma-split fields of that
/// remainder. Lines without a comma carry no configuration data.
pub(crate) fn split_config_line(line: &str) -> Option<(String, String, Vec<String>)> {
    let upper = line.to_uppercase();
    let (head, rest) = upper.split_once(',')?;
    let fields = rest.split(',').map(str::to_string).collect();
    Some((head.trim().to_string(), rest.to_string(), fields))
}

/// Trim a field and drop the single quotes Yokogawa dumps wrap strings in.
pub(crate) fn strip_quotes(field: &str) -> String {
    field.trim().replace('\'', "")
}

pub(crate) fn parse_u32(field: &str) -> Result<u32> {
    field
        .trim()
        .parse::<u32>()
        .map_err(|e| DiodeError::config(format!("invalid integer field '{}': {e}", field.trim())))
}

/// A Yokogawa recorder of any supported model.
///
/// The models share one capability set (parse, poll, database update),
/// so a tagged variant replaces the original's inheritance tree. DX200
/// and DX1000 share an implementation and differ only in label.
pub enum Recorder {
    Dx(DxRecorder),
    Gx20(Gx20Recorder),
}

impl Recorder {
    pub async fn poll(&mut self) -> Option<DataTable> {
        match self {
            Recorder::Dx(r) => r.poll().await,
            Recorder::Gx20(r) => r.poll().await,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Recorder::Dx(r) => r.model(),
            Recorder::Gx20(r) => r.model(),
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Recorder::Dx(r) => r.priority(),
            Recorder::Gx20(r) => r.priority(),
        }
    }

    pub fn recorder_id(&self) -> u32 {
        match self {
            Recorder::Dx(r) => r.recorder_id(),
            Recorder::Gx20(r) => r.recorder_id(),
        }
    }

    pub fn set_recorder_id(&mut self, id: u32) {
        match self {
            Recorder::Dx(r) => r.set_recorder_id(id),
            Recorder::Gx20(r) => r.set_recorder_id(id),
        }
    }

    pub async fn update_database(&mut self, db: &mut Database, table: &DataTable) {
        match self {
            Recorder::Dx(r) => r.update_database(db, table).await,
            Recorder::Gx20(r) => r.update_database(db, table).await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Recorder::Dx(r) => r.close().await,
            Recorder::Gx20(r) => r.close().await,
        }
    }
}

/// Build a recorder from one manifest line:
/// `Model,configPath,ip,unitId,priority`. Model matching is
/// case-insensitive with an optional `Yokogawa` prefix. Every failure
/// (unknown model, bad field, unreadable config) logs SEVERE and skips
/// the device; startup continues without it.
pub fn build_recorder(line: &str) -> Option<Recorder> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        error!("Recorder line has too few fields: {line}");
        return None;
    }
    let model = fields[0].to_uppercase();
    let config_path = fields[1];
    let ip = fields[2];

    if ip.parse::<std::net::IpAddr>().is_err() {
        error!("IP Address {ip} appears invalid.");
        return None;
    }
    let unit_id = match fields[3].parse::<u8>() {
        Ok(id) => id,
        Err(e) => {
            error!("Unit ID for recorder at {ip} is invalid: {e}");
            return None;
        }
    };
    let priority = normalize_priority(fields[4], &model, ip);

    let lines = match crate::config::read_lines_latin1(config_path) {
        Ok(lines) => lines,
        Err(e) => {
            error!("Could not load the configuration file for the recorder: {e}");
            return None;
        }
    };

    let built = match model.as_str() {
        "YOKOGAWAGX20" | "GX20" => {
            Gx20Recorder::new("YokogawaGX20", config_path, ip, unit_id, priority, &lines)
                .map(Recorder::Gx20)
        }
        "YOKOGAWADX200" | "DX200" => {
            DxRecorder::new("YokogawaDX200", config_path, ip, unit_id, priority, &lines)
                .map(Recorder::Dx)
        }
        "YOKOGAWADX1000" | "DX1000" => {
            DxRecorder::new("YokogawaDX1000", config_path, ip, unit_id, priority, &lines)
                .map(Recorder::Dx)
        }
        _ => {
            error!("Unknown recorder model in manifest: {}", fields[0]);
            return None;
        }
    };

    match built {
        Ok(recorder) => Some(recorder),
        Err(e) => {
            error!("Could not parse configuration for {model} at {ip}: {e}");
            None
        }
    }
}

/// Priorities outside 1..3 fall back to the lowest lane.
fn normalize_priority(field: &str, model: &str, ip: &str) -> u8 {
    match field.parse::<u8>() {
        Ok(p) if (1..=3).contains(&p) => p,
        _ => {
            warn!(
                "Priority level for {model} at IP address {ip} is not between 1 and 3. Setting priority level to 3."
            );
            3
        }
    }
}

/// Walk a recorder's used tags against a received record, refreshing the
/// current-value row for each and, on historical cycles, appending to
/// the per-tag history tables. Scaling indexes are unfiltered; record
/// points are the filtered sequence.
pub(crate) async fn write_recorder_points(
    db: &mut Database,
    meta: &PointMeta,
    table: &DataTable,
    historical: bool,
    info: &RecorderInfo,
) {
    let mut point_index = 0;
    for meta_index in 0..meta.len() {
        if meta.units[meta_index] == UNUSED {
            continue;
        }
        let Some(point) = table.points.get(point_index) else {
            error!(
                "Record from {} holds fewer points than its tag metadata",
                info.model
            );
            break;
        };
        if historical {
            db.add_tag_record(
                table.time,
                point,
                &meta.tags[meta_index],
                info,
                &meta.units[meta_index],
                &meta.alarm_types[meta_index],
            )
            .await;
        } else {
            db.update_current_value(&meta.tags[meta_index], point, table.time)
                .await;
        }
        point_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_lines_split_and_uppercase() {
        let (head, rest, fields) = split_config_line("SR001,volt,2v,0,100").unwrap();
        assert_eq!(head, "SR001");
        assert_eq!(rest, "VOLT,2V,0,100");
        assert_eq!(fields, vec!["VOLT", "2V", "0", "100"]);

        assert!(split_config_line("no comma here").is_none());
    }

    #[test]
    fn quotes_are_stripped() {
        assert_eq!(strip_quotes(" 'T_BOILER_1' "), "T_BOILER_1");
        assert_eq!(strip_quotes("PLAIN"), "PLAIN");
        assert_eq!(strip_quotes("''"), "");
    }

    #[test]
    fn priority_normalization() {
        assert_eq!(normalize_priority("2", "M", "ip"), 2);
        assert_eq!(normalize_priority("0", "M", "ip"), 3);
        assert_eq!(normalize_priority("9", "M", "ip"), 3);
        assert_eq!(normalize_priority("x", "M", "ip"), 3);
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert!(build_recorder("FX3000,cfg.pdl,10.0.0.1,1,1").is_none());
    }

    #[test]
    fn invalid_ip_is_rejected() {
        assert!(build_recorder("DX1000,cfg.pdl,300.0.0.1,1,1").is_none());
    }
}
