//! End-to-end checks that do not need live devices: manifest loading on
//! both sides of the diode, metadata determinism, and records crossing
//! the wire codec intact and in order.

use std::io::Write;

use chrono::NaiveDate;
use diodesrv::codec::frame;
use diodesrv::codec::{DataPoint, DataTable, DeviceType};
use diodesrv::config::load_manifest;
use diodesrv::devices::dx1000;
use diodesrv::runtime::lanes::lanes;
use diodesrv::Role;

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path.to_string_lossy().into_owned()
}

fn dx_config() -> String {
    let mut cfg = String::new();
    for (channel, range, tag) in [
        (1, "VOLT,2V,-20000,20000", "''"),
        (2, "TC,K,0,1000,F,0,NORMAL", "'T_BOILER_1'"),
        (3, "DI,LEVEL,0,1", "'PUMP_RUN'"),
    ] {
        cfg.push_str(&format!("SR{channel:03},{range}\n"));
        for slot in 1..=4 {
            cfg.push_str(&format!("SA{channel:03},{slot},OFF,H\n"));
        }
        cfg.push_str(&format!("ST{channel:03},{tag}\n"));
    }
    cfg
}

fn modbus_config() -> &'static str {
    "Device Name: Boiler PLC\n\
     IP Address: 10.0.0.5\n\
     Slave number: 1\n\
     Port: 502\n\
     Priority: 2\n\
     Registers: 40001, 40002\n\
     Data Type: short holding\n\
     temp1, C, 1, 40001\n"
}

#[test]
fn both_sides_load_the_same_manifest_identically() {
    let dir = tempfile::tempdir().unwrap();
    let dx = write_file(&dir, "dx.pdl", &dx_config());
    let modbus = write_file(&dir, "modbus.txt", modbus_config());
    let manifest_text = format!(
        "** shared manifest **\n\
         Function: Transmit\n\
         Modbus, {modbus}\n\
         DX1000,{dx},10.0.0.11,1,1\n"
    );
    let manifest_file = write_file(&dir, "config.txt", &manifest_text);

    let transmit = load_manifest(&manifest_file).unwrap();
    let receive = load_manifest(&manifest_file).unwrap();

    assert_eq!(transmit.role, Some(Role::Transmit));
    assert_eq!(transmit.recorders.len(), receive.recorders.len());
    assert_eq!(transmit.modbus_devices.len(), receive.modbus_devices.len());
    assert_eq!(
        transmit.recorders[0].recorder_id(),
        receive.recorders[0].recorder_id()
    );
    assert_eq!(
        transmit.modbus_devices[0].tags(),
        receive.modbus_devices[0].tags()
    );
}

#[test]
fn recorder_metadata_is_deterministic_across_parses() {
    // The wire format carries no metadata, so both sides must derive
    // elementwise-identical sequences from the same config bytes.
    let cfg: Vec<String> = dx_config().lines().map(str::to_string).collect();
    let (layout_a, meta_a) = dx1000::parse_config(&cfg).unwrap();
    let (layout_b, meta_b) = dx1000::parse_config(&cfg).unwrap();

    assert_eq!(layout_a, layout_b);
    assert_eq!(meta_a, meta_b);
    assert_eq!(meta_a.tags, meta_b.tags);
    assert_eq!(meta_a.units, meta_b.units);
    assert_eq!(meta_a.decimals, meta_b.decimals);
    assert_eq!(meta_a.alarm_types, meta_b.alarm_types);

    // Invariant: one metadata entry per data/math point, and the
    // transmitted width is the non-UNUSED count.
    assert_eq!(meta_a.len(), (layout_a.n_data + layout_a.n_math) as usize);
    assert_eq!(meta_a.used_count(), 2);
}

#[test]
fn records_cross_the_wire_codec_unchanged() {
    let time = NaiveDate::from_ymd_opt(2026, 8, 2)
        .unwrap()
        .and_hms_milli_opt(7, 15, 0, 500)
        .unwrap();

    let mut recorder_record = DataTable::new(time, DeviceType::Recorder, 0);
    recorder_record
        .points
        .push(DataPoint::with_alarms(567.8, [1, 0, 0, 0]));
    recorder_record
        .points
        .push(DataPoint::with_alarms(1.0, [0, 0, 0, 0]));

    let mut modbus_record = DataTable::new(time, DeviceType::ModbusDevice, 0);
    modbus_record.points.push(DataPoint::new(24.0));

    for record in [&recorder_record, &modbus_record] {
        let bytes = frame::encode(record);
        let mut prefix = [0u8; frame::LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&bytes[..frame::LENGTH_PREFIX_LEN]);
        let len = frame::payload_len(prefix).unwrap();
        let decoded = frame::decode_payload(&bytes[frame::LENGTH_PREFIX_LEN..]).unwrap();
        assert_eq!(len, bytes.len() - frame::LENGTH_PREFIX_LEN);
        assert_eq!(&decoded, record);
    }
}

#[tokio::test]
async fn lane_traffic_stays_ordered_per_priority() {
    let time = NaiveDate::from_ymd_opt(2026, 8, 2)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let (senders, mut receivers) = lanes();

    // Interleave records across two lanes; each lane must replay its
    // own sequence in order.
    for i in 0..5u32 {
        senders.send(1, DataTable::new(time, DeviceType::Recorder, i));
        senders.send(3, DataTable::new(time, DeviceType::ModbusDevice, 100 + i));
    }

    for i in 0..5u32 {
        assert_eq!(receivers.lanes[0].try_recv().unwrap().device_id, i);
        assert_eq!(receivers.lanes[2].try_recv().unwrap().device_id, 100 + i);
    }
    assert!(receivers.lanes[1].try_recv().is_err());
}
