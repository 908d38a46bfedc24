//! Length-delimited wire codec for [`DataTable`] records.
//!
//! The diode is one-way, so the receiver must be able to frame messages
//! with no application-layer handshake: every record is a 4-byte
//! big-endian payload length followed by a bytewise-stable encoding.
//! Both sides of the link compile this exact module.
//!
//! Payload layout:
//!
//! ```text
//! i64  BE  unix timestamp, milliseconds
//! u8       device type (0 = Recorder, 1 = Modbus Device)
//! u32  BE  device id
//! u32  BE  point count
//! per point:
//!   f64 BE value
//!   u8     alarm presence flag (0 | 1)
//!   [i32 BE; 4] alarm status, only when the flag is 1
//! ```

use chrono::DateTime;

use crate::codec::{DataPoint, DataTable, DeviceType};
use crate::error::{DiodeError, Result};

/// Size of the length prefix preceding every payload.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Upper bound accepted for a single payload. Generous compared to any
/// real poll cycle, but keeps a corrupted length prefix from asking the
/// receiver to buffer gigabytes.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Encode a record as a complete frame (length prefix + payload).
pub fn encode(table: &DataTable) -> Vec<u8> {
    let mut payload = Vec::with_capacity(17 + table.points.len() * 25);
    let millis = table.time.and_utc().timestamp_millis();
    payload.extend_from_slice(&millis.to_be_bytes());
    payload.push(table.device_type.wire_byte());
    payload.extend_from_slice(&table.device_id.to_be_bytes());
    payload.extend_from_slice(&(table.points.len() as u32).to_be_bytes());
    for point in &table.points {
        payload.extend_from_slice(&point.value.to_be_bytes());
        match point.alarms {
            Some(alarms) => {
                payload.push(1);
                for status in alarms {
                    payload.extend_from_slice(&status.to_be_bytes());
                }
            }
            None => payload.push(0),
        }
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Decode one payload (the bytes following the length prefix).
pub fn decode_payload(payload: &[u8]) -> Result<DataTable> {
    let mut cursor = Cursor::new(payload);

    let millis = cursor.read_i64()?;
    let time = DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| DiodeError::data(format!("timestamp out of range: {millis}")))?;
    let type_byte = cursor.read_u8()?;
    let device_type = DeviceType::from_wire_byte(type_byte)
        .ok_or_else(|| DiodeError::data(format!("unknown device type byte: {type_byte}")))?;
    let device_id = cursor.read_u32()?;
    let count = cursor.read_u32()? as usize;

    let mut points = Vec::with_capacity(count.min(65_536));
    for _ in 0..count {
        let value = f64::from_bits(cursor.read_u64()?);
        let alarms = match cursor.read_u8()? {
            0 => None,
            1 => {
                let mut status = [0i32; 4];
                for slot in &mut status {
                    *slot = cursor.read_i32()?;
                }
                Some(status)
            }
            other => {
                return Err(DiodeError::data(format!(
                    "invalid alarm presence flag: {other}"
                )))
            }
        };
        points.push(DataPoint { value, alarms });
    }

    if !cursor.is_empty() {
        return Err(DiodeError::data(format!(
            "{} trailing bytes after record",
            cursor.remaining()
        )));
    }

    Ok(DataTable {
        time,
        device_type,
        device_id,
        points,
    })
}

/// Validate a length prefix before committing to read the payload.
pub fn payload_len(prefix: [u8; LENGTH_PREFIX_LEN]) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 || len > MAX_PAYLOAD_LEN {
        return Err(DiodeError::data(format!("invalid frame length: {len}")));
    }
    Ok(len)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(DiodeError::data("truncated record payload"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_table() -> DataTable {
        let time = NaiveDate::from_ymd_opt(2024, 3, 11)
            .unwrap()
            .and_hms_milli_opt(14, 30, 5, 250)
            .unwrap();
        DataTable {
            time,
            device_type: DeviceType::Recorder,
            device_id: 2,
            points: vec![
                DataPoint::with_alarms(123.45, [1, 0, 0, 1]),
                DataPoint::new(-7.5),
            ],
        }
    }

    #[test]
    fn frame_round_trip() {
        let table = sample_table();
        let frame = encode(&table);

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&frame[..LENGTH_PREFIX_LEN]);
        let len = payload_len(prefix).unwrap();
        assert_eq!(len, frame.len() - LENGTH_PREFIX_LEN);

        let decoded = decode_payload(&frame[LENGTH_PREFIX_LEN..]).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn modbus_record_without_alarms_round_trips() {
        let time = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut table = DataTable::new(time, DeviceType::ModbusDevice, 0);
        table.points.push(DataPoint::new(24.0));

        let frame = encode(&table);
        let decoded = decode_payload(&frame[LENGTH_PREFIX_LEN..]).unwrap();
        assert_eq!(decoded.device_type, DeviceType::ModbusDevice);
        assert_eq!(decoded.points[0].alarms, None);
        assert_eq!(decoded.points[0].value, 24.0);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let frame = encode(&sample_table());
        let payload = &frame[LENGTH_PREFIX_LEN..frame.len() - 3];
        assert!(decode_payload(payload).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let frame = encode(&sample_table());
        let mut payload = frame[LENGTH_PREFIX_LEN..].to_vec();
        payload.extend_from_slice(&[0xAA, 0xBB]);
        assert!(decode_payload(&payload).is_err());
    }

    #[test]
    fn zero_and_oversized_lengths_are_rejected() {
        assert!(payload_len([0, 0, 0, 0]).is_err());
        assert!(payload_len(u32::MAX.to_be_bytes()).is_err());
    }

    #[test]
    fn unknown_device_type_is_rejected() {
        let frame = encode(&sample_table());
        let mut payload = frame[LENGTH_PREFIX_LEN..].to_vec();
        payload[8] = 9;
        assert!(decode_payload(&payload).is_err());
    }

    #[test]
    fn encoding_is_bytewise_deterministic() {
        let table = sample_table();
        assert_eq!(encode(&table), encode(&table));
    }
}
