//! State and helpers shared by the Yokogawa recorder adapters.
//!
//! A recorder's configuration file yields four parallel metadata
//! sequences (tags, units, decimal shifts, alarm types) covering
//! `n_data + n_math` points, plus the fixed register layout of its
//! model. Raw register values are divided by `10^decimal` to recover
//! engineering values, and per-point alarm words are decoded against
//! model-specific bit masks. Points whose units are `UNUSED` are
//! dropped from the transmitted vector, but scaling always indexes the
//! unfiltered position.

use crate::codec::DataPoint;

/// Marker for skipped points and inactive alarm slots.
pub const UNUSED: &str = "UNUSED";

/// Tag placeholder for unnamed channels.
pub const NO_TAG: &str = "NO TAG/UNUSED";

/// DX1000/DX200 alarm bit masks for slots 1..4.
pub const DX_ALARM_MASKS: [u16; 4] = [0x0F00, 0xF000, 0x000F, 0x00F0];

/// GX20 alarm bit masks for slots 1..4.
pub const GX_ALARM_MASKS: [u16; 4] = [0x0001, 0x0002, 0x0004, 0x0008];

/// Fixed register layout of a recorder model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderLayout {
    pub port: u16,
    pub start_data: u16,
    pub n_data: u16,
    /// Registers per measurement point (1 = 16-bit, 2 = 32-bit)
    pub data_words: u16,
    pub start_alarms: u16,
    pub start_math: u16,
    pub n_math: u16,
    /// Registers per math point
    pub math_words: u16,
    pub start_math_alarms: u16,
}

/// Parallel per-point metadata in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointMeta {
    pub tags: Vec<String>,
    pub units: Vec<String>,
    pub decimals: Vec<u32>,
    pub alarm_types: Vec<[String; 4]>,
}

impl PointMeta {
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// True when all four sequences have the same length.
    pub fn is_consistent(&self) -> bool {
        self.tags.len() == self.units.len()
            && self.tags.len() == self.decimals.len()
            && self.tags.len() == self.alarm_types.len()
    }

    /// Number of points that actually go on the wire.
    pub fn used_count(&self) -> usize {
        self.units.iter().filter(|u| *u != UNUSED).count()
    }

    /// Append the metadata of `other`, preserving order.
    pub fn extend_from(&mut self, other: &PointMeta) {
        self.tags.extend(other.tags.iter().cloned());
        self.units.extend(other.units.iter().cloned());
        self.decimals.extend(other.decimals.iter().cloned());
        self.alarm_types.extend(other.alarm_types.iter().cloned());
    }
}

/// Divide a raw register value by `10^decimals`.
pub fn scale(raw: f64, decimals: u32) -> f64 {
    raw / 10f64.powi(decimals as i32)
}

/// Decode one 16-bit alarm word into four 0/1 slot states.
pub fn decode_alarms(word: i16, masks: [u16; 4]) -> [i32; 4] {
    let bits = word as u16;
    let mut status = [0i32; 4];
    for (slot, mask) in status.iter_mut().zip(masks) {
        if bits & mask != 0 {
            *slot = 1;
        }
    }
    status
}

/// Accumulates the four alarm slots of one channel; configuration files
/// emit one line per slot and the vector commits when slot 4 arrives.
#[derive(Debug, Default)]
pub struct AlarmSlots {
    slots: [Option<String>; 4],
}

impl AlarmSlots {
    /// Record `value` for 1-based `slot`; returns the completed vector
    /// when slot 4 lands. Slots never seen default to `UNUSED`.
    pub fn set(&mut self, slot: usize, value: String) -> Option<[String; 4]> {
        if !(1..=4).contains(&slot) {
            return None;
        }
        self.slots[slot - 1] = Some(value);
        if slot == 4 {
            let done = std::mem::take(&mut self.slots);
            Some(done.map(|s| s.unwrap_or_else(|| UNUSED.to_string())))
        } else {
            None
        }
    }
}

/// Assemble scaled, alarm-annotated points from the raw register blocks
/// of one poll cycle.
///
/// `data` and `math` are expected to match the layout counts (callers
/// abandon the poll otherwise); `alarm_words` is the measurement alarm
/// block concatenated with the math alarm block and may be shorter than
/// the point count when an alarm read failed, in which case the
/// uncovered points carry no alarm status.
pub fn assemble_points(
    meta: &PointMeta,
    data: &[i16],
    math: &[i32],
    alarm_words: &[i16],
    masks: [u16; 4],
) -> Vec<DataPoint> {
    let total = data.len() + math.len();
    let mut points = Vec::with_capacity(total);
    for i in 0..total {
        let decimals = meta.decimals.get(i).copied().unwrap_or(0);
        let raw = if i < data.len() {
            data[i] as f64
        } else {
            math[i - data.len()] as f64
        };
        let mut point = DataPoint::new(scale(raw, decimals));
        if let Some(word) = alarm_words.get(i) {
            point.alarms = Some(decode_alarms(*word, masks));
        }
        points.push(point);
    }
    points
}

/// Drop the points whose units are `UNUSED`.
pub fn filter_used(meta: &PointMeta, points: Vec<DataPoint>) -> Vec<DataPoint> {
    points
        .into_iter()
        .zip(meta.units.iter())
        .filter(|(_, units)| *units != UNUSED)
        .map(|(point, _)| point)
        .collect()
}

/// Per-device cadence counter for the historical/current database split.
///
/// The counter starts at 9, so the first record a device delivers lands
/// in the historical table, then every tenth record after it.
#[derive(Debug)]
pub struct CycleCounter {
    count: u32,
}

impl CycleCounter {
    pub fn new() -> Self {
        Self { count: 9 }
    }

    /// Advance one cycle; true means "historical insert this cycle".
    pub fn step(&mut self) -> bool {
        self.count += 1;
        if self.count == 10 {
            self.count = 0;
            true
        } else {
            false
        }
    }
}

impl Default for CycleCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_divides_by_powers_of_ten() {
        assert_eq!(scale(12345.0, 2), 123.45);
        assert_eq!(scale(5678.0, 1), 567.8);
        assert_eq!(scale(240.0, 1), 24.0);
        assert_eq!(scale(42.0, 0), 42.0);
    }

    #[test]
    fn dx_alarm_decoding_uses_nibble_masks() {
        assert_eq!(decode_alarms(0x0100, DX_ALARM_MASKS), [1, 0, 0, 0]);
        assert_eq!(decode_alarms(0x1000u16 as i16, DX_ALARM_MASKS), [0, 1, 0, 0]);
        assert_eq!(decode_alarms(0x0001, DX_ALARM_MASKS), [0, 0, 1, 0]);
        assert_eq!(decode_alarms(0x0010, DX_ALARM_MASKS), [0, 0, 0, 1]);
        assert_eq!(decode_alarms(0, DX_ALARM_MASKS), [0, 0, 0, 0]);
    }

    #[test]
    fn gx_alarm_decoding_uses_low_bits() {
        assert_eq!(decode_alarms(0x0005, GX_ALARM_MASKS), [1, 0, 1, 0]);
        // Slot 4 decodes like the others on a nonzero mask.
        assert_eq!(decode_alarms(0x0008, GX_ALARM_MASKS), [0, 0, 0, 1]);
    }

    #[test]
    fn alarm_slots_commit_on_slot_four() {
        let mut slots = AlarmSlots::default();
        assert!(slots.set(1, "HIGH".into()).is_none());
        assert!(slots.set(2, UNUSED.into()).is_none());
        assert!(slots.set(3, "LOW".into()).is_none());
        let done = slots.set(4, "RATE".into()).unwrap();
        assert_eq!(done, ["HIGH", "UNUSED", "LOW", "RATE"].map(String::from));

        // The accumulator resets for the next channel; missing slots
        // default to UNUSED.
        let done = slots.set(4, "HH".into()).unwrap();
        assert_eq!(done, ["UNUSED", "UNUSED", "UNUSED", "HH"].map(String::from));
    }

    #[test]
    fn assemble_filters_and_scales_on_unfiltered_index() {
        let meta = PointMeta {
            tags: vec!["A".into(), "B".into()],
            units: vec![UNUSED.into(), "F".into()],
            decimals: vec![0, 1],
            alarm_types: vec![
                [UNUSED, UNUSED, UNUSED, UNUSED].map(String::from),
                [UNUSED, UNUSED, UNUSED, UNUSED].map(String::from),
            ],
        };
        let points = assemble_points(&meta, &[1234, 5678], &[], &[0, 0x0100], DX_ALARM_MASKS);
        assert_eq!(points.len(), 2);
        let sent = filter_used(&meta, points);
        assert_eq!(sent.len(), meta.used_count());
        assert_eq!(sent[0].value, 567.8);
        assert_eq!(sent[0].alarms, Some([1, 0, 0, 0]));
    }

    #[test]
    fn missing_alarm_block_leaves_alarms_unset() {
        let meta = PointMeta {
            tags: vec!["A".into()],
            units: vec!["V".into()],
            decimals: vec![2],
            alarm_types: vec![[UNUSED, UNUSED, UNUSED, UNUSED].map(String::from)],
        };
        let points = assemble_points(&meta, &[100], &[], &[], DX_ALARM_MASKS);
        assert_eq!(points[0].alarms, None);
        assert_eq!(points[0].value, 1.0);
    }

    #[test]
    fn cadence_counter_fires_on_arrivals_1_11_21() {
        let mut cycle = CycleCounter::new();
        let mut calls = Vec::new();
        for call in 1..=25 {
            if cycle.step() {
                calls.push(call);
            }
        }
        assert_eq!(calls, vec![1, 11, 21]);
    }
}
