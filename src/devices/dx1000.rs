//! Yokogawa DX1000 / DX200 recorder adapter.
//!
//! Both models share the same register layout and configuration grammar
//! (vendor manual section 6.3): one 16-bit input register per
//! measurement channel from address 0, alarm words from 1000, 32-bit
//! little-endian math channels from 2000 and math alarms from 3000. The
//! device clock is exposed as seven registers at 9000. Configuration
//! lines key on the `SR` (range), `SA` (alarm) and `ST` (tag) prefixes.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use tracing::error;

use crate::codec::{DataTable, DeviceType};
use crate::db::{Database, RecorderInfo};
use crate::devices::recorder::{
    assemble_points, filter_used, AlarmSlots, CycleCounter, PointMeta, RecorderLayout,
    DX_ALARM_MASKS, NO_TAG, UNUSED,
};
use crate::devices::{parse_u32, split_config_line, strip_quotes, write_recorder_points};
use crate::error::{DiodeError, Result};
use crate::protocols::modbus::{ModbusLink, WordOrder};

const MODBUS_PORT: u16 = 502;
const CLOCK_ADDR: u16 = 9000;
const CLOCK_REGS: u16 = 7;

/// DX-series recorder (DX1000 or DX200, distinguished only by label).
pub struct DxRecorder {
    model: String,
    config_file: String,
    ip: String,
    unit_id: u8,
    priority: u8,
    recorder_id: u32,
    layout: RecorderLayout,
    meta: PointMeta,
    link: ModbusLink,
    cycle: CycleCounter,
}

impl DxRecorder {
    pub fn new(
        model: impl Into<String>,
        config_file: impl Into<String>,
        ip: impl Into<String>,
        unit_id: u8,
        priority: u8,
        lines: &[String],
    ) -> Result<Self> {
        let model = model.into();
        let ip = ip.into();
        let (layout, meta) = parse_config(lines)?;
        let link = ModbusLink::new(model.clone(), &ip, layout.port, unit_id);
        Ok(Self {
            model,
            config_file: config_file.into(),
            ip,
            unit_id,
            priority,
            recorder_id: 0,
            layout,
            meta,
            link,
            cycle: CycleCounter::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn recorder_id(&self) -> u32 {
        self.recorder_id
    }

    pub fn set_recorder_id(&mut self, id: u32) {
        self.recorder_id = id;
    }

    pub fn meta(&self) -> &PointMeta {
        &self.meta
    }

    pub fn layout(&self) -> &RecorderLayout {
        &self.layout
    }

    fn info(&self) -> RecorderInfo {
        RecorderInfo {
            model: self.model.clone(),
            ip: self.ip.clone(),
            unit_id: self.unit_id,
            config_file: self.config_file.clone(),
        }
    }

    /// One poll cycle. Returns `None` when the device is disconnected,
    /// cooling down, or any register block came back short.
    pub async fn poll(&mut self) -> Option<DataTable> {
        self.link.connect().await;
        if !self.link.is_open() {
            return None;
        }

        let time = self.read_time().await;
        let data = self
            .link
            .read_i16_input(self.layout.start_data, self.layout.n_data)
            .await;
        let alarms = self
            .link
            .read_i16_input(self.layout.start_alarms, self.layout.n_data)
            .await;
        let math = self
            .link
            .read_i32_input(
                self.layout.start_math,
                self.layout.n_math,
                WordOrder::LittleEndian,
            )
            .await;
        let math_alarms = self
            .link
            .read_i16_input(self.layout.start_math_alarms, self.layout.n_math)
            .await;
        self.link.close().await;

        if data.len() != self.layout.n_data as usize || math.len() != self.layout.n_math as usize {
            error!(
                "Problem getting data from {} at IP Address: {}",
                self.model, self.ip
            );
            return None;
        }

        let mut alarm_words = alarms;
        alarm_words.extend_from_slice(&math_alarms);
        let points = assemble_points(&self.meta, &data, &math, &alarm_words, DX_ALARM_MASKS);

        let mut table = DataTable::new(time, DeviceType::Recorder, self.recorder_id);
        table.points = filter_used(&self.meta, points);
        Some(table)
    }

    /// Device clock: seven registers at 9000 holding year, month, day,
    /// hour, minute, second and millisecond. Falls back to the local
    /// wall clock on a short or out-of-range read.
    async fn read_time(&mut self) -> NaiveDateTime {
        let regs = self.link.read_i16_input(CLOCK_ADDR, CLOCK_REGS).await;
        clock_from_registers(&regs).unwrap_or_else(|| Utc::now().naive_utc())
    }

    pub async fn update_database(&mut self, db: &mut Database, table: &DataTable) {
        let historical = self.cycle.step();
        let info = self.info();
        write_recorder_points(db, &self.meta, table, historical, &info).await;
    }

    pub async fn close(&mut self) {
        self.link.close().await;
    }
}

fn clock_from_registers(regs: &[i16]) -> Option<NaiveDateTime> {
    if regs.len() != CLOCK_REGS as usize {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(regs[0] as i32, regs[1] as u32 & 0xFFFF, regs[2] as u32 & 0xFFFF)?;
    date.and_hms_milli_opt(
        regs[3].try_into().ok()?,
        regs[4].try_into().ok()?,
        regs[5].try_into().ok()?,
        regs[6].try_into().ok()?,
    )
}

/// Parse a DX-series configuration dump into layout and metadata.
pub fn parse_config(lines: &[String]) -> Result<(RecorderLayout, PointMeta)> {
    let mut meta = PointMeta::default();
    let mut n_data: u16 = 0;
    let mut alarm_slots = AlarmSlots::default();

    for line in lines {
        let Some((head, rest, fields)) = split_config_line(line) else {
            continue;
        };

        if head.starts_with("SR") {
            n_data += 1;
            let (units, decimals) = range_units(&rest, &fields)?;
            meta.units.push(units);
            meta.decimals.push(decimals);
        }

        if head.starts_with("SA") && fields.len() >= 2 {
            let slot = parse_u32(&fields[0])? as usize;
            let value = if fields[1].trim() == "ON" {
                fields.get(2).map(|f| f.trim().to_string()).unwrap_or_else(|| UNUSED.to_string())
            } else {
                UNUSED.to_string()
            };
            if let Some(done) = alarm_slots.set(slot, value) {
                meta.alarm_types.push(done);
            }
        }

        if head.starts_with("ST") {
            let tag = strip_quotes(&fields[0]);
            if tag.is_empty() {
                meta.tags.push(NO_TAG.to_string());
            } else {
                meta.tags.push(tag);
            }
        }
    }

    // Register addresses and sizes from the tech manual, section 6.3.
    let layout = RecorderLayout {
        port: MODBUS_PORT,
        start_data: 0,
        n_data,
        data_words: 1,
        start_alarms: 1000,
        start_math: 2000,
        n_math: 0,
        math_words: 2,
        start_math_alarms: 3000,
    };

    if !meta.is_consistent() || meta.len() != (layout.n_data + layout.n_math) as usize {
        return Err(DiodeError::config(format!(
            "inconsistent DX configuration: {} tags, {} units, {} decimals, {} alarm sets for {} points",
            meta.tags.len(),
            meta.units.len(),
            meta.decimals.len(),
            meta.alarm_types.len(),
            layout.n_data + layout.n_math
        )));
    }

    Ok((layout, meta))
}

/// Units and decimal shift for one `SR` range line, in source precedence
/// order. `rest` is the uppercased text after the line prefix, `fields`
/// its comma-split form.
fn range_units(rest: &str, fields: &[String]) -> Result<(String, u32)> {
    let last = |n: usize| -> String {
        fields
            .get(fields.len().wrapping_sub(n))
            .map(|f| f.trim().to_string())
            .unwrap_or_default()
    };

    if rest.contains("SKIP") || rest.contains("VOLT,2V,-20000,20000") {
        return Ok((UNUSED.to_string(), 0));
    }

    if rest.contains("DELTA") {
        if rest.contains("VOLT") {
            let decimals = if rest.contains("2V") {
                4
            } else if rest.contains("20MV") || rest.contains("6V") || rest.contains("20V") {
                3
            } else {
                2
            };
            return Ok(("NO UNITS".to_string(), decimals));
        }
        if rest.contains("RTD") || rest.contains("TC") {
            return Ok(("F".to_string(), 1));
        }
        if rest.contains("DI") {
            return Ok(("NO UNITS".to_string(), 0));
        }
        let tail = last(1);
        if tail.chars().next().is_some_and(|c| !c.is_ascii_digit()) {
            return Ok((tail, 2));
        }
        return Ok(("NO UNITS".to_string(), 2));
    }

    if rest.contains("SCALE") {
        if rest.contains("VOLT") || rest.contains("DI") {
            return Ok((last(1), parse_u32(&last(2))?));
        }
        if rest.contains("RTD") || rest.contains("TC") {
            return Ok(("F".to_string(), parse_u32(&last(2))?));
        }
        if rest.contains("1-5V") {
            return Ok((last(2), parse_u32(&last(3))?));
        }
        return Ok((last(1), 0));
    }

    if rest.contains("SQRT") {
        if rest.contains("ON") {
            return Ok((last(3), parse_u32(&last(4))?));
        }
        return Ok((last(2), parse_u32(&last(3))?));
    }

    if rest.contains("VOLT") {
        let decimals = if rest.contains("2V") {
            4
        } else if rest.contains("20MV") || rest.contains("6V") || rest.contains("20V") {
            3
        } else {
            2
        };
        return Ok(("V".to_string(), decimals));
    }

    if rest.contains("RTD") || rest.contains("TC") {
        return Ok(("F".to_string(), 1));
    }

    if rest.contains("DI") {
        return Ok(("NO UNITS".to_string(), 0));
    }

    // Unrecognized range text: keep the metadata sequences aligned and
    // mark the point skipped.
    Ok((UNUSED.to_string(), 0))
}
