//! Yokogawa GX20 recorder adapter.
//!
//! GX20 chassis take expansion modules, so the analog channels of one
//! recorder do not have to be contiguous: each run of consecutive
//! channel numbers becomes a [`Gx20Module`] that knows its own register
//! block. Modules read 32-bit little-endian values at
//! `channel + 8999` (the controller's register-file origin) with alarm
//! words 2500 registers above. Math channels are handled at the device
//! level (registers 5000/5500, manual section 4.5). The GX20 exposes no
//! stable clock register, so records are stamped with the local clock.

use chrono::Utc;
use tracing::error;

use crate::codec::{DataPoint, DataTable, DeviceType};
use crate::db::{Database, RecorderInfo};
use crate::devices::recorder::{
    assemble_points, filter_used, AlarmSlots, CycleCounter, PointMeta, RecorderLayout,
    GX_ALARM_MASKS, NO_TAG, UNUSED,
};
use crate::devices::{parse_u32, split_config_line, strip_quotes, write_recorder_points};
use crate::error::{DiodeError, Result};
use crate::protocols::modbus::{ModbusLink, WordOrder};

const MODBUS_PORT: u16 = 502;
/// Offset of the module register file in the controller address space.
const MODULE_REGISTER_BASE: u16 = 8999;
/// Module alarm words sit this far above the module data block.
const MODULE_ALARM_OFFSET: u16 = 2500;

/// One contiguous block of analog channels.
#[derive(Debug, PartialEq)]
pub struct Gx20Module {
    start_channel: u16,
    n_points: u16,
    meta: PointMeta,
}

impl Gx20Module {
    /// Collect the rows belonging to the block starting at
    /// `start_channel` out of the full configuration dump.
    pub fn parse(start_channel: u16, lines: &[String]) -> Result<Self> {
        let mut channels: Vec<u16> = vec![start_channel];
        let mut n_points: u16 = 0;
        let mut meta = PointMeta::default();
        let mut alarm_slots = AlarmSlots::default();

        for line in lines {
            let Some((head, rest, fields)) = split_config_line(line) else {
                continue;
            };

            if head.starts_with("SRANGEAI") {
                let channel = parse_u32(&fields[0])? as u16;
                let last = *channels.last().unwrap_or(&start_channel);
                if channel == last || channel == last + 1 {
                    channels.push(channel);
                    n_points += 1;
                    let (units, decimals) = range_units(&rest, &fields)?;
                    meta.units.push(units);
                    meta.decimals.push(decimals);
                }
            }

            if head.starts_with("SALARMIO") && fields.len() >= 3 {
                let channel = parse_u32(&fields[0])? as u16;
                if channels.contains(&channel) {
                    let slot = parse_u32(&fields[1])? as usize;
                    let value = if fields[2].trim() == "ON" {
                        fields
                            .get(3)
                            .map(|f| f.trim().to_string())
                            .unwrap_or_else(|| UNUSED.to_string())
                    } else {
                        UNUSED.to_string()
                    };
                    if let Some(done) = alarm_slots.set(slot, value) {
                        meta.alarm_types.push(done);
                    }
                }
            }

            if head.starts_with("STAGIO") && fields.len() >= 2 {
                let channel = parse_u32(&fields[0])? as u16;
                if channels.contains(&channel) {
                    if fields[1].trim() != "''" {
                        meta.tags
                            .push(strip_quotes(fields.last().map(String::as_str).unwrap_or("")));
                    } else {
                        meta.tags.push(NO_TAG.to_string());
                    }
                }
            }
        }

        if !meta.is_consistent() || meta.len() != n_points as usize {
            return Err(DiodeError::config(format!(
                "inconsistent GX20 module at channel {start_channel}: {} points, {} tags",
                n_points,
                meta.tags.len()
            )));
        }

        Ok(Self {
            start_channel,
            n_points,
            meta,
        })
    }

    pub fn start_channel(&self) -> u16 {
        self.start_channel
    }

    pub fn n_points(&self) -> u16 {
        self.n_points
    }

    pub fn meta(&self) -> &PointMeta {
        &self.meta
    }

    /// Read this module's block through the parent recorder's link.
    /// Returns the filtered points, or an empty vector when either read
    /// came back short.
    pub async fn poll(&self, link: &mut ModbusLink) -> Vec<DataPoint> {
        let data = link
            .read_i32_input(
                self.start_channel + MODULE_REGISTER_BASE,
                self.n_points,
                WordOrder::LittleEndian,
            )
            .await;
        let alarms = link
            .read_i16_input(
                self.start_channel + MODULE_ALARM_OFFSET + MODULE_REGISTER_BASE,
                self.n_points,
            )
            .await;

        if data.len() != self.n_points as usize || alarms.len() != self.n_points as usize {
            return Vec::new();
        }

        let points = assemble_points(&self.meta, &[], &data, &alarms, GX_ALARM_MASKS);
        filter_used(&self.meta, points)
    }
}

/// GX20 recorder with its channel modules.
pub struct Gx20Recorder {
    model: String,
    config_file: String,
    ip: String,
    unit_id: u8,
    priority: u8,
    recorder_id: u32,
    layout: RecorderLayout,
    /// Device-level metadata covers the math channels only; analog
    /// channels live in the modules.
    meta: PointMeta,
    modules: Vec<Gx20Module>,
    link: ModbusLink,
    cycle: CycleCounter,
}

impl Gx20Recorder {
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
        let (layout, meta, modules) = parse_config(lines)?;
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
            modules,
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

    pub fn modules(&self) -> &[Gx20Module] {
        &self.modules
    }

    pub fn layout(&self) -> &RecorderLayout {
        &self.layout
    }

    /// Module metadata in module order followed by device-level math
    /// metadata — the order points travel on the wire.
    pub fn merged_meta(&self) -> PointMeta {
        let mut merged = PointMeta::default();
        for module in &self.modules {
            merged.extend_from(&module.meta);
        }
        merged.extend_from(&self.meta);
        merged
    }

    fn info(&self) -> RecorderInfo {
        RecorderInfo {
            model: self.model.clone(),
            ip: self.ip.clone(),
            unit_id: self.unit_id,
            config_file: self.config_file.clone(),
        }
    }

    /// One poll cycle: every module first, then the device-level math
    /// block. Any short read abandons the cycle.
    pub async fn poll(&mut self) -> Option<DataTable> {
        self.link.connect().await;
        if !self.link.is_open() {
            return None;
        }

        let time = Utc::now().naive_utc();
        let mut points = Vec::new();
        let mut modules_good = true;
        for module in &self.modules {
            let module_points = module.poll(&mut self.link).await;
            if module_points.is_empty() {
                modules_good = false;
            }
            points.extend(module_points);
        }

        let data = self
            .link
            .read_i32_input(
                self.layout.start_data,
                self.layout.n_data,
                WordOrder::LittleEndian,
            )
            .await;
        let mut alarm_words = self
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

        alarm_words.extend_from_slice(&math_alarms);
        if data.len() != self.layout.n_data as usize
            || math.len() != self.layout.n_math as usize
            || !modules_good
        {
            error!(
                "Problem getting data from {} at IP Address: {}",
                self.model, self.ip
            );
            return None;
        }

        let device_points = assemble_points(&self.meta, &[], &math, &alarm_words, GX_ALARM_MASKS);
        points.extend(filter_used(&self.meta, device_points));

        if points.is_empty() {
            error!(
                "Problem getting data from {} at IP Address: {}",
                self.model, self.ip
            );
            return None;
        }

        let mut table = DataTable::new(time, DeviceType::Recorder, self.recorder_id);
        table.points = points;
        Some(table)
    }

    pub async fn update_database(&mut self, db: &mut Database, table: &DataTable) {
        let historical = self.cycle.step();
        let meta = self.merged_meta();
        let info = self.info();
        write_recorder_points(db, &meta, table, historical, &info).await;
    }

    pub async fn close(&mut self) {
        self.link.close().await;
    }
}

/// Parse a GX20 configuration dump into the device layout, device-level
/// (math) metadata and the channel modules.
pub fn parse_config(lines: &[String]) -> Result<(RecorderLayout, PointMeta, Vec<Gx20Module>)> {
    let mut modules = Vec::new();
    let mut meta = PointMeta::default();
    let mut n_math: u16 = 0;
    let mut last_channel: Option<u16> = None;
    let mut alarm_slots = AlarmSlots::default();

    for line in lines {
        let Some((head, rest, fields)) = split_config_line(line) else {
            continue;
        };

        if head.starts_with("SRANGEAI") {
            let channel = parse_u32(&fields[0])? as u16;
            match last_channel {
                None => modules.push(Gx20Module::parse(channel, lines)?),
                Some(prev) if channel != prev + 1 => {
                    modules.push(Gx20Module::parse(channel, lines)?)
                }
                Some(_) => {}
            }
            last_channel = Some(channel);
        }

        if head.starts_with("SRANGEMATH") && !rest.contains("OFF") && fields.len() >= 5 {
            n_math += 1;
            if fields[1].trim() == "ON" {
                meta.units
                    .push(strip_quotes(fields.last().map(String::as_str).unwrap_or("")));
                meta.decimals.push(parse_u32(&fields[4])?);
            } else {
                meta.units.push(UNUSED.to_string());
                meta.decimals.push(0);
            }
        }

        if head.starts_with("SALARMMATH")
            && fields.len() >= 4
            && meta.alarm_types.len() < n_math as usize
        {
            let slot = parse_u32(&fields[1])? as usize;
            let value = if fields[2].trim() == "ON" {
                fields[3].trim().to_string()
            } else {
                UNUSED.to_string()
            };
            if let Some(done) = alarm_slots.set(slot, value) {
                meta.alarm_types.push(done);
            }
        }

        if head.starts_with("STAGMATH") && fields.len() >= 2 && meta.tags.len() < n_math as usize {
            if fields[1].trim() != "''" {
                meta.tags
                    .push(strip_quotes(fields.last().map(String::as_str).unwrap_or("")));
            } else {
                meta.tags.push(NO_TAG.to_string());
            }
        }
    }

    // Register addresses and sizes from the tech manual, section 4.5.
    // Analog channels are read per module; the device-level block covers
    // the math channels.
    let layout = RecorderLayout {
        port: MODBUS_PORT,
        start_data: 0,
        n_data: 0,
        data_words: 2,
        start_alarms: 2500,
        start_math: 5000,
        n_math,
        math_words: 2,
        start_math_alarms: 5500,
    };

    if !meta.is_consistent() || meta.len() != n_math as usize {
        return Err(DiodeError::config(format!(
            "inconsistent GX20 math configuration: {} points, {} tags",
            n_math,
            meta.tags.len()
        )));
    }

    Ok((layout, meta, modules))
}

/// Units and decimal shift for one `SRANGEAI` line, in source precedence
/// order (GX20 variant).
fn range_units(rest: &str, fields: &[String]) -> Result<(String, u32)> {
    let field = |n: usize| -> String {
        fields
            .get(fields.len().wrapping_sub(n))
            .map(|f| f.trim().to_string())
            .unwrap_or_default()
    };
    let field_or_no_units = |n: usize| -> String {
        let raw = field(n);
        if raw == "''" {
            "NO UNITS".to_string()
        } else {
            strip_quotes(&raw)
        }
    };

    if rest.contains("SKIP")
        || rest.contains("VOLT,2V,OFF,-20000,20000,0")
        || rest.contains("VOLT,200MV,SCALE,4000,20000,0,1,0,10000,")
    {
        return Ok((UNUSED.to_string(), 0));
    }

    if rest.contains("DELTA") {
        if rest.contains("VOLT") {
            let decimals = if rest.contains("1V") || rest.contains("2V") {
                4
            } else if rest.contains("20MV") || rest.contains("6V") || rest.contains("20V") {
                3
            } else {
                2
            };
            return Ok(("NO UNITS".to_string(), decimals));
        }
        if rest.contains("TC") {
            return Ok(("F".to_string(), 1));
        }
        if rest.contains("RTD") {
            let decimals = if rest.contains("PT100-H") || rest.contains("JPT100-H") {
                2
            } else {
                1
            };
            return Ok(("F".to_string(), decimals));
        }
        if rest.contains("DI") {
            return Ok(("NO UNITS".to_string(), 0));
        }
        // "NO UNTIS" (sic) is what this fallback has always emitted on
        // GX20 recorders; both sides must derive identical unit strings,
        // so the misspelling stays.
        return Ok(("NO UNTIS".to_string(), 2));
    }

    if rest.contains("SCALE") {
        if rest.contains("GS") {
            return Ok((field_or_no_units(3), parse_u32(&field(6))?));
        }
        return Ok((field_or_no_units(1), parse_u32(&field(4))?));
    }

    if rest.contains("SQRT") {
        return Ok((field_or_no_units(4), parse_u32(&field(7))?));
    }

    if rest.contains("LOG") {
        return Ok((field_or_no_units(1), parse_u32(&field(4))?));
    }

    if rest.contains("VOLT") {
        let decimals = if rest.contains("1V") || rest.contains("2V") {
            4
        } else if rest.contains("20MV") || rest.contains("6V") || rest.contains("20V") {
            3
        } else {
            2
        };
        return Ok(("V".to_string(), decimals));
    }

    if rest.contains("TC") {
        return Ok(("F".to_string(), 1));
    }

    if rest.contains("RTD") {
        let decimals = if rest.contains("PT100-H") || rest.contains("JPT100-H") {
            2
        } else {
            1
        };
        return Ok(("F".to_string(), decimals));
    }

    if rest.contains("DI") {
        return Ok(("NO UNITS".to_string(), 0));
    }

    Ok((UNUSED.to_string(), 0))
}
