//! Generic Modbus/TCP device adapter.
//!
//! A device config file describes one or more devices, each with one or
//! more register modules. A module is a contiguous register block read
//! in one request; its tag rows bind individual registers (or bits) to
//! named points. Register ranges in the file are one-based inclusive;
//! internally blocks are zero-based.

use chrono::Utc;
use tracing::error;

use crate::codec::{DataPoint, DataTable, DeviceType};
use crate::db::Database;
use crate::devices::parse_u32;
use crate::devices::recorder::{scale, CycleCounter};
use crate::error::{DiodeError, Result};
use crate::protocols::modbus::{ModbusLink, WordOrder};

const DEFAULT_PORT: u16 = 502;

/// Register interpretation for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModbusDataType {
    #[default]
    ShortHolding,
    ShortInput,
    BigEndianHolding,
    BigEndianInput,
    LittleEndianHolding,
    LittleEndianInput,
    SingleBitHolding,
    SingleBitInput,
}

impl ModbusDataType {
    /// Parse the `Data Type:` value of a device config file.
    pub fn from_config(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "short holding" => Some(Self::ShortHolding),
            "short input" => Some(Self::ShortInput),
            "big endian holding" => Some(Self::BigEndianHolding),
            "big endian input" => Some(Self::BigEndianInput),
            "little endian holding" => Some(Self::LittleEndianHolding),
            "little endian input" => Some(Self::LittleEndianInput),
            "single bit holding" => Some(Self::SingleBitHolding),
            "single bit input" => Some(Self::SingleBitInput),
            _ => None,
        }
    }
}

/// One contiguous register block and the tags bound into it.
#[derive(Debug, Default)]
pub struct ModbusDeviceModule {
    start_addr: u16,
    n_regs: u16,
    data_type: ModbusDataType,
    tags: Vec<String>,
    units: Vec<String>,
    decimals: Vec<u32>,
    /// Zero-based register offset of each tag within the block.
    offsets: Vec<usize>,
}

impl ModbusDeviceModule {
    pub fn new(start_addr: u16, n_regs: u16) -> Self {
        Self {
            start_addr,
            n_regs,
            ..Default::default()
        }
    }

    pub fn set_data_type(&mut self, data_type: ModbusDataType) {
        self.data_type = data_type;
    }

    pub fn data_type(&self) -> ModbusDataType {
        self.data_type
    }

    pub fn start_addr(&self) -> u16 {
        self.start_addr
    }

    pub fn n_regs(&self) -> u16 {
        self.n_regs
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    /// Bind a tag row. `register` is the one-based register reference
    /// from the config file; for single-bit types `decimals` is the bit
    /// index instead of a decimal shift.
    pub fn add_tag(&mut self, tag: String, units: String, decimals: u32, register: u32) -> Result<()> {
        let offset = register
            .checked_sub(self.start_addr as u32 + 1)
            .ok_or_else(|| {
                DiodeError::config(format!(
                    "register {register} is below module start {}",
                    self.start_addr + 1
                ))
            })?;
        self.tags.push(tag);
        self.units.push(units);
        self.decimals.push(decimals);
        self.offsets.push(offset as usize);
        Ok(())
    }

    /// Read this module's block and decode one point per tag. A failed
    /// or short block read yields an empty vector.
    pub async fn poll(&self, link: &mut ModbusLink) -> Vec<DataPoint> {
        match self.data_type {
            ModbusDataType::ShortHolding | ModbusDataType::SingleBitHolding => {
                let regs = link.read_i16_holding(self.start_addr, self.n_regs).await;
                self.decode_shorts(&regs)
            }
            ModbusDataType::ShortInput | ModbusDataType::SingleBitInput => {
                let regs = link.read_i16_input(self.start_addr, self.n_regs).await;
                self.decode_shorts(&regs)
            }
            ModbusDataType::BigEndianHolding => {
                let values = link
                    .read_i32_holding(self.start_addr, self.n_regs / 2, WordOrder::BigEndian)
                    .await;
                self.decode_longs(&values)
            }
            ModbusDataType::BigEndianInput => {
                let values = link
                    .read_i32_input(self.start_addr, self.n_regs / 2, WordOrder::BigEndian)
                    .await;
                self.decode_longs(&values)
            }
            ModbusDataType::LittleEndianHolding => {
                let values = link
                    .read_i32_holding(self.start_addr, self.n_regs / 2, WordOrder::LittleEndian)
                    .await;
                self.decode_longs(&values)
            }
            ModbusDataType::LittleEndianInput => {
                let values = link
                    .read_i32_input(self.start_addr, self.n_regs / 2, WordOrder::LittleEndian)
                    .await;
                self.decode_longs(&values)
            }
        }
    }

    /// Decode a 16-bit block: plain registers scale by the decimal
    /// shift, single-bit types extract `(value >> bit) & 1`.
    fn decode_shorts(&self, regs: &[i16]) -> Vec<DataPoint> {
        if regs.is_empty() {
            return Vec::new();
        }
        let single_bit = matches!(
            self.data_type,
            ModbusDataType::SingleBitHolding | ModbusDataType::SingleBitInput
        );
        let mut points = Vec::with_capacity(self.tags.len());
        for i in 0..self.tags.len() {
            let Some(raw) = self.offsets.get(i).and_then(|o| regs.get(*o)) else {
                error!(
                    "Tag {} references a register outside its module block",
                    self.tags[i]
                );
                continue;
            };
            let value = if single_bit {
                ((*raw >> self.decimals[i]) & 0x01) as f64
            } else {
                scale(*raw as f64, self.decimals[i])
            };
            points.push(DataPoint::new(value));
        }
        points
    }

    /// Decode a 32-bit block; each tag offset addresses a register pair.
    fn decode_longs(&self, values: &[i32]) -> Vec<DataPoint> {
        if values.is_empty() {
            return Vec::new();
        }
        let mut points = Vec::with_capacity(self.tags.len());
        for i in 0..self.tags.len() {
            let Some(raw) = self.offsets.get(i).and_then(|o| values.get(*o / 2)) else {
                error!(
                    "Tag {} references a register outside its module block",
                    self.tags[i]
                );
                continue;
            };
            points.push(DataPoint::new(scale(*raw as f64, self.decimals[i])));
        }
        points
    }
}

/// A generic Modbus/TCP device from the device config file.
pub struct ModbusDevice {
    name: String,
    ip: String,
    unit_id: u8,
    device_id: u32,
    port: u16,
    priority: u8,
    modules: Vec<ModbusDeviceModule>,
    link: Option<ModbusLink>,
    cycle: CycleCounter,
}

impl ModbusDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: String::new(),
            unit_id: 0,
            device_id: 0,
            port: DEFAULT_PORT,
            priority: 3,
            modules: Vec::new(),
            link: None,
            cycle: CycleCounter::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn set_ip(&mut self, ip: impl Into<String>) {
        self.ip = ip.into();
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn set_unit_id(&mut self, unit_id: u8) {
        self.unit_id = unit_id;
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn set_device_id(&mut self, id: u32) {
        self.device_id = id;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Priorities outside 1..3 fall back to the lowest lane.
    pub fn set_priority(&mut self, priority: u8) {
        if (1..=3).contains(&priority) {
            self.priority = priority;
        } else {
            tracing::warn!(
                "Priority level for {} at IP address {} is not between 1 and 3. Setting priority level to 3.",
                self.name,
                self.ip
            );
            self.priority = 3;
        }
    }

    pub fn add_module(&mut self, module: ModbusDeviceModule) {
        self.modules.push(module);
    }

    pub fn modules(&self) -> &[ModbusDeviceModule] {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut Vec<ModbusDeviceModule> {
        &mut self.modules
    }

    /// All tag names across the modules, in read order.
    pub fn tags(&self) -> Vec<String> {
        self.modules
            .iter()
            .flat_map(|m| m.tags.iter().cloned())
            .collect()
    }

    /// One poll cycle: read every module over a fresh connection and
    /// emit a record only when every tag produced a point.
    pub async fn poll(&mut self) -> Option<DataTable> {
        if self.link.is_none() {
            self.link = Some(ModbusLink::new(
                self.name.clone(),
                &self.ip,
                self.port,
                self.unit_id,
            ));
        }
        let Some(link) = self.link.as_mut() else {
            return None;
        };
        link.connect().await;
        if !link.is_open() {
            return None;
        }

        let time = Utc::now().naive_utc();
        let mut tag_count = 0;
        let mut points = Vec::new();
        for module in &self.modules {
            tag_count += module.tags.len();
            points.extend(module.poll(link).await);
        }
        link.close().await;

        if points.len() != tag_count {
            error!(
                "Problem getting data from {} at IP Address: {}",
                self.name, self.ip
            );
            return None;
        }

        let mut table = DataTable::new(time, DeviceType::ModbusDevice, self.device_id);
        table.points = points;
        Some(table)
    }

    /// Receive-side sink: every record refreshes the device's current
    /// table; every tenth also appends a row to its historical table.
    pub async fn update_database(&mut self, db: &mut Database, table: &DataTable) {
        let values: Vec<f64> = table.points.iter().map(|p| p.value).collect();
        let tags = self.tags();
        if self.cycle.step() {
            db.update_modbus_record(&self.name, &tags, table.time, &values)
                .await;
        } else {
            db.update_modbus_current(&self.name, &tags, table.time, &values)
                .await;
        }
    }

    pub async fn close(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.close().await;
        }
    }
}

/// Parse a Modbus device config file into devices. A malformed line
/// drops the device being built (logged SEVERE) and parsing continues
/// with the next `Device Name:` block.
pub fn parse_devices(lines: &[String]) -> Vec<ModbusDevice> {
    let mut devices: Vec<ModbusDevice> = Vec::new();
    let mut current: Option<ModbusDevice> = None;
    let mut skipping = false;

    for line in lines {
        let line = line.trim();
        if line.contains("**") || line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix("Device Name:") {
            if let Some(done) = current.take() {
                devices.push(done);
            }
            current = Some(ModbusDevice::new(name.trim()));
            skipping = false;
            continue;
        }

        if skipping {
            continue;
        }
        let Some(device) = current.as_mut() else {
            error!("Modbus config line outside a Device Name block: {line}");
            continue;
        };

        if let Err(e) = apply_device_line(device, line) {
            error!(
                "Dropping Modbus device {} from config: {e}",
                device.name()
            );
            current = None;
            skipping = true;
        }
    }

    if let Some(done) = current.take() {
        devices.push(done);
    }
    devices
}

fn apply_device_line(device: &mut ModbusDevice, line: &str) -> Result<()> {
    if let Some(value) = line.strip_prefix("IP Address:") {
        let ip = value.trim();
        ip.parse::<std::net::IpAddr>()
            .map_err(|e| DiodeError::config(format!("IP Address {ip} appears invalid: {e}")))?;
        device.set_ip(ip);
    } else if let Some(value) = line.strip_prefix("Slave number:") {
        device.set_unit_id(parse_u32(value)? as u8);
    } else if let Some(value) = line.strip_prefix("Port:") {
        device.set_port(parse_u32(value)? as u16);
    } else if let Some(value) = line.strip_prefix("Priority:") {
        device.set_priority(parse_u32(value)? as u8);
    } else if let Some(value) = line.strip_prefix("Registers:") {
        let (start, end) = value
            .split_once(',')
            .ok_or_else(|| DiodeError::config(format!("bad register range: {value}")))?;
        let start = parse_u32(start)?;
        let end = parse_u32(end)?;
        if end < start || start == 0 {
            return Err(DiodeError::config(format!(
                "bad register range: {start}, {end}"
            )));
        }
        device.add_module(ModbusDeviceModule::new(
            (start - 1) as u16,
            (end - start + 1) as u16,
        ));
    } else if let Some(value) = line.strip_prefix("Data Type:") {
        let data_type = ModbusDataType::from_config(value)
            .ok_or_else(|| DiodeError::config(format!("unknown data type: {}", value.trim())))?;
        let module = device
            .modules_mut()
            .last_mut()
            .ok_or_else(|| DiodeError::config("Data Type before any Registers line"))?;
        module.set_data_type(data_type);
    } else {
        // Anything else is a tag row: name, units, decimals, register.
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            return Err(DiodeError::config(format!("bad tag row: {line}")));
        }
        let decimals = parse_u32(fields[2])?;
        let register = parse_u32(fields[3])?;
        let module = device
            .modules_mut()
            .last_mut()
            .ok_or_else(|| DiodeError::config("tag row before any Registers line"))?;
        module.add_tag(
            fields[0].to_string(),
            fields[1].to_string(),
            decimals,
            register,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn single_device_config_parses() {
        // One holding-register device, one block, one temperature tag.
        let cfg = lines(&[
            "** plant floor PLC **",
            "Device Name: Boiler PLC",
            "IP Address: 10.0.0.5",
            "Slave number: 1",
            "Port: 502",
            "Priority: 2",
            "Registers: 40001, 40002",
            "Data Type: short holding",
            "temp1, C, 1, 40001",
        ]);
        let devices = parse_devices(&cfg);
        assert_eq!(devices.len(), 1);

        let device = &devices[0];
        assert_eq!(device.name(), "Boiler PLC");
        assert_eq!(device.ip(), "10.0.0.5");
        assert_eq!(device.unit_id(), 1);
        assert_eq!(device.priority(), 2);
        assert_eq!(device.modules().len(), 1);

        let module = &device.modules()[0];
        assert_eq!(module.start_addr(), 40000);
        assert_eq!(module.n_regs(), 2);
        assert_eq!(module.data_type(), ModbusDataType::ShortHolding);
        assert_eq!(module.tags(), ["temp1"]);
        assert_eq!(module.offsets, vec![0]);
    }

    #[test]
    fn short_holding_block_scales_by_decimals() {
        // Register 40001 = 240 with one decimal: 24.0 engineering units.
        let cfg = lines(&[
            "Device Name: D",
            "IP Address: 10.0.0.5",
            "Registers: 40001, 40002",
            "Data Type: short holding",
            "temp1, C, 1, 40001",
        ]);
        let devices = parse_devices(&cfg);
        let module = &devices[0].modules()[0];

        let points = module.decode_shorts(&[0x00F0, 0]);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 24.0);
        assert_eq!(points[0].alarms, None);
    }

    #[test]
    fn single_bit_type_extracts_bit_index() {
        let cfg = lines(&[
            "Device Name: D",
            "IP Address: 10.0.0.5",
            "Registers: 1, 1",
            "Data Type: single bit holding",
            "pump_run, NO UNITS, 3, 1",
            "pump_fault, NO UNITS, 0, 1",
        ]);
        let devices = parse_devices(&cfg);
        let module = &devices[0].modules()[0];

        let points = module.decode_shorts(&[0b0000_1000]);
        assert_eq!(points[0].value, 1.0);
        assert_eq!(points[1].value, 0.0);
    }

    #[test]
    fn thirty_two_bit_blocks_index_register_pairs() {
        let cfg = lines(&[
            "Device Name: D",
            "IP Address: 10.0.0.5",
            "Registers: 101, 104",
            "Data Type: big endian input",
            "flow, GPM, 2, 101",
            "total, GAL, 0, 103",
        ]);
        let devices = parse_devices(&cfg);
        let module = &devices[0].modules()[0];
        assert_eq!(module.data_type(), ModbusDataType::BigEndianInput);

        let points = module.decode_longs(&[12345, 777]);
        assert_eq!(points[0].value, 123.45);
        assert_eq!(points[1].value, 777.0);
    }

    #[test]
    fn all_eight_data_types_parse() {
        for (text, expected) in [
            ("short holding", ModbusDataType::ShortHolding),
            ("short input", ModbusDataType::ShortInput),
            ("big endian holding", ModbusDataType::BigEndianHolding),
            ("big endian input", ModbusDataType::BigEndianInput),
            ("little endian holding", ModbusDataType::LittleEndianHolding),
            ("little endian input", ModbusDataType::LittleEndianInput),
            ("single bit holding", ModbusDataType::SingleBitHolding),
            ("single bit input", ModbusDataType::SingleBitInput),
        ] {
            assert_eq!(ModbusDataType::from_config(text), Some(expected));
            assert_eq!(
                ModbusDataType::from_config(&text.to_uppercase()),
                Some(expected)
            );
        }
        assert_eq!(ModbusDataType::from_config("float holding"), None);
    }

    #[test]
    fn bad_ip_drops_the_device_but_not_the_file() {
        let cfg = lines(&[
            "Device Name: Broken",
            "IP Address: not-an-ip",
            "Registers: 1, 2",
            "Device Name: Good",
            "IP Address: 10.0.0.7",
            "Registers: 1, 2",
            "Data Type: short input",
            "t, C, 0, 1",
        ]);
        let devices = parse_devices(&cfg);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name(), "Good");
    }

    #[test]
    fn out_of_range_priority_maps_to_three() {
        let mut device = ModbusDevice::new("D");
        device.set_priority(7);
        assert_eq!(device.priority(), 3);
        device.set_priority(1);
        assert_eq!(device.priority(), 1);
    }

    #[test]
    fn multiple_devices_in_one_file() {
        let cfg = lines(&[
            "Device Name: A",
            "IP Address: 10.0.0.1",
            "Registers: 1, 2",
            "Data Type: short input",
            "a1, C, 0, 1",
            "Device Name: B",
            "IP Address: 10.0.0.2",
            "Registers: 11, 12",
            "Data Type: short holding",
            "b1, C, 0, 11",
            "b2, C, 0, 12",
        ]);
        let devices = parse_devices(&cfg);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].tags(), vec!["a1"]);
        assert_eq!(devices[1].tags(), vec!["b1", "b2"]);
        assert_eq!(devices[1].modules()[0].offsets, vec![0, 1]);
    }
}
