//! Device-facing protocol plumbing (Modbus/TCP).

pub mod modbus;
