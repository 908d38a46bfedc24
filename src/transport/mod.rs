//! Diode-facing transport (the three serial links).

pub mod serial;
