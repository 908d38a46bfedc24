//! Error handling for the diode bridge service.
//!
//! A single service-wide error enum with message-string variants; all
//! subsystems convert into it so that `?` works end to end.

use thiserror::Error;

/// Diode service error type
#[derive(Error, Debug, Clone)]
pub enum DiodeError {
    /// Configuration-related errors (manifest, device configs, settings)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Modbus protocol or transport errors
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Data handling errors (framing, decoding, conversion)
    #[error("Data error: {0}")]
    DataError(String),

    /// Serial link errors
    #[error("Serial error: {0}")]
    SerialError(String),

    /// Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Result type alias for the diode service
pub type Result<T> = std::result::Result<T, DiodeError>;

impl DiodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        DiodeError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        DiodeError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        DiodeError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        DiodeError::ConnectionError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        DiodeError::DataError(msg.into())
    }

    pub fn serial(msg: impl Into<String>) -> Self {
        DiodeError::SerialError(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        DiodeError::DatabaseError(msg.into())
    }
}

impl From<std::io::Error> for DiodeError {
    fn from(err: std::io::Error) -> Self {
        DiodeError::IoError(err.to_string())
    }
}

impl From<voltage_modbus::ModbusError> for DiodeError {
    fn from(err: voltage_modbus::ModbusError) -> Self {
        DiodeError::ProtocolError(format!("Modbus: {err}"))
    }
}

impl From<tiberius::error::Error> for DiodeError {
    fn from(err: tiberius::error::Error) -> Self {
        DiodeError::DatabaseError(err.to_string())
    }
}

impl From<tokio_serial::Error> for DiodeError {
    fn from(err: tokio_serial::Error) -> Self {
        DiodeError::SerialError(err.to_string())
    }
}

impl From<std::num::ParseIntError> for DiodeError {
    fn from(err: std::num::ParseIntError) -> Self {
        DiodeError::ConfigError(format!("Invalid integer field: {err}"))
    }
}

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn io_error(self, msg: &str) -> Result<T>;
    fn database_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| DiodeError::ConfigError(format!("{msg}: {e}")))
    }

    fn io_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| DiodeError::IoError(format!("{msg}: {e}")))
    }

    fn database_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| DiodeError::DatabaseError(format!("{msg}: {e}")))
    }
}
