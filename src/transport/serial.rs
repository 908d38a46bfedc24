//! Serial link framing over the diode's three one-way links.
//!
//! Ports are opened once at startup and held for the process lifetime:
//! `/dev/ttyS0..2` at 115200 8N1 without flow control (the diode
//! hardware has no back-channel to assert flow control on). Frames are
//! written and read with the length-delimited codec from
//! [`crate::codec::frame`].

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::codec::frame;
use crate::codec::DataTable;
use crate::error::{DiodeError, Result};

/// The serial device backing each lane, by lane index.
pub const SERIAL_PORTS: [&str; 3] = ["/dev/ttyS0", "/dev/ttyS1", "/dev/ttyS2"];

pub const BAUD_RATE: u32 = 115_200;

/// Open one of the diode links.
pub fn open_port(path: &str) -> Result<SerialStream> {
    let stream = tokio_serial::new(path, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|e| DiodeError::serial(format!("opening {path}: {e}")))?;
    Ok(stream)
}

/// Serialize one record onto the link.
pub async fn write_frame(port: &mut SerialStream, table: &DataTable) -> Result<()> {
    let bytes = frame::encode(table);
    port.write_all(&bytes).await?;
    port.flush().await?;
    Ok(())
}

/// Read one complete record off the link: length prefix, then exactly
/// that many payload bytes. An invalid prefix or undecodable payload is
/// an error; the caller logs it and resynchronizes on the next prefix.
pub async fn read_frame(port: &mut SerialStream) -> Result<DataTable> {
    let mut prefix = [0u8; frame::LENGTH_PREFIX_LEN];
    port.read_exact(&mut prefix).await?;
    let len = frame::payload_len(prefix)?;
    let mut payload = vec![0u8; len];
    port.read_exact(&mut payload).await?;
    frame::decode_payload(&payload)
}
