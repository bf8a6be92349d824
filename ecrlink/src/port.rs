//! Byte-stream access to the terminal link.

use serde::Deserialize;
use std::io::{Read, Write};
use std::time::Duration;

/// A byte port to the terminal.
///
/// Implementations are blocking; the reader runs them on a dedicated
/// thread. A read timeout must surface as [std::io::ErrorKind::TimedOut]
/// (or `WouldBlock`) so the reader can poll its shutdown flag between
/// bytes.
pub trait BytePort: Send {
    /// Blocks until one byte arrives or the port's read timeout elapses.
    fn read_byte(&mut self) -> std::io::Result<u8>;

    /// Writes the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Drops bytes already received but not yet read.
    fn discard_input(&mut self) -> std::io::Result<()>;
}

/// Parity of the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityMode {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial-line settings; 19200 8-N-1 with 3 s timeouts by default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "data_bits")]
    pub data_bits: u8,

    #[serde(default)]
    pub parity: ParityMode,

    #[serde(default = "stop_bits")]
    pub stop_bits: u8,

    /// Poll interval of the reader as well; teardown may take up to this
    /// long to join the reader thread.
    #[serde(default = "timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "timeout_ms")]
    pub write_timeout_ms: u64,
}

const fn baud_rate() -> u32 {
    19200
}

const fn data_bits() -> u8 {
    8
}

const fn stop_bits() -> u8 {
    1
}

const fn timeout_ms() -> u64 {
    3000
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: baud_rate(),
            data_bits: data_bits(),
            parity: ParityMode::default(),
            stop_bits: stop_bits(),
            read_timeout_ms: timeout_ms(),
            write_timeout_ms: timeout_ms(),
        }
    }
}

/// [BytePort] over a system serial device.
pub struct SerialBytePort {
    inner: Box<dyn serialport::SerialPort>,
}

fn into_io(error: serialport::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, error)
}

/// Opens the serial device at `path` and returns a (reader, writer) pair of
/// handles onto the same line. Fails immediately on an unknown or busy
/// device.
pub fn open_serial(
    path: &str,
    settings: &SerialSettings,
) -> std::io::Result<(SerialBytePort, SerialBytePort)> {
    let data_bits = match settings.data_bits {
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported data bits: {other}"),
            ))
        }
    };
    let stop_bits = match settings.stop_bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported stop bits: {other}"),
            ))
        }
    };
    let parity = match settings.parity {
        ParityMode::None => serialport::Parity::None,
        ParityMode::Odd => serialport::Parity::Odd,
        ParityMode::Even => serialport::Parity::Even,
    };

    let reader = serialport::new(path, settings.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(settings.read_timeout_ms))
        .open()
        .map_err(into_io)?;
    let writer = reader.try_clone().map_err(into_io)?;

    Ok((
        SerialBytePort { inner: reader },
        SerialBytePort { inner: writer },
    ))
}

impl BytePort for SerialBytePort {
    fn read_byte(&mut self) -> std::io::Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf)?;
        self.inner.flush()
    }

    fn discard_input(&mut self) -> std::io::Result<()> {
        self.inner
            .clear(serialport::ClearBuffer::Input)
            .map_err(into_io)
    }
}
