//! Serial transport under the AT driver.
//!
//! The AT dialect is strictly request/response, so the transport stays
//! deliberately small: a blocking read with a port-level timeout and an
//! unbuffered write. The driver's `expect` loop is built on these two calls.

use std::io::Read;
use std::io::Write;
use std::time::Duration;

use super::ModemError;

/// Per-read timeout on the serial line. A healthy modem answers well inside
/// this window; expiry aborts the current AT exchange, not the device worker.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte-level link the AT driver talks through. Implemented by the real
/// serial port and by scripted links in tests.
pub trait AtTransport: Send {
    /// Blocking read of whatever is available, up to `buf.len()` bytes.
    /// A timeout surfaces as `Err` with `ErrorKind::TimedOut`.
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write all bytes and flush. The `>` prompt protocol relies on the bytes
    /// reaching the modem before the next read.
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;
}

/// 8-N-1 serial line at a configured baud rate.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    pub fn open(port_name: &str, baud: u32) -> Result<Self, ModemError> {
        let port = serialport::new(port_name, baud)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| ModemError::Port {
                port: port_name.to_string(),
                detail: e.to_string(),
            })?;
        Ok(Self { port })
    }
}

impl AtTransport for SerialLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }
}
