use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },
    #[error("read timed out before a full line arrived")]
    Timeout,
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),
}

/// Byte channel to the sensor array. One logical owner per handle; the
/// acquisition protocol holds it exclusively for the duration of a cycle.
pub trait SensorLink {
    /// Non-blocking check for buffered inbound bytes.
    fn has_data(&mut self) -> Result<bool, LinkError>;
    /// Reads one newline-terminated line, raw bytes included. The configured
    /// read timeout applies per byte; a stalled device surfaces as `Timeout`.
    fn read_line(&mut self) -> Result<Vec<u8>, LinkError>;
    /// Writes a single control byte (start/stop or frame ack).
    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError>;
}

/// `serialport`-backed link. The handle closes when the value drops, so it is
/// released on every exit path including mid-read errors.
pub struct SerialSensorLink {
    port: Box<dyn SerialPort>,
}

impl SerialSensorLink {
    pub fn open(port_name: &str, baud: u32, timeout: Duration) -> Result<Self, LinkError> {
        let port = serialport::new(port_name, baud)
            .timeout(timeout)
            .open()
            .map_err(|source| LinkError::Open {
                port: port_name.to_string(),
                source,
            })?;
        Ok(Self { port })
    }

    /// Discards anything left over in the OS buffers from a previous run.
    pub fn clear_buffers(&mut self) -> Result<(), LinkError> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

impl SensorLink for SerialSensorLink {
    fn has_data(&mut self) -> Result<bool, LinkError> {
        Ok(self.port.bytes_to_read()? > 0)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LinkError> {
        let mut line = Vec::with_capacity(64);
        let mut byte = [0u8; 1];
        loop {
            match self.port.read_exact(&mut byte) {
                Ok(()) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        return Ok(line);
                    }
                }
                Err(err) if err.kind() == ErrorKind::TimedOut => return Err(LinkError::Timeout),
                Err(err) => return Err(LinkError::Io(err)),
            }
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        self.port.write_all(&[byte])?;
        self.port.flush()?;
        Ok(())
    }
}

/// In-memory link with scripted inbound lines and recorded outbound bytes.
/// Used for deterministic protocol tests and replay.
pub struct ScriptedLink {
    inbound: VecDeque<Vec<u8>>,
    pub sent: Vec<u8>,
}

impl ScriptedLink {
    pub fn new<I, L>(lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<Vec<u8>>,
    {
        Self {
            inbound: lines.into_iter().map(Into::into).collect(),
            sent: Vec::new(),
        }
    }
}

impl SensorLink for ScriptedLink {
    fn has_data(&mut self) -> Result<bool, LinkError> {
        Ok(!self.inbound.is_empty())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LinkError> {
        self.inbound.pop_front().ok_or(LinkError::Timeout)
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        self.sent.push(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_link_replays_lines_in_order() {
        let mut link = ScriptedLink::new(["1 2 3\n", "4 5 6\n"]);
        assert!(link.has_data().unwrap());
        assert_eq!(link.read_line().unwrap(), b"1 2 3\n".to_vec());
        assert_eq!(link.read_line().unwrap(), b"4 5 6\n".to_vec());
        assert!(!link.has_data().unwrap());
    }

    #[test]
    fn scripted_link_times_out_when_drained() {
        let mut link = ScriptedLink::new(Vec::<Vec<u8>>::new());
        assert!(matches!(link.read_line(), Err(LinkError::Timeout)));
    }

    #[test]
    fn scripted_link_records_control_bytes() {
        let mut link = ScriptedLink::new(Vec::<Vec<u8>>::new());
        link.write_byte(b'S').unwrap();
        link.write_byte(b'T').unwrap();
        assert_eq!(link.sent, vec![b'S', b'T']);
    }
}
