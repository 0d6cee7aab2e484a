//! DMX512 over an RS-485 serial adapter.
//!
//! Each frame is a break, a mark-after-break, then the start code and 512 levels at
//! 250 kbaud 8N2.

use std::io::Write;
use std::thread;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, trace};

use crate::error::Result;
use crate::universe::DmxFrame;

pub const DMX_BAUD: u32 = 250_000;
/// Break length. The standard minimum is 88 µs.
pub const BREAK_TIME: Duration = Duration::from_micros(100);
/// Mark-after-break length. The standard minimum is 8 µs.
pub const MARK_AFTER_BREAK: Duration = Duration::from_micros(12);

const WRITE_TIMEOUT: Duration = Duration::from_millis(50);

/// The three line operations needed to frame DMX512.
pub trait DmxLine: Send {
    fn set_break(&mut self) -> std::io::Result<()>;
    fn clear_break(&mut self) -> std::io::Result<()>;
    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

impl DmxLine for Box<dyn SerialPort> {
    fn set_break(&mut self) -> std::io::Result<()> {
        SerialPort::set_break(&**self).map_err(std::io::Error::from)
    }

    fn clear_break(&mut self) -> std::io::Result<()> {
        SerialPort::clear_break(&**self).map_err(std::io::Error::from)
    }

    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }
}

/// A DMX512 transmitter on any [`DmxLine`].
pub struct SerialDmx {
    port_name: String,
    line: Box<dyn DmxLine>,
}

impl std::fmt::Debug for SerialDmx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialDmx")
            .field("port", &self.port_name)
            .finish()
    }
}

impl SerialDmx {
    /// Opens `port` at 250000 baud, 8 data bits, no parity, 2 stop bits.
    pub fn open(port: &str) -> Result<Self> {
        let handle = serialport::new(port, DMX_BAUD)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::Two)
            .flow_control(FlowControl::None)
            .timeout(WRITE_TIMEOUT)
            .open()?;
        debug!(port, "serial DMX port opened");
        Ok(Self::with_line(port, Box::new(handle)))
    }

    pub fn with_line(port_name: impl Into<String>, line: Box<dyn DmxLine>) -> Self {
        Self {
            port_name: port_name.into(),
            line,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Break, mark-after-break, then all 513 bytes of `frame`.
    pub fn send(&mut self, frame: &DmxFrame) -> Result<()> {
        self.line.set_break()?;
        thread::sleep(BREAK_TIME);
        self.line.clear_break()?;
        thread::sleep(MARK_AFTER_BREAK);
        self.line.write_frame(frame.as_bytes())?;
        trace!(port = %self.port_name, "serial frame");
        Ok(())
    }
}

/// Names of serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum Op {
        Break,
        Mark,
        Write(Vec<u8>),
    }

    struct RecordingLine(Arc<Mutex<Vec<Op>>>);

    impl DmxLine for RecordingLine {
        fn set_break(&mut self) -> std::io::Result<()> {
            self.0.lock().push(Op::Break);
            Ok(())
        }

        fn clear_break(&mut self) -> std::io::Result<()> {
            self.0.lock().push(Op::Mark);
            Ok(())
        }

        fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.0.lock().push(Op::Write(bytes.to_vec()));
            Ok(())
        }
    }

    struct BrokenLine;

    impl DmxLine for BrokenLine {
        fn set_break(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::other("unplugged"))
        }

        fn clear_break(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn write_frame(&mut self, _: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frame_is_break_mark_then_513_bytes() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let mut dmx = SerialDmx::with_line("mock", Box::new(RecordingLine(ops.clone())));
        let mut frame = DmxFrame::new();
        frame.set(1, 200);
        frame.set(512, 1);
        dmx.send(&frame).unwrap();

        let ops = ops.lock();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0], Op::Break);
        assert_eq!(ops[1], Op::Mark);
        let Op::Write(bytes) = &ops[2] else {
            panic!("expected a write, got {:?}", ops[2]);
        };
        assert_eq!(bytes.len(), 513);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 200);
        assert_eq!(bytes[512], 1);
    }

    #[test]
    fn line_errors_are_returned() {
        let mut dmx = SerialDmx::with_line("mock", Box::new(BrokenLine));
        assert!(matches!(dmx.send(&DmxFrame::new()), Err(crate::error::Error::Io(_))));
    }
}
