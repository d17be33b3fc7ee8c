//
// Copyright (C) 2022 CUAVA, The University of Sydney
//
// Licensed under the Apache License, Version 2.0 (the "License")
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-level transports: USB-HID for the inverter, RS-232/485 for the battery

use crate::error::{Error, Result};
use hidapi::{HidApi, HidDevice};
use log::debug;
use serial::SerialPort;
use std::ffi::CString;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Carriage return, the response terminator of both protocols
pub const CR: u8 = 0x0d;

/// HID report size used by the target devices
const REPORT_SIZE: usize = 64;

const DEFAULT_HID_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// A blocking byte channel to a device. Implementations are not safe for
/// concurrent use; callers serialise request/response turns through
/// [`crate::slot::ConnectorSlot`].
pub trait Connector: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    /// Write the whole buffer or fail
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    /// Read up to and including the terminator, with the connector's
    /// configured timeout. Never returns a partial frame on success.
    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>>;
    /// Same as [`Connector::read_until`] with an explicit deadline
    fn read_until_deadline(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>>;
}

// Append a report chunk, dropping NUL padding. Returns true once the
// terminator has been taken.
fn accumulate(buf: &mut Vec<u8>, chunk: &[u8], terminator: u8) -> bool {
    for &b in chunk {
        if b == 0 {
            continue;
        }
        buf.push(b);
        if b == terminator {
            return true;
        }
    }
    false
}

/// USB-HID connector. The devices speak the ASCII protocol inside fixed
/// 64-byte reports, right-padded with NULs.
pub struct UsbConnector {
    path: String,
    // Linux hidraw expects a leading report-ID byte on write for some
    // firmware revisions
    prepend_report_id: bool,
    timeout: Duration,
    api: Option<HidApi>,
    device: Option<HidDevice>,
}

impl UsbConnector {
    pub fn new(path: &str) -> UsbConnector {
        UsbConnector::with_options(path, false, DEFAULT_HID_TIMEOUT)
    }

    pub fn with_options(path: &str, prepend_report_id: bool, timeout: Duration) -> UsbConnector {
        UsbConnector {
            path: path.to_string(),
            prepend_report_id,
            timeout,
            api: None,
            device: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn device(&self) -> Result<&HidDevice> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::Transport(format!("{} not open", self.path)))
    }
}

impl Connector for UsbConnector {
    fn open(&mut self) -> Result<()> {
        // Do nothing if already open
        if self.device.is_some() {
            return Ok(());
        }
        let api = HidApi::new().map_err(|e| Error::Transport(e.to_string()))?;
        let path = CString::new(self.path.as_bytes())
            .map_err(|_| Error::Transport(format!("invalid device path {}", self.path)))?;
        let device = api
            .open_path(&path)
            .map_err(|e| Error::Transport(format!("{}: {}", self.path, e)))?;
        self.device = Some(device);
        self.api = Some(api);
        Ok(())
    }

    fn close(&mut self) {
        self.device = None;
        self.api = None;
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let prepend = self.prepend_report_id;
        let device = self.device()?;
        let mut report = Vec::with_capacity(bytes.len() + 1);
        if prepend {
            report.push(0u8);
        }
        report.extend_from_slice(bytes);
        debug!("hid write {:02x?}", report);
        let written = device
            .write(&report)
            .map_err(|e| Error::Transport(e.to_string()))?;
        if written < report.len() {
            return Err(Error::Transport(format!(
                "write incomplete, {} of {} written",
                written,
                report.len()
            )));
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        self.read_until_deadline(terminator, timeout)
    }

    fn read_until_deadline(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>> {
        let device = self.device()?;
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(REPORT_SIZE);
        let mut report = [0u8; REPORT_SIZE];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Timeout)?;
            let n = device
                .read_timeout(&mut report, remaining.as_millis() as i32)
                .map_err(|e| Error::Transport(e.to_string()))?;
            if n == 0 {
                return Err(Error::Timeout);
            }
            if accumulate(&mut out, &report[..n], terminator) {
                debug!("hid read {:02x?}", out);
                return Ok(out);
            }
        }
    }
}

/// Serial connector, 8 data bits, no parity, 1 stop bit
pub struct SerialConnector {
    path: String,
    baud: usize,
    timeout: Duration,
    port: Option<serial::SystemPort>,
}

impl SerialConnector {
    pub fn new(path: &str, baud: usize) -> SerialConnector {
        SerialConnector::with_timeout(path, baud, DEFAULT_SERIAL_TIMEOUT)
    }

    pub fn with_timeout(path: &str, baud: usize, timeout: Duration) -> SerialConnector {
        SerialConnector {
            path: path.to_string(),
            baud,
            timeout,
            port: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

// Scan bytes one at a time until the terminator. Bytes gathered before a
// timeout are dropped with the buffer.
fn read_port(port: &mut serial::SystemPort, terminator: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match port.read(&mut byte) {
            Ok(0) => return Err(Error::Transport("serial port closed".to_string())),
            Ok(_) => {
                out.push(byte[0]);
                if byte[0] == terminator {
                    debug!("serial read {:02x?}", out);
                    return Ok(out);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl Connector for SerialConnector {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let mut port =
            serial::open(&self.path).map_err(|e| Error::Transport(format!("{}: {}", self.path, e)))?;
        let baud = self.baud;
        port.reconfigure(&|settings| {
            settings.set_baud_rate(serial::BaudRate::from_speed(baud))?;
            settings.set_char_size(serial::Bits8);
            settings.set_parity(serial::ParityNone);
            settings.set_stop_bits(serial::Stop1);
            settings.set_flow_control(serial::FlowNone);
            Ok(())
        })
        .map_err(|e| Error::Transport(e.to_string()))?;
        port.set_timeout(self.timeout)
            .map_err(|e| Error::Transport(e.to_string()))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| Error::Transport("serial port not open".to_string()))?;
        debug!("serial write {:02x?}", bytes);
        port.write_all(bytes)?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| Error::Transport("serial port not open".to_string()))?;
        read_port(port, terminator)
    }

    fn read_until_deadline(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>> {
        let configured = self.timeout;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| Error::Transport("serial port not open".to_string()))?;
        port.set_timeout(timeout)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let read = read_port(port, terminator);
        port.set_timeout(configured)
            .map_err(|e| Error::Transport(e.to_string()))?;
        read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_strips_nul_padding() {
        let mut buf = Vec::new();
        let done = accumulate(&mut buf, b"(92931\x00\x00\x00", CR);
        assert!(!done);
        assert_eq!(buf, b"(92931");
    }

    #[test]
    fn accumulate_stops_at_terminator() {
        let mut buf = Vec::new();
        let done = accumulate(&mut buf, b"(ACK\x9a\x0b\r\x00\x00trailing", CR);
        assert!(done);
        assert_eq!(buf, b"(ACK\x9a\x0b\r");
    }

    #[test]
    fn accumulate_spans_reports() {
        let mut buf = Vec::new();
        assert!(!accumulate(&mut buf, b"(230.0 49.9\x00\x00", CR));
        assert!(accumulate(&mut buf, b" 010\xaa\xbb\r", CR));
        assert_eq!(buf, b"(230.0 49.9 010\xaa\xbb\r");
    }
}
