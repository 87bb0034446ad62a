// Serial transport for the arm firmware's JSON line protocol
//
// Writes go straight to the port from the caller's thread. A background
// reader splits incoming bytes into lines, decodes them and posts feedback
// snapshots into a single-slot mailbox, so feedback is never tied to the
// command that happened to be written last.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, trace, warn};

use super::mailbox::FeedbackMailbox;
use crate::config::{BAUD_RATE, PORT_SETTLE, READ_POLL};
use crate::error::{ArmError, Result};
use crate::messages::{Command, Feedback, Reply, decode_reply};

/// A command/feedback channel to the arm
///
/// Implementations are not re-entrant; the motion controller serialises all
/// access.
pub trait ArmLink: Send {
    /// Write one command, fully, or fail
    fn send(&mut self, command: &Command) -> Result<()>;

    /// Block up to `timeout` for the next feedback snapshot
    fn read_feedback(&mut self, timeout: Duration) -> Result<Feedback>;

    /// Drop any feedback received before this call
    fn clear_feedback(&mut self) {}
}

impl<L: ArmLink + ?Sized> ArmLink for Box<L> {
    fn send(&mut self, command: &Command) -> Result<()> {
        (**self).send(command)
    }

    fn read_feedback(&mut self, timeout: Duration) -> Result<Feedback> {
        (**self).read_feedback(timeout)
    }

    fn clear_feedback(&mut self) {
        (**self).clear_feedback()
    }
}

/// Arm connected over a USB-UART bridge
pub struct SerialLink {
    port_name: String,
    port: Box<dyn SerialPort>,
    mailbox: FeedbackMailbox,
    stop: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Open the port at the firmware's default baud rate
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, BAUD_RATE)
    }

    /// Open with a custom baud rate
    ///
    /// RTS and DTR are deasserted before anything is written; some bridges
    /// otherwise hold the ESP32 in reset or in its bootloader. After the settle
    /// delay a torque-lock command is written as a harmless first command.
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        info!("Opening arm link on {} @ {} baud", port_name, baudrate);
        let mut port = serialport::new(port_name, baudrate)
            .timeout(READ_POLL)
            .dtr_on_open(false)
            .open()?;
        port.write_request_to_send(false)?;
        port.write_data_terminal_ready(false)?;
        thread::sleep(PORT_SETTLE);
        port.clear(ClearBuffer::All)?;

        let mailbox = FeedbackMailbox::new();
        let stop = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_port = port.try_clone()?;
        let reader = {
            let mailbox = mailbox.clone();
            let stop = Arc::clone(&stop);
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("arm-feedback".to_string())
                .spawn(move || read_loop(reader_port, mailbox, stop, closed))?
        };

        let mut link = Self {
            port_name: port_name.to_string(),
            port,
            mailbox,
            stop,
            closed,
            reader: Some(reader),
        };
        link.send(&Command::TorqueLock { on: true })?;
        Ok(link)
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl ArmLink for SerialLink {
    fn send(&mut self, command: &Command) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ArmError::Transport(format!(
                "link to {} is closed",
                self.port_name
            )));
        }

        let line = command.to_line()?;
        debug!("-> {}", line.trim_end());
        self.port
            .write_all(line.as_bytes())
            .and_then(|()| self.port.flush())
            .map_err(|e| ArmError::Transport(format!("write to {} failed: {}", self.port_name, e)))
    }

    fn read_feedback(&mut self, timeout: Duration) -> Result<Feedback> {
        if self.closed.load(Ordering::Acquire) {
            if let Some(pending) = self.mailbox.take() {
                return pending;
            }
            return Err(ArmError::Transport(format!(
                "link to {} is closed",
                self.port_name
            )));
        }
        self.mailbox.wait(timeout)
    }

    fn clear_feedback(&mut self) {
        self.mailbox.clear();
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("Feedback reader for {} panicked", self.port_name);
            }
        }
        info!("Closed arm link on {}", self.port_name);
    }
}

fn read_loop(
    port: Box<dyn SerialPort>,
    mailbox: FeedbackMailbox,
    stop: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(port);
    let mut buf = Vec::new();

    while !stop.load(Ordering::Acquire) {
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                warn!("Serial port reached end of stream");
                break;
            }
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    handle_line(&String::from_utf8_lossy(&buf), &mailbox);
                    buf.clear();
                }
            }
            // Partial lines stay in `buf` until the rest arrives
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) => {
                warn!("Serial read failed: {}", e);
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
}

/// Route one received line; malformed objects are reported, never fatal
fn handle_line(line: &str, mailbox: &FeedbackMailbox) {
    match decode_reply(line) {
        Ok(Some(Reply::Feedback(feedback))) => {
            trace!("<- feedback {:?}", feedback);
            mailbox.post(feedback);
        }
        Ok(Some(Reply::Other(value))) => debug!("<- {}", value),
        Ok(None) => trace!("<- (non-JSON) {}", line.trim_end()),
        Err(e) => {
            warn!("{}", e);
            mailbox.post_malformed(e.to_string());
        }
    }
}
