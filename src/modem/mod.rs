//! # GSM Modem Driver
//!
//! Request/response AT state machine over an 8-N-1 serial line. One driver
//! instance owns one port and is in turn owned by exactly one device worker:
//! the AT dialect is strictly half-duplex on a shared line, so the driver's
//! methods take `&mut self` and are never re-entrant.
//!
//! Outbound messages go through [`ModemDriver::send_sms`], which picks the
//! data-coding scheme from the body's encoding class, and falls back to
//! concatenated submission (`AT^SCMS`) when the body exceeds the
//! single-segment budget. Inbound messages are listed with `AT+CMGL="ALL"`,
//! decoded from UCS-2 hex, and deleted from modem storage as they are read.
//!
//! ## Example
//!
//! ```rust,no_run
//! use smsgate::modem::ModemDriver;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut driver = ModemDriver::new("/dev/ttyUSB0", 115200, "modem0");
//!     driver.connect().await?;
//!     let outcome = driver.send_sms("+15551234567", "hello").await;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod parser;
pub mod transport;

use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::sleep;

use crate::logutil::escape_at;
use codec::{concat_segment_limit, is_ascii_text, single_segment_limit, ucs2_hex_encode};
use transport::{AtTransport, SerialLink};

/// End-of-message byte for the CMGS prompt protocol.
pub const CTRL_Z: u8 = 0x1A;

/// Pause after each acknowledged command. Some modems accept the next byte
/// before their parser state is clear.
const COMMAND_PAUSE: Duration = Duration::from_millis(100);

/// Commands sent on connect, each awaiting OK/ERROR. An ERROR is logged but
/// does not abort initialization.
const INIT_SEQUENCE: &[(&str, &str)] = &[
    ("ATE0\r\n", "echo off"),
    ("AT+CMEE=1\r\n", "verbose errors"),
    ("AT+WIND=0\r\n", "suppress unsolicited events"),
    ("AT+CMGF=1\r\n", "text mode"),
    ("AT+CSCS=\"UCS2\"\r\n", "UCS-2 character set"),
    ("AT+CPMS=\"MT\"\r\n", "SIM + device storage"),
];

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("serial port {port}: {detail}")]
    Port { port: String, detail: String },
    #[error("modem not connected")]
    NotConnected,
    #[error("expected one of {expected:?}, got {partial:?}")]
    PatternNotFound {
        expected: Vec<String>,
        partial: String,
    },
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a send attempt, as the dispatch layer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Modem acknowledged with OK.
    Sent,
    /// No usable response (read timeout or transport hiccup); safe to retry.
    TimedOut,
    /// Modem answered ERROR.
    Rejected,
}

/// Driver for one GSM modem on one serial port.
pub struct ModemDriver {
    port_name: String,
    baud: u32,
    device_id: String,
    link: Option<Box<dyn AtTransport>>,
}

impl ModemDriver {
    pub fn new(port_name: &str, baud: u32, device_id: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud,
            device_id: device_id.to_string(),
            link: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Open the serial port and run the initialization sequence.
    pub async fn connect(&mut self) -> Result<(), ModemError> {
        info!(
            "[{}] connecting to {} at {} baud",
            self.device_id, self.port_name, self.baud
        );
        let link = SerialLink::open(&self.port_name, self.baud)?;
        self.link = Some(Box::new(link));
        self.init_modem().await;
        Ok(())
    }

    /// Attach an already-open link instead of a serial port. The caller is
    /// responsible for running [`ModemDriver::init_modem`] if the peer
    /// expects it.
    pub fn attach(&mut self, link: Box<dyn AtTransport>) {
        self.link = Some(link);
    }

    /// Best-effort modem setup: echo off, verbose errors, no unsolicited
    /// events, text mode, UCS-2, combined SIM + device storage.
    pub async fn init_modem(&mut self) {
        for (command, what) in INIT_SEQUENCE {
            match self.send_command(command, true).await {
                Ok(output) if output.contains("ERROR") => {
                    warn!(
                        "[{}] init '{}' ({}) answered ERROR",
                        self.device_id,
                        command.trim_end(),
                        what
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "[{}] init '{}' ({}) failed: {}",
                        self.device_id,
                        command.trim_end(),
                        what,
                        e
                    );
                }
            }
        }
    }

    /// Write `command` verbatim. With `wait_for_ok` the call blocks for an
    /// `OK`/`ERROR` terminator and returns the full response buffer, then
    /// pauses briefly before the next command may be issued.
    pub async fn send_command(
        &mut self,
        command: &str,
        wait_for_ok: bool,
    ) -> Result<String, ModemError> {
        self.send_raw(command.as_bytes())?;
        if !wait_for_ok {
            return Ok(String::new());
        }
        let result = self.expect(&["OK\r\n", "ERROR\r\n"]);
        sleep(COMMAND_PAUSE).await;
        result.map(|(output, _)| output)
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<(), ModemError> {
        let link = self.link.as_mut().ok_or(ModemError::NotConnected)?;
        debug!(
            "[{}] send: {}",
            self.device_id,
            escape_at(&String::from_utf8_lossy(data))
        );
        link.write_all(data)?;
        Ok(())
    }

    /// Read until the accumulated buffer contains one of `patterns`, returning
    /// the buffer and the matched pattern. A read error (including the 5-s
    /// port timeout) fails the exchange with the partial buffer attached.
    fn expect(&mut self, patterns: &[&str]) -> Result<(String, String), ModemError> {
        let link = self.link.as_mut().ok_or(ModemError::NotConnected)?;
        let mut buf = [0u8; 128];
        let mut output = String::new();
        loop {
            let read = link.read_chunk(&mut buf);
            if let Ok(n) = read {
                output.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            for pattern in patterns {
                if output.contains(pattern) {
                    debug!(
                        "[{}] expect {:?}: got {}",
                        self.device_id,
                        patterns,
                        escape_at(&output)
                    );
                    return Ok((output, pattern.to_string()));
                }
            }
            match read {
                Ok(n) if n > 0 => continue,
                _ => {
                    debug!(
                        "[{}] expect {:?}: no match in {}",
                        self.device_id,
                        patterns,
                        escape_at(&output)
                    );
                    return Err(ModemError::PatternNotFound {
                        expected: patterns.iter().map(|p| p.to_string()).collect(),
                        partial: output,
                    });
                }
            }
        }
    }

    /// Send one SMS, transparently switching to concatenated submission when
    /// the body exceeds the single-segment budget for its encoding class.
    pub async fn send_sms(&mut self, mobile: &str, body: &str) -> SendOutcome {
        info!(
            "[{}] send_sms to {} ({} scalars)",
            self.device_id,
            mobile,
            body.chars().count()
        );

        // DCS 0 = GSM 7-bit, DCS 8 = UCS-2
        let csmp = if is_ascii_text(body) {
            "AT+CSMP=17,167,0,0\r\n"
        } else {
            "AT+CSMP=17,167,0,8\r\n"
        };
        if let Err(e) = self.send_command(csmp, true).await {
            warn!("[{}] CSMP setup failed: {}", self.device_id, e);
            return SendOutcome::TimedOut;
        }

        if body.chars().count() > single_segment_limit(body) {
            self.send_concatenated(mobile, body).await
        } else {
            self.send_single(mobile, body).await
        }
    }

    async fn send_single(&mut self, mobile: &str, body: &str) -> SendOutcome {
        let mobile_hex = ucs2_hex_encode(mobile);
        let body_hex = ucs2_hex_encode(body);

        // Prompt line takes a bare CR; a trailing LF would abort the prompt.
        let header = format!("AT+CMGS=\"{}\"\r", mobile_hex);
        if let Err(e) = self.send_raw(header.as_bytes()) {
            warn!("[{}] CMGS write failed: {}", self.device_id, e);
            return SendOutcome::TimedOut;
        }
        let _ = self.expect(&[">"]);
        sleep(COMMAND_PAUSE).await;

        let mut payload = body_hex.into_bytes();
        payload.push(CTRL_Z);
        if let Err(e) = self.send_raw(&payload) {
            warn!("[{}] body write failed: {}", self.device_id, e);
            return SendOutcome::TimedOut;
        }

        let result = self.expect(&["OK\r\n", "ERROR\r\n"]);
        sleep(COMMAND_PAUSE).await;
        match result {
            Ok((_, matched)) if matched == "OK\r\n" => SendOutcome::Sent,
            Ok((output, _)) => {
                warn!(
                    "[{}] modem rejected message: {}",
                    self.device_id,
                    escape_at(&output)
                );
                SendOutcome::Rejected
            }
            Err(e) => {
                warn!("[{}] no response to message body: {}", self.device_id, e);
                SendOutcome::TimedOut
            }
        }
    }

    /// Concatenated submission: every part shares one random reference byte
    /// and carries its 1-based index and the total count. The first ERROR
    /// aborts the sequence; the upper layers re-enqueue the whole message.
    async fn send_concatenated(&mut self, mobile: &str, body: &str) -> SendOutcome {
        let parts = codec::segment(body, concat_segment_limit(body));
        let total = parts.len();
        let reference: u8 = rand::random();
        let mobile_hex = ucs2_hex_encode(mobile);
        info!(
            "[{}] concatenated send: {} parts, ref {}",
            self.device_id, total, reference
        );

        for (i, part) in parts.iter().enumerate() {
            let header = format!(
                "AT^SCMS={},145,{},{},8,{}\r",
                mobile_hex,
                i + 1,
                total,
                reference
            );
            if let Err(e) = self.send_raw(header.as_bytes()) {
                warn!("[{}] SCMS write failed: {}", self.device_id, e);
                return SendOutcome::TimedOut;
            }
            let _ = self.expect(&[">"]);
            sleep(COMMAND_PAUSE).await;

            let mut payload = ucs2_hex_encode(part).into_bytes();
            payload.push(CTRL_Z);
            if let Err(e) = self.send_raw(&payload) {
                warn!("[{}] part {}/{} write failed: {}", self.device_id, i + 1, total, e);
                return SendOutcome::TimedOut;
            }

            let result = self.expect(&["OK\r\n", "ERROR\r\n"]);
            sleep(COMMAND_PAUSE).await;
            match result {
                Ok((_, matched)) if matched == "OK\r\n" => {}
                Ok((output, _)) => {
                    warn!(
                        "[{}] part {}/{} rejected: {}",
                        self.device_id,
                        i + 1,
                        total,
                        escape_at(&output)
                    );
                    return SendOutcome::Rejected;
                }
                Err(e) => {
                    warn!(
                        "[{}] part {}/{} unanswered: {}",
                        self.device_id,
                        i + 1,
                        total,
                        e
                    );
                    return SendOutcome::Rejected;
                }
            }
        }
        SendOutcome::Sent
    }

    /// List all stored messages, decode them, and delete them from modem
    /// storage. Records that fail to decode are dropped with a warning but
    /// still deleted, otherwise they would be re-read on every poll.
    pub async fn read_sms(&mut self) -> Vec<(String, String)> {
        let output = match self.send_command("AT+CMGL=\"ALL\"\r\n", true).await {
            Ok(output) => output,
            Err(ModemError::PatternNotFound { partial, .. }) => {
                debug!(
                    "[{}] CMGL listing unterminated; parsing partial buffer",
                    self.device_id
                );
                partial
            }
            Err(e) => {
                warn!("[{}] CMGL listing failed: {}", self.device_id, e);
                return Vec::new();
            }
        };

        let records = parser::parse_cmgl(&output);
        let mut messages = Vec::with_capacity(records.len());
        for record in &records {
            match record.decode() {
                Ok((sender, body)) => {
                    info!(
                        "[{}] incoming message {} from {}",
                        self.device_id, record.index, sender
                    );
                    messages.push((sender, body));
                }
                Err(e) => {
                    warn!(
                        "[{}] dropping undecodable record {}: {}",
                        self.device_id, record.index, e
                    );
                }
            }
            if let Err(e) = self.delete_sms(record.index).await {
                warn!(
                    "[{}] failed to delete record {}: {}",
                    self.device_id, record.index, e
                );
            }
        }
        messages
    }

    /// Delete one stored message by listing index.
    pub async fn delete_sms(&mut self, index: u32) -> Result<String, ModemError> {
        self.send_command(&format!("AT+CMGD={}\r\n", index), true).await
    }
}
