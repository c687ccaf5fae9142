//! Test utilities & fixtures.
//! Provides a scripted AT link standing in for a serial-attached GSM modem.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use smsgate::modem::transport::AtTransport;
use smsgate::modem::CTRL_Z;

/// Reply the scripted modem gives after receiving a message body.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)] // not every test file uses every ack kind
pub enum BodyAck {
    Ok,
    Error,
    /// Answer nothing; the driver's expect runs into the read timeout.
    Silence,
}

/// Reactive modem double. Replies are derived from the command just written:
/// `AT+CMGS`/`AT^SCMS` get the `>` prompt, message bodies consume the scripted
/// ack list (defaulting to OK), `AT+CMGL` serves the next queued listing, and
/// everything else is acknowledged with OK. With `mute` set the link answers
/// nothing beyond bytes preloaded via [`ScriptedLink::push_read`].
pub struct ScriptedLink {
    pending: VecDeque<u8>,
    body_acks: VecDeque<BodyAck>,
    listings: VecDeque<String>,
    mute: bool,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// Shared view of everything written to a [`ScriptedLink`].
pub struct LinkProbe {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl LinkProbe {
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }
}

#[allow(dead_code)] // helpers are shared across independent test binaries
impl ScriptedLink {
    pub fn new() -> (Self, LinkProbe) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                pending: VecDeque::new(),
                body_acks: VecDeque::new(),
                listings: VecDeque::new(),
                mute: false,
                writes: Arc::clone(&writes),
            },
            LinkProbe { writes },
        )
    }

    /// A link that scripts the acks for successive message bodies.
    pub fn with_body_acks(acks: Vec<BodyAck>) -> (Self, LinkProbe) {
        let (mut link, probe) = Self::new();
        link.body_acks = acks.into();
        (link, probe)
    }

    /// A link that never answers on its own.
    pub fn muted() -> (Self, LinkProbe) {
        let (mut link, probe) = Self::new();
        link.mute = true;
        (link, probe)
    }

    /// Queue a `+CMGL` listing body (served before the terminating OK).
    pub fn push_listing(&mut self, listing: &str) {
        self.listings.push_back(listing.to_string());
    }

    /// Preload raw bytes for the next reads.
    pub fn push_read(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes);
    }

    fn queue(&mut self, text: &str) {
        self.pending.extend(text.as_bytes());
    }
}

impl AtTransport for ScriptedLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "scripted read timeout",
            ));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writes.lock().unwrap().push(data.to_vec());
        if self.mute {
            return Ok(());
        }

        let text = String::from_utf8_lossy(data).into_owned();
        if data.last() == Some(&CTRL_Z) {
            match self.body_acks.pop_front().unwrap_or(BodyAck::Ok) {
                BodyAck::Ok => self.queue("\r\nOK\r\n"),
                BodyAck::Error => self.queue("\r\nERROR\r\n"),
                BodyAck::Silence => {}
            }
        } else if text.starts_with("AT+CMGS") || text.starts_with("AT^SCMS") {
            self.queue("\r\n> ");
        } else if text.starts_with("AT+CMGL") {
            let listing = self.listings.pop_front().unwrap_or_default();
            let response = format!("\r\n{}OK\r\n", listing);
            self.queue(&response);
        } else {
            self.queue("\r\nOK\r\n");
        }
        Ok(())
    }
}

/// One `+CMGL` record in wire form, fields already UCS-2 hex encoded.
#[allow(dead_code)]
pub fn cmgl_record(index: u32, sender_hex: &str, body_hex: &str) -> String {
    format!(
        "+CMGL: {},\"REC UNREAD\",\"{}\",,\"24/05/01,10:30:00+08\"\r\n{}\r\n",
        index, sender_hex, body_hex
    )
}
