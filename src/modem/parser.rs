//! Parser for `AT+CMGL="ALL"` listings.
//!
//! Each stored message is reported as a header line followed by the body in
//! UCS-2 hex on its own line:
//!
//! ```text
//! +CMGL: <index>,"<status>","<sender_hex>",<name>,"<timestamp>"
//! <body_hex>
//! ```
//!
//! The name field may be empty or quoted. Line endings tolerate a missing
//! `\r`. Bodies are hex-only by construction (`AT+CSCS="UCS2"`), which keeps
//! the record grammar single-line and unambiguous.

use std::sync::OnceLock;

use regex::Regex;

use super::codec::{self, CodecError};

/// One listed record, fields still in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmglRecord {
    pub index: u32,
    pub status: String,
    pub sender_hex: String,
    pub name: String,
    pub timestamp: String,
    pub body_hex: String,
}

impl CmglRecord {
    /// Decode the sender and body from UCS-2 hex.
    pub fn decode(&self) -> Result<(String, String), CodecError> {
        let sender = codec::ucs2_hex_decode(&self.sender_hex)?;
        let body = codec::ucs2_hex_decode(&self.body_hex)?;
        Ok((sender, body))
    }
}

fn cmgl_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"\+CMGL: (\d+),"(ALL|REC READ|REC UNREAD)","([0-9a-fA-F]+)",("[^"]*"|[^,]*),"([^"]+)"\r?\n([0-9a-fA-F]*)\r?\n"#,
        )
        .expect("CMGL record pattern")
    })
}

/// Extract every record from a raw `AT+CMGL` response, in listing order.
/// Unparseable stretches between records are skipped.
pub fn parse_cmgl(output: &str) -> Vec<CmglRecord> {
    cmgl_regex()
        .captures_iter(output)
        .map(|caps| CmglRecord {
            index: caps[1].parse().unwrap_or(0),
            status: caps[2].to_string(),
            sender_hex: caps[3].to_string(),
            name: caps[4].trim_matches('"').to_string(),
            timestamp: caps[5].to_string(),
            body_hex: caps[6].to_string(),
        })
        .collect()
}
