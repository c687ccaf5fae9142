//! UCS-2 text codec and GSM segmentation.
//!
//! With `AT+CSCS="UCS2"` active, GSM text mode carries both phone numbers and
//! message bodies as UTF-16 big-endian code units rendered as lowercase hex
//! with no separators. This module converts between Rust strings and that wire
//! form, and splits oversized bodies into concatenation-sized pieces.

use thiserror::Error;

/// Longest ASCII body that still fits one SMS.
pub const SINGLE_ASCII_LIMIT: usize = 160;
/// ASCII capacity per segment of a concatenated message (UDH costs 7 septets).
pub const CONCAT_ASCII_LIMIT: usize = 153;
/// Longest UCS-2 body that still fits one SMS.
pub const SINGLE_UCS2_LIMIT: usize = 70;
/// UCS-2 capacity per segment of a concatenated message.
pub const CONCAT_UCS2_LIMIT: usize = 67;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("hex length {0} is not a multiple of 4")]
    UnevenLength(usize),
    #[error("invalid hex digits at offset {0}")]
    InvalidHex(usize),
    #[error("unpaired UTF-16 surrogate 0x{0:04x}")]
    LoneSurrogate(u16),
}

/// True iff every scalar in `s` is ≤ U+007F.
pub fn is_ascii_text(s: &str) -> bool {
    s.chars().all(|c| (c as u32) <= 0x7F)
}

/// Encode `s` as UTF-16 BE code units in lowercase hex. Every code unit yields
/// exactly four hex digits; scalars above the BMP yield eight (a surrogate pair).
pub fn ucs2_hex_encode(s: &str) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(s.len() * 4);
    for unit in s.encode_utf16() {
        let _ = write!(&mut out, "{:04x}", unit);
    }
    out
}

/// Inverse of [`ucs2_hex_encode`]. Input length must be a multiple of 4;
/// surrogate pairs are reassembled into their scalar.
pub fn ucs2_hex_decode(hex: &str) -> Result<String, CodecError> {
    if hex.len() % 4 != 0 {
        return Err(CodecError::UnevenLength(hex.len()));
    }
    let mut units = Vec::with_capacity(hex.len() / 4);
    for (i, chunk) in hex.as_bytes().chunks(4).enumerate() {
        let digits =
            std::str::from_utf8(chunk).map_err(|_| CodecError::InvalidHex(i * 4))?;
        let unit =
            u16::from_str_radix(digits, 16).map_err(|_| CodecError::InvalidHex(i * 4))?;
        units.push(unit);
    }
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|e| CodecError::LoneSurrogate(e.unpaired_surrogate()))
}

/// Split `s` into pieces of at most `n` Unicode scalars, preserving order.
/// Concatenating the pieces reproduces `s` exactly.
pub fn segment(s: &str, n: usize) -> Vec<String> {
    debug_assert!(n > 0);
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in s.chars() {
        current.push(ch);
        count += 1;
        if count == n {
            parts.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Single-segment scalar budget for `body` given its encoding class.
pub fn single_segment_limit(body: &str) -> usize {
    if is_ascii_text(body) {
        SINGLE_ASCII_LIMIT
    } else {
        SINGLE_UCS2_LIMIT
    }
}

/// Per-part scalar budget for a concatenated rendition of `body`.
pub fn concat_segment_limit(body: &str) -> usize {
    if is_ascii_text(body) {
        CONCAT_ASCII_LIMIT
    } else {
        CONCAT_UCS2_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_classification() {
        assert!(is_ascii_text("hello +15551234567"));
        assert!(!is_ascii_text("héllo"));
        assert!(!is_ascii_text("日本語"));
    }

    #[test]
    fn encode_ascii() {
        assert_eq!(ucs2_hex_encode("hello"), "00680065006c006c006f");
        assert_eq!(ucs2_hex_encode("+1"), "002b0031");
    }

    #[test]
    fn encode_bmp_and_surrogates() {
        // BMP scalar: one code unit, four digits
        assert_eq!(ucs2_hex_encode("日"), "65e5");
        // Non-BMP scalar: surrogate pair, eight digits
        assert_eq!(ucs2_hex_encode("😀"), "d83dde00");
    }

    #[test]
    fn roundtrip_ascii() {
        for s in ["", "a", "hello world", "+15551234567"] {
            assert_eq!(ucs2_hex_decode(&ucs2_hex_encode(s)).unwrap(), s);
        }
    }

    #[test]
    fn roundtrip_surrogate_pairs() {
        let s = "mixed 😀 text 🚀 here";
        assert_eq!(ucs2_hex_decode(&ucs2_hex_encode(s)).unwrap(), s);
    }

    #[test]
    fn decode_rejects_uneven_length() {
        assert_eq!(ucs2_hex_decode("0068006"), Err(CodecError::UnevenLength(7)));
    }

    #[test]
    fn decode_rejects_bad_digits() {
        assert_eq!(ucs2_hex_decode("00zz"), Err(CodecError::InvalidHex(0)));
    }

    #[test]
    fn decode_rejects_lone_surrogate() {
        assert_eq!(
            ucs2_hex_decode("d83d"),
            Err(CodecError::LoneSurrogate(0xd83d))
        );
    }

    #[test]
    fn segment_preserves_content() {
        let body: String = std::iter::repeat('x').take(400).collect();
        let parts = segment(&body, 153);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.chars().count() <= 153));
        assert_eq!(parts.concat(), body);
    }

    #[test]
    fn segment_exact_multiple() {
        let parts = segment("abcdef", 3);
        assert_eq!(parts, vec!["abc", "def"]);
    }

    #[test]
    fn segment_counts_scalars_not_bytes() {
        let body: String = std::iter::repeat('語').take(10).collect();
        let parts = segment(&body, 4);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].chars().count(), 2);
        assert_eq!(parts.concat(), body);
    }

    #[test]
    fn limits_follow_encoding_class() {
        assert_eq!(single_segment_limit("plain"), SINGLE_ASCII_LIMIT);
        assert_eq!(single_segment_limit("olá"), SINGLE_UCS2_LIMIT);
        assert_eq!(concat_segment_limit("plain"), CONCAT_ASCII_LIMIT);
        assert_eq!(concat_segment_limit("olá"), CONCAT_UCS2_LIMIT);
    }
}
