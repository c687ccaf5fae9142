//! Logging helpers for AT traffic. Serial exchanges are riddled with `\r\n`
//! terminators and control bytes that would otherwise split log lines.

/// Render an AT exchange on a single log line. The bytes that structure the
/// dialect get readable names: line terminators become `\r`/`\n` escapes and
/// the Ctrl-Z end-of-message byte of the CMGS prompt protocol is shown as
/// `^Z`. Any other unprintable byte is hex-escaped. Output is capped so a
/// concatenated UCS-2 body cannot flood the log.
pub fn escape_at(s: &str) -> String {
    const MAX_SCALARS: usize = 360;
    let mut out = String::new();
    let mut shown = 0;
    for ch in s.chars() {
        if shown == MAX_SCALARS {
            out.push('…');
            break;
        }
        shown += 1;
        match ch {
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\u{1A}' => out.push_str("^Z"),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => out.push_str(&format!("\\x{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::escape_at;

    #[test]
    fn escapes_line_terminators() {
        assert_eq!(escape_at("OK\r\n"), "OK\\r\\n");
    }

    #[test]
    fn names_the_ctrl_z_terminator() {
        let s = format!("00480069{}", char::from(26));
        assert_eq!(escape_at(&s), "00480069^Z");
    }

    #[test]
    fn hex_escapes_other_control_bytes() {
        assert_eq!(escape_at("\u{07}ok"), "\\x07ok");
    }

    #[test]
    fn caps_long_payloads() {
        let body: String = std::iter::repeat('0').take(500).collect();
        let escaped = escape_at(&body);
        assert!(escaped.ends_with('…'));
        assert_eq!(escaped.chars().count(), 361);
    }
}
