//! Small RFC helpers shared by the message model and the renderer:
//! address syntax validation (RFC 5322 addr-spec), date formatting
//! (RFC 2822) and encoded-words production (RFC 2047).

use chrono::{DateTime, Utc};

/// `atext` as defined in RFC 5322 section 3.2.3.
fn is_atext(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'|'
                | b'}'
                | b'~'
        )
}

/// A `dot-atom`: one or more `atext` runs separated by single dots.
fn is_dot_atom(s: &[u8]) -> bool {
    if s.is_empty() {
        return false;
    }
    let mut last_was_dot = true;
    for &c in s {
        if c == b'.' {
            if last_was_dot {
                return false;
            }
            last_was_dot = true;
        } else if is_atext(c) {
            last_was_dot = false;
        } else {
            return false;
        }
    }
    !last_was_dot
}

/// Quoted-string form of a local part, e.g. `"john doe"@example.org`.
fn is_quoted_string(s: &[u8]) -> bool {
    if s.len() < 2 || s[0] != b'"' || s[s.len() - 1] != b'"' {
        return false;
    }
    let mut quoted = false;
    for &c in &s[1..s.len() - 1] {
        if quoted {
            quoted = false;
        } else if c == b'\\' {
            quoted = true;
        } else if c == b'"' || c == b'\r' || c == b'\n' {
            return false;
        } else if !(32..127).contains(&c) && c != b'\t' {
            return false;
        }
    }
    !quoted
}

/// Address literal domain, e.g. `[192.0.2.1]` or `[IPv6:::1]`.
fn is_domain_literal(s: &[u8]) -> bool {
    if s.len() < 3 || s[0] != b'[' || s[s.len() - 1] != b']' {
        return false;
    }
    s[1..s.len() - 1]
        .iter()
        .all(|&c| (33..127).contains(&c) && c != b'[' && c != b']' && c != b'\\')
}

/// Lexical validation of an RFC 5322 `addr-spec` (`local@domain`).
///
/// This is a syntax check only; no DNS or deliverability checks are made.
pub fn validate_addr_spec(addr: &str) -> bool {
    let bytes = addr.as_bytes();
    if !addr.is_ascii() {
        return false;
    }
    // the last '@' separates local part and domain; earlier ones may be
    // part of a quoted local part
    let at = match bytes.iter().rposition(|&c| c == b'@') {
        Some(pos) => pos,
        None => return false,
    };
    let (local, domain) = (&bytes[..at], &bytes[at + 1..]);
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    let local_ok = is_dot_atom(local) || is_quoted_string(local);
    let domain_ok = is_dot_atom(domain) || is_domain_literal(domain);
    local_ok && domain_ok
}

/// Characters permitted in an unencoded header word per RFC 2047.
fn is_plain_header_char(c: char) -> bool {
    (' '..='\u{7e}').contains(&c) && c != '=' || c == '\t'
}

/// Produce the RFC 2047 form of a header text. ASCII text without
/// encoded-word markers passes through unchanged, anything else becomes a
/// single B-encoded UTF-8 word.
pub fn to_encoded_words(text: &str) -> String {
    if text.chars().all(is_plain_header_char) {
        text.to_owned()
    } else {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        format!("=?utf-8?b?{}?=", STANDARD.encode(text.as_bytes()))
    }
}

/// Format a timestamp the way RFC 2822 section 3.3 wants it in `Date`
/// and `Content-Disposition` parameters.
pub fn rfc2822_date(date: DateTime<Utc>) -> String {
    date.to_rfc2822()
}
