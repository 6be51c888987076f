//! Streaming quoted-printable transfer encoding

use std::io;

use crate::message::source::{ByteSource, PushbackSource};

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Quoted-printable encoder over a byte source, RFC 2045 section 6.7
/// plus the mail-safety rules the DATA phase needs:
///
/// * a TAB or SPACE that would end up at the end of an output line is
///   hex-encoded,
/// * a `.` at the start of an output line is hex-encoded so user content
///   can never form the `<CRLF>.<CRLF>` terminator,
/// * CRLF pairs pass through; a bare LF passes through unless text mode
///   is on, which converts it to CRLF,
/// * a soft break `=\r\n` is inserted before an output line would grow
///   past `line_width` (0 disables folding).
pub struct QuotedPrintableEncoder {
    source: PushbackSource,
    line_width: usize,
    line_chars: usize,
    text_mode: bool,
    staged: Vec<u8>,
    staged_pos: usize,
    finished: bool,
}

impl QuotedPrintableEncoder {
    pub fn new(source: PushbackSource, line_width: usize) -> QuotedPrintableEncoder {
        QuotedPrintableEncoder {
            source,
            line_width,
            line_chars: 0,
            text_mode: false,
            staged: Vec::new(),
            staged_pos: 0,
            finished: false,
        }
    }

    /// Convert bare LF to CRLF on the way through
    pub fn text_mode(mut self, enabled: bool) -> QuotedPrintableEncoder {
        self.text_mode = enabled;
        self
    }

    pub fn into_inner(self) -> PushbackSource {
        self.source
    }

    fn soft_break_if_needed(&mut self, printable: bool) {
        // keep room for a trailing '=' so no line ever exceeds the width
        let cost = if printable { 2 } else { 4 };
        if self.line_width > 0 && self.line_chars + cost >= self.line_width {
            self.staged.extend_from_slice(b"=\r\n");
            self.line_chars = 0;
        }
    }

    fn emit_plain(&mut self, c: u8) {
        self.soft_break_if_needed(true);
        self.staged.push(c);
        self.line_chars += 1;
    }

    fn emit_encoded(&mut self, c: u8) {
        self.soft_break_if_needed(false);
        self.staged.push(b'=');
        self.staged.push(HEX[(c >> 4) as usize]);
        self.staged.push(HEX[(c & 0x0f) as usize]);
        self.line_chars += 3;
    }

    fn emit_line_break(&mut self) {
        self.staged.extend_from_slice(b"\r\n");
        self.line_chars = 0;
    }

    /// Encode the next input token into the staging buffer. Returns
    /// false once the source is exhausted.
    fn produce(&mut self) -> io::Result<bool> {
        let c = match self.source.get()? {
            Some(c) => c,
            None => {
                self.finished = true;
                return Ok(false);
            }
        };

        // CRLF passes through untouched
        if c == b'\r' {
            match self.source.get()? {
                Some(b'\n') => {
                    self.emit_line_break();
                    return Ok(true);
                }
                Some(other) => self.source.unget(other),
                None => {}
            }
        } else if c == b'\n' {
            if self.text_mode {
                self.emit_line_break();
            } else {
                self.staged.push(b'\n');
                self.line_chars = 0;
            }
            return Ok(true);
        }

        let mut force_encoding = false;

        // whitespace that would end an output line must be encoded
        if c == b'\t' || c == b' ' {
            let ahead = self.source.peek(2)?;
            force_encoding = ahead.is_empty()
                || ahead[0] == b'\n'
                || ahead == b"\r\n";
        }

        // a dot opening a line could fake the DATA terminator
        if self.line_chars == 0 && c == b'.' {
            force_encoding = true;
        }

        let printable = !force_encoding
            && ((33..=60).contains(&c) || (62..=126).contains(&c) || c == b'\t' || c == b' ');

        if printable {
            self.emit_plain(c);
        } else {
            self.emit_encoded(c);
        }
        Ok(true)
    }
}

impl ByteSource for QuotedPrintableEncoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        loop {
            while written < buf.len() && self.staged_pos < self.staged.len() {
                buf[written] = self.staged[self.staged_pos];
                written += 1;
                self.staged_pos += 1;
            }
            if self.staged_pos >= self.staged.len() {
                self.staged.clear();
                self.staged_pos = 0;
            }
            if written == buf.len() || self.finished {
                break;
            }
            if !self.produce()? {
                break;
            }
        }
        Ok(written)
    }

    fn at_end(&self) -> bool {
        self.finished && self.staged_pos >= self.staged.len()
    }

    fn is_sequential(&self) -> bool {
        true
    }

    fn len_hint(&self) -> Option<u64> {
        // worst case every byte encodes to three octets plus soft breaks
        self.source.len_hint().map(|n| {
            let encoded = n * 3;
            let folds = if self.line_width > 0 {
                encoded / self.line_width as u64 * 3
            } else {
                0
            };
            encoded + folds + (self.staged.len() - self.staged_pos) as u64
        })
    }

    fn close(&mut self) {
        self.staged.clear();
        self.staged_pos = 0;
        self.source.close();
    }
}
