//! SMTP reply parsing
//!
//! Server output is consumed line by line. A reply line is
//! `DDD[' '|'-']<text>`; the reply is complete once a line uses the
//! space separator. All lines of one reply must carry the same code.

use nom::{
    bytes::complete::take_while_m_n,
    character::complete::one_of,
    combinator::{map_res, opt, rest},
    sequence::tuple,
    IResult,
};

/// A complete SMTP reply: the status code and its text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    code: u16,
    lines: Vec<String>,
}

impl Response {
    #[cfg(test)]
    pub(crate) fn new(code: u16, lines: Vec<String>) -> Response {
        Response { code, lines }
    }

    /// The three-digit status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The text lines, without code or separators
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Text of the final reply line
    pub fn last_line(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    /// First whitespace-separated word of the first line
    pub fn first_word(&self) -> Option<&str> {
        self.lines
            .first()
            .and_then(|line| line.split_whitespace().next())
    }

    /// 2xx and 3xx replies
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.code)
    }

    /// 4xx and 5xx replies
    pub fn is_error(&self) -> bool {
        (400..600).contains(&self.code)
    }

    /// 4xx replies
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// 5xx replies
    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

/// A reply line the parser could not make sense of.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparseable server reply: {0:?}")]
pub struct ResponseParseError(pub String);

/// Accumulates reply lines until the space separator completes the
/// reply.
#[derive(Debug, Default)]
pub(crate) struct ResponseAccumulator {
    code: Option<u16>,
    lines: Vec<String>,
}

impl ResponseAccumulator {
    pub(crate) fn new() -> ResponseAccumulator {
        ResponseAccumulator::default()
    }

    /// Feed one line (CRLF already stripped). Returns the complete
    /// reply once the final line arrived.
    pub(crate) fn push_line(
        &mut self,
        line: &str,
    ) -> Result<Option<Response>, ResponseParseError> {
        let (code, separator, text) = match reply_line(line) {
            Ok((_, parts)) => parts,
            Err(_) => return Err(ResponseParseError(line.to_owned())),
        };
        // a line is exactly `DDD` or `DDD<sep><text>`
        if separator.is_none() && !text.is_empty() {
            return Err(ResponseParseError(line.to_owned()));
        }
        if *self.code.get_or_insert(code) != code {
            return Err(ResponseParseError(line.to_owned()));
        }
        self.lines.push(text.to_owned());

        match separator {
            Some('-') => Ok(None),
            _ => Ok(Some(Response {
                code,
                lines: std::mem::take(&mut self.lines),
            })),
        }
    }
}

fn reply_line(i: &str) -> IResult<&str, (u16, Option<char>, &str)> {
    let (i, (code, separator, text)) = tuple((
        map_res(
            take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
            |s: &str| s.parse::<u16>(),
        ),
        opt(one_of(" -")),
        rest,
    ))(i)?;
    Ok((i, (code, separator, text)))
}
