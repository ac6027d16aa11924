use std::fmt;

use super::error::{ClientError, Result};

/// One `code[-| ]text` line of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    pub is_last: bool,
    pub text: String,
}

impl ResponseLine {
    /// Parse a reply line with its line ending already removed.
    ///
    /// # Errors
    /// If the line does not start with three digits followed by a space, a
    /// dash or nothing at all.
    pub fn parse(line: &str) -> Result<Self> {
        let (code, rest) = line
            .split_at_checked(3)
            .ok_or_else(|| ClientError::ParseError(format!("Reply line too short: '{line}'")))?;

        if !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClientError::ParseError(format!(
                "Invalid reply code: '{code}'"
            )));
        }
        let code = code
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid reply code: '{code}'")))?;

        let mut chars = rest.chars();
        let is_last = match chars.next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator after reply code: '{c}'"
                )));
            }
        };

        Ok(Self {
            code,
            is_last,
            text: chars.as_str().to_string(),
        })
    }
}

/// A complete, possibly multiline, server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx: the server wants more, as after `DATA` or during `AUTH`.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// Parse the first complete reply at the front of `buffer`.
    ///
    /// Returns the reply and how many bytes it occupied, or `None` when the
    /// final line has not fully arrived yet. Both `\r\n` and a bare `\n`
    /// end a line.
    ///
    /// # Errors
    /// If a line is malformed, is not UTF-8, or the lines of a multiline
    /// reply disagree on the code.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let line = ResponseLine::parse(std::str::from_utf8(raw)?)?;
            match code {
                Some(expected) if expected != line.code => {
                    return Err(ClientError::ParseError(format!(
                        "Reply code changed mid-reply: expected {expected}, got {}",
                        line.code
                    )));
                }
                Some(_) => {}
                None => code = Some(line.code),
            }

            lines.push(line.text);

            if line.is_last {
                return Ok(Some((Self::new(line.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Response, ResponseLine};

    #[test]
    fn single_line() {
        assert_eq!(
            ResponseLine::parse("220 mx.example.com ESMTP").unwrap(),
            ResponseLine {
                code: 220,
                is_last: true,
                text: String::from("mx.example.com ESMTP"),
            }
        );
    }

    #[test]
    fn bare_code() {
        let line = ResponseLine::parse("250").unwrap();
        assert!(line.is_last);
        assert!(line.text.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ResponseLine::parse("25").is_err());
        assert!(ResponseLine::parse("2x0 Ok").is_err());
        assert!(ResponseLine::parse("250_Ok").is_err());
    }

    #[test]
    fn multiline_reply() {
        let buffer = b"250-mx.example.com\r\n250-SIZE 1000\r\n250 HELP\r\n354 next";
        let (response, consumed) = Response::parse_response(buffer).unwrap().unwrap();

        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["mx.example.com", "SIZE 1000", "HELP"]);
        assert_eq!(&buffer[consumed..], b"354 next");
    }

    #[test]
    fn incomplete_reply_needs_more() {
        assert!(Response::parse_response(b"250-first\r\n250 sec").unwrap().is_none());
        assert!(Response::parse_response(b"").unwrap().is_none());
    }

    #[test]
    fn mismatched_codes_are_an_error() {
        assert!(Response::parse_response(b"250-a\r\n251 b\r\n").is_err());
    }

    #[test]
    fn classification() {
        assert!(Response::new(354, vec![]).is_intermediate());
        assert!(!Response::new(354, vec![]).is_success());
        assert!(Response::new(421, vec![]).is_temporary_error());
        assert!(Response::new(550, vec![]).is_permanent_error());
        assert!(!Response::new(250, vec![]).is_error());
    }
}
