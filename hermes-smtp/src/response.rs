use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use hermes_common::status::Status;

/// A reply sent by the server, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub lines: Vec<Cow<'static, str>>,
}

impl Response {
    #[must_use]
    pub fn new(status: Status, line: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            lines: vec![line.into()],
        }
    }

    #[must_use]
    pub fn multiline(status: Status, lines: Vec<Cow<'static, str>>) -> Self {
        Self { status, lines }
    }

    /// The first line of text, mostly useful in tests.
    #[must_use]
    pub fn text(&self) -> &str {
        self.lines.first().map_or("", AsRef::as_ref)
    }
}

impl Display for Response {
    /// Renders without the final CRLF.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);

        if self.lines.is_empty() {
            return write!(f, "{}", self.status);
        }

        for (idx, line) in self.lines.iter().enumerate() {
            if idx == last {
                write!(f, "{} {line}", self.status)?;
            } else {
                write!(f, "{}-{line}\r\n", self.status)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hermes_common::status::Status;

    use super::Response;

    #[test]
    fn single_line() {
        assert_eq!(Response::new(Status::Ok, "Ok").to_string(), "250 Ok");
    }

    #[test]
    fn multi_line_uses_continuation_marker() {
        let response = Response::multiline(
            Status::Ok,
            vec!["mx.test greets client".into(), "SIZE 10".into(), "HELP".into()],
        );

        assert_eq!(
            response.to_string(),
            "250-mx.test greets client\r\n250-SIZE 10\r\n250 HELP"
        );
    }
}
