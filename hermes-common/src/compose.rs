//! Turns a send request into a wire-ready [`Message`].
//!
//! The caller supplies addresses and content; composition fills in
//! `Message-ID`, `Date` and the MIME structure. Blind copies become envelope
//! recipients only.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use mailparse::MailAddr;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    Address, Attachment, Domain, Headers, Message,
    address::AddressError,
    message::CRLF,
};

const BASE64_LINE: usize = 76;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("Invalid {field} address {value:?}: {reason}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("At least one of to, cc or bcc is required")]
    NoRecipients,

    #[error("Invalid {field} header: {reason}")]
    InvalidHeader { field: String, reason: &'static str },
}

/// A send request as received from the API layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboundEmail {
    /// `From` header; may carry a display name. Defaults to `noreply@<domain>`.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
    /// Extra headers appended verbatim.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

struct Part {
    headers: Headers,
    body: Vec<u8>,
}

impl Part {
    fn text(mime: &str, content: &str) -> Self {
        let normalised = normalise_line_endings(content);
        let mut headers = Headers::new();
        headers.append("Content-Type", format!("{mime}; charset=utf-8"));

        let body = if normalised.is_ascii() && max_line_length(&normalised) <= 998 {
            headers.append("Content-Transfer-Encoding", "7bit");
            normalised.into_bytes()
        } else {
            headers.append("Content-Transfer-Encoding", "base64");
            base64_lines(normalised.as_bytes())
        };

        Self { headers, body }
    }

    fn attachment(attachment: &Attachment) -> Self {
        let mut headers = Headers::new();
        headers.append(
            "Content-Type",
            format!("{}; name=\"{}\"", attachment.content_type, attachment.filename),
        );
        headers.append(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", attachment.filename),
        );
        headers.append("Content-Transfer-Encoding", "base64");

        Self {
            headers,
            body: base64_lines(&attachment.content),
        }
    }

    fn multipart(subtype: &str, parts: &[Self]) -> Self {
        let boundary = format!("=_hermes_{}", ulid::Ulid::new());
        let mut headers = Headers::new();
        headers.append(
            "Content-Type",
            format!("multipart/{subtype}; boundary=\"{boundary}\""),
        );

        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            part.headers.write_to(&mut body);
            body.extend_from_slice(CRLF);
            body.extend_from_slice(&part.body);
            if !part.body.ends_with(CRLF) {
                body.extend_from_slice(CRLF);
            }
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Self { headers, body }
    }
}

fn normalise_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn max_line_length(content: &str) -> usize {
    content.split("\r\n").map(str::len).max().unwrap_or(0)
}

fn base64_lines(bytes: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(bytes);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / BASE64_LINE * 2 + 2);

    for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
        out.extend_from_slice(chunk);
        out.extend_from_slice(CRLF);
    }

    out
}

/// Header values end up between CRLFs verbatim, so a line break in one
/// would start a new header or end the header block.
fn check_value(field: &str, value: &str) -> Result<(), ComposeError> {
    if value.contains(['\r', '\n']) {
        return Err(ComposeError::InvalidHeader {
            field: field.to_string(),
            reason: "line breaks are not allowed",
        });
    }

    Ok(())
}

/// RFC 5322 §2.2: printable ASCII other than `:`.
fn check_name(name: &str) -> Result<(), ComposeError> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic() && b != b':') {
        return Err(ComposeError::InvalidHeader {
            field: name.to_string(),
            reason: "name must be printable ASCII without ':'",
        });
    }

    Ok(())
}

/// Extract the addr-spec from a header-style address (`Name <a@b>` or `a@b`).
fn envelope_address(field: &'static str, value: &str) -> Result<Address, ComposeError> {
    let invalid = |reason: String| ComposeError::InvalidAddress {
        field,
        value: value.to_string(),
        reason,
    };

    let parsed = mailparse::addrparse(value).map_err(|e| invalid(e.to_string()))?;
    let addr = parsed
        .iter()
        .find_map(|addr| match addr {
            MailAddr::Single(single) => Some(single.addr.clone()),
            MailAddr::Group(group) => group.addrs.first().map(|s| s.addr.clone()),
        })
        .ok_or_else(|| invalid(AddressError::Empty.to_string()))?;

    addr.parse().map_err(|e: AddressError| invalid(e.to_string()))
}

impl OutboundEmail {
    ///
    /// Build the message, stamping identifiers for `domain`.
    ///
    /// # Errors
    ///
    /// If any address is malformed, a header value carries a line break, or
    /// there are no recipients at all.
    ///
    pub fn compose(&self, domain: &Domain) -> Result<Message, ComposeError> {
        self.check_headers()?;

        let from = self
            .from
            .clone()
            .unwrap_or_else(|| format!("noreply@{domain}"));
        let sender = envelope_address("from", &from)?;

        let mut recipients: Vec<Address> = Vec::new();
        for (field, list) in [("to", &self.to), ("cc", &self.cc), ("bcc", &self.bcc)] {
            for value in list {
                let address = envelope_address(field, value)?;
                if !recipients.contains(&address) {
                    recipients.push(address);
                }
            }
        }

        if recipients.is_empty() {
            return Err(ComposeError::NoRecipients);
        }

        let mut headers = Headers::new();
        headers.append("From", from);
        if !self.to.is_empty() {
            headers.append("To", self.to.join(", "));
        }
        if !self.cc.is_empty() {
            headers.append("Cc", self.cc.join(", "));
        }
        if let Some(reply_to) = &self.reply_to {
            headers.append("Reply-To", reply_to.clone());
        }
        headers.append("Subject", self.subject.clone());
        headers.append(
            "Date",
            Utc::now().format("%a, %d %b %Y %H:%M:%S +0000").to_string(),
        );
        headers.append("Message-ID", format!("<{}@{domain}>", ulid::Ulid::new()));
        headers.append("MIME-Version", "1.0");
        for (name, value) in &self.headers {
            headers.append(name.as_str(), value.clone());
        }

        let body = self.body_part();
        for (name, value) in body.headers.iter() {
            headers.append(name, value);
        }

        Ok(
            Message::new(sender, recipients, headers, body.body)
                .map_err(|_| ComposeError::NoRecipients)?
                .with_attachments(self.attachments.clone()),
        )
    }

    fn check_headers(&self) -> Result<(), ComposeError> {
        if let Some(from) = &self.from {
            check_value("from", from)?;
        }
        if let Some(reply_to) = &self.reply_to {
            check_value("reply_to", reply_to)?;
        }
        check_value("subject", &self.subject)?;

        for (field, list) in [("to", &self.to), ("cc", &self.cc), ("bcc", &self.bcc)] {
            for value in list {
                check_value(field, value)?;
            }
        }

        for (name, value) in &self.headers {
            check_name(name)?;
            check_value(name, value)?;
        }

        for attachment in &self.attachments {
            check_value("attachment filename", &attachment.filename)?;
            check_value("attachment content type", &attachment.content_type)?;
        }

        Ok(())
    }

    fn body_part(&self) -> Part {
        let content = match (&self.text, &self.html) {
            (Some(text), Some(html)) => Part::multipart(
                "alternative",
                &[Part::text("text/plain", text), Part::text("text/html", html)],
            ),
            (None, Some(html)) => Part::text("text/html", html),
            (Some(text), None) => Part::text("text/plain", text),
            (None, None) => Part::text("text/plain", ""),
        };

        if self.attachments.is_empty() {
            return content;
        }

        let parts = std::iter::once(content)
            .chain(self.attachments.iter().map(Part::attachment))
            .collect::<Vec<_>>();
        Part::multipart("mixed", &parts)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn domain() -> Domain {
        Domain::new("example.com")
    }

    #[test]
    fn compose_plain_text() {
        let email = OutboundEmail {
            from: Some("Sender <sender@example.com>".to_string()),
            to: vec!["rcpt@example.test".to_string()],
            subject: "Greetings".to_string(),
            text: Some("line one\nline two".to_string()),
            ..OutboundEmail::default()
        };

        let message = email.compose(&domain()).unwrap();

        assert_eq!(message.sender().to_string(), "sender@example.com");
        assert_eq!(message.headers().get("From"), Some("Sender <sender@example.com>"));
        assert_eq!(message.subject(), Some("Greetings"));
        assert_eq!(message.body(), b"line one\r\nline two");
        assert_eq!(
            message.headers().get("Content-Type"),
            Some("text/plain; charset=utf-8")
        );
        assert!(message.message_id().unwrap().ends_with("@example.com"));
        assert!(message.headers().get("Date").unwrap().ends_with("+0000"));
    }

    #[test]
    fn bcc_is_envelope_only() {
        let email = OutboundEmail {
            to: vec!["a@one.test".to_string()],
            cc: vec!["b@two.test".to_string()],
            bcc: vec!["c@three.test".to_string(), "a@one.test".to_string()],
            text: Some("hi".to_string()),
            ..OutboundEmail::default()
        };

        let message = email.compose(&domain()).unwrap();

        assert_eq!(
            message
                .recipients()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec!["a@one.test", "b@two.test", "c@three.test"]
        );
        assert_eq!(message.headers().get("Cc"), Some("b@two.test"));
        assert!(!message.headers().contains("Bcc"));
        assert_eq!(message.sender().to_string(), "noreply@example.com");
    }

    #[test]
    fn alternative_with_attachment() {
        let email = OutboundEmail {
            to: vec!["a@one.test".to_string()],
            text: Some("plain".to_string()),
            html: Some("<b>rich</b>".to_string()),
            attachments: vec![Attachment {
                filename: "report.csv".to_string(),
                content_type: "text/csv".to_string(),
                content: b"a,b\n1,2\n".to_vec(),
            }],
            ..OutboundEmail::default()
        };

        let message = email.compose(&domain()).unwrap();
        assert!(
            message
                .headers()
                .get("Content-Type")
                .unwrap()
                .starts_with("multipart/mixed")
        );

        let reparsed = Message::from_raw(
            Some(message.sender().clone()),
            message.recipients().to_vec(),
            &message.to_bytes(),
        )
        .unwrap();

        let content = reparsed.content();
        assert_eq!(content.text.as_deref().map(str::trim), Some("plain"));
        assert_eq!(content.html.as_deref().map(str::trim), Some("<b>rich</b>"));
        assert_eq!(reparsed.attachments()[0].filename, "report.csv");
        assert_eq!(reparsed.attachments()[0].content, b"a,b\n1,2\n".to_vec());
    }

    #[test]
    fn non_ascii_text_is_base64() {
        let email = OutboundEmail {
            to: vec!["a@one.test".to_string()],
            text: Some("héllo".to_string()),
            ..OutboundEmail::default()
        };

        let message = email.compose(&domain()).unwrap();
        assert_eq!(
            message.headers().get("Content-Transfer-Encoding"),
            Some("base64")
        );
        assert_eq!(message.content().text.as_deref(), Some("héllo"));
    }

    #[test]
    fn line_breaks_cannot_smuggle_headers() {
        let base = OutboundEmail {
            to: vec!["a@one.test".to_string()],
            text: Some("hi".to_string()),
            ..OutboundEmail::default()
        };

        let smuggled = [
            OutboundEmail {
                subject: "Hi\r\nBcc: victim@evil.test".to_string(),
                ..base.clone()
            },
            OutboundEmail {
                from: Some("a@one.test\nX-Spoof: 1".to_string()),
                ..base.clone()
            },
            OutboundEmail {
                cc: vec!["b@two.test\r\n\r\nbody".to_string()],
                ..base.clone()
            },
            OutboundEmail {
                reply_to: Some("r@one.test\r".to_string()),
                ..base.clone()
            },
            OutboundEmail {
                headers: vec![("X-Tag".to_string(), "a\r\nBcc: x@evil.test".to_string())],
                ..base.clone()
            },
            OutboundEmail {
                headers: vec![("X-Tag: y\r\nBcc".to_string(), "x".to_string())],
                ..base.clone()
            },
        ];

        for email in smuggled {
            assert!(
                matches!(
                    email.compose(&domain()),
                    Err(ComposeError::InvalidHeader { .. })
                ),
                "{email:?}"
            );
        }

        let tagged = OutboundEmail {
            headers: vec![("X-Campaign".to_string(), "spring sale".to_string())],
            ..base
        };
        let message = tagged.compose(&domain()).unwrap();
        assert_eq!(message.headers().get("X-Campaign"), Some("spring sale"));
    }

    #[test]
    fn rejects_missing_or_invalid_recipients() {
        let email = OutboundEmail::default();
        assert!(matches!(
            email.compose(&domain()),
            Err(ComposeError::NoRecipients)
        ));

        let email = OutboundEmail {
            to: vec!["not-an-address".to_string()],
            ..OutboundEmail::default()
        };
        assert!(matches!(
            email.compose(&domain()),
            Err(ComposeError::InvalidAddress { field: "to", .. })
        ));
    }
}
