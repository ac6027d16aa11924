use std::{
    fmt::{self, Display},
    sync::Arc,
};

use mailparse::{DispositionType, ParsedMail};
use serde::{Deserialize, Serialize};

use crate::{Address, error::MessageParseError};

pub const CRLF: &[u8] = b"\r\n";

/// Identifier handed out by the storage collaborator, or generated locally
/// for outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Arc<str>);

impl MessageId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// A fresh, lexicographically sortable identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Arc::from(ulid::Ulid::new().to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered header block.
///
/// Entries keep their insertion order and a name may occur more than once,
/// which both RFC 5322 (`Received`, `Comments`) and DKIM (`h=` selection from
/// the bottom) depend on. Name lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(Arc<str>, String)>);

impl Headers {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Add a value after every existing header.
    pub fn append(&mut self, name: impl Into<Arc<str>>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Add a value before every existing header.
    pub fn prepend(&mut self, name: impl Into<Arc<str>>, value: impl Into<String>) {
        self.0.insert(0, (name.into(), value.into()));
    }

    /// First value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Every value for `name`, top to bottom.
    pub fn get_all<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl DoubleEndedIterator<Item = &'a str> + use<'a, 'n> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Drop every occurrence of `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_ref(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialise as `Name: value\r\n` lines.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.0 {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(CRLF);
        }
    }
}

impl<N: Into<Arc<str>>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    #[serde(skip)]
    pub content: Vec<u8>,
}

impl Attachment {
    #[must_use]
    pub const fn size(&self) -> usize {
        self.content.len()
    }
}

/// Text and HTML alternatives found in a body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Content {
    pub text: Option<String>,
    pub html: Option<String>,
}

/// A message together with its envelope.
///
/// The envelope always holds a sender and at least one recipient; the
/// constructors refuse anything else. `body` is the exact byte sequence
/// following the header block (already MIME encoded where relevant), while
/// `attachments` is a decoded view of the attachment parts it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: Address,
    recipients: Vec<Address>,
    headers: Headers,
    body: Vec<u8>,
    attachments: Vec<Attachment>,
}

impl Message {
    ///
    /// # Errors
    ///
    /// If `recipients` is empty.
    ///
    pub fn new(
        sender: Address,
        recipients: Vec<Address>,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<Self, MessageParseError> {
        if recipients.is_empty() {
            return Err(MessageParseError::IncompleteEnvelope("no recipients"));
        }

        Ok(Self {
            sender,
            recipients,
            headers,
            body,
            attachments: Vec::new(),
        })
    }

    ///
    /// Build a message from the bytes received after `DATA`, with
    /// dot-stuffing already removed.
    ///
    /// # Errors
    ///
    /// If the header block is malformed or the envelope is incomplete.
    ///
    pub fn from_raw(
        sender: Option<Address>,
        recipients: Vec<Address>,
        raw: &[u8],
    ) -> Result<Self, MessageParseError> {
        let sender = sender.ok_or(MessageParseError::IncompleteEnvelope("no sender"))?;
        let (parsed, body_offset) = mailparse::parse_headers(raw)?;

        let headers = parsed
            .iter()
            .map(|h| {
                (
                    h.get_key(),
                    String::from_utf8_lossy(h.get_value_raw()).trim().to_string(),
                )
            })
            .collect();

        let mut message = Self::new(sender, recipients, headers, raw[body_offset..].to_vec())?;
        message.attachments = collect_attachments(&mailparse::parse_mail(raw)?);

        Ok(message)
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    #[must_use]
    pub const fn sender(&self) -> &Address {
        &self.sender
    }

    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    pub const fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.headers.get("Subject")
    }

    /// The `Message-ID` header with its angle brackets removed.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.headers
            .get("Message-ID")
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>'))
    }

    /// Header block followed by the body, as handed to `DATA` (before
    /// dot-stuffing).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + self.headers.len() * 64);
        self.headers.write_to(&mut out);
        out.extend_from_slice(CRLF);
        out.extend_from_slice(&self.body);
        out
    }

    /// Decoded `text/plain` and `text/html` alternatives.
    #[must_use]
    pub fn content(&self) -> Content {
        let raw = self.to_bytes();
        let mut content = Content::default();

        if let Ok(parsed) = mailparse::parse_mail(&raw) {
            collect_content(&parsed, &mut content);
        }

        content
    }
}

fn is_attachment(part: &ParsedMail<'_>) -> bool {
    part.get_content_disposition().disposition == DispositionType::Attachment
}

fn collect_content(part: &ParsedMail<'_>, content: &mut Content) {
    if part.subparts.is_empty() {
        if is_attachment(part) {
            return;
        }

        let slot = match part.ctype.mimetype.as_str() {
            "text/plain" => &mut content.text,
            "text/html" => &mut content.html,
            _ => return,
        };

        if slot.is_none() {
            *slot = part.get_body().ok();
        }
    } else {
        for sub in &part.subparts {
            collect_content(sub, content);
        }
    }
}

fn collect_attachments(part: &ParsedMail<'_>) -> Vec<Attachment> {
    let mut found = Vec::new();
    walk_attachments(part, &mut found);
    found
}

fn walk_attachments(part: &ParsedMail<'_>, found: &mut Vec<Attachment>) {
    if is_attachment(part) {
        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_else(|| "attachment".to_string());

        found.push(Attachment {
            filename,
            content_type: part.ctype.mimetype.clone(),
            content: part.get_body_raw().unwrap_or_default(),
        });
        return;
    }

    for sub in &part.subparts {
        walk_attachments(sub, found);
    }
}
