use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::Domain;

/// Longest local-part permitted by RFC 5321 §4.5.3.1.1.
const MAX_LOCAL_PART: usize = 64;

/// Longest domain permitted by RFC 5321 §4.5.3.1.2.
const MAX_DOMAIN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Address {0:?} has no domain")]
    MissingDomain(String),

    #[error("Address {0:?} has no local part")]
    MissingLocalPart(String),

    #[error("Address {0:?} is too long")]
    TooLong(String),

    #[error("Address {0:?} contains invalid characters")]
    InvalidCharacters(String),
}

/// An envelope mailbox, `local-part@domain`.
///
/// The local part keeps its case, the domain is canonicalised through
/// [`Domain`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    local_part: Arc<str>,
    domain: Domain,
}

impl Address {
    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The address wrapped in angle brackets, as used in `MAIL FROM`/`RCPT TO`.
    #[must_use]
    pub fn to_path(&self) -> String {
        format!("<{self}>")
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Accepts either a bare `user@domain` or a bracketed `<user@domain>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed)
            .trim();

        if inner.is_empty() {
            return Err(AddressError::Empty);
        }

        if inner.chars().any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>') {
            return Err(AddressError::InvalidCharacters(inner.to_string()));
        }

        let Some((local, domain)) = inner.rsplit_once('@') else {
            return Err(AddressError::MissingDomain(inner.to_string()));
        };

        if local.is_empty() {
            return Err(AddressError::MissingLocalPart(inner.to_string()));
        }

        if domain.is_empty() || domain.starts_with('.') || domain.contains("..") {
            return Err(AddressError::MissingDomain(inner.to_string()));
        }

        if local.len() > MAX_LOCAL_PART || domain.len() > MAX_DOMAIN {
            return Err(AddressError::TooLong(inner.to_string()));
        }

        Ok(Self {
            local_part: Arc::from(local),
            domain: Domain::new(domain),
        })
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_bare_and_bracketed() {
        let bare: Address = "user@Example.COM".parse().unwrap();
        let bracketed: Address = "<user@example.com>".parse().unwrap();

        assert_eq!(bare, bracketed);
        assert_eq!(bare.local_part(), "user");
        assert_eq!(bare.domain().as_str(), "example.com");
        assert_eq!(bare.to_path(), "<user@example.com>");
    }

    #[test]
    fn local_part_keeps_case() {
        let address: Address = "John.Smith@example.com".parse().unwrap();
        assert_eq!(address.to_string(), "John.Smith@example.com");
    }

    #[test]
    fn quoted_local_part_with_at() {
        let address: Address = "\"odd@name\"@example.com".parse().unwrap();
        assert_eq!(address.local_part(), "\"odd@name\"");
        assert_eq!(address.domain().as_str(), "example.com");
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("".parse::<Address>(), Err(AddressError::Empty));
        assert_eq!("<>".parse::<Address>(), Err(AddressError::Empty));
        assert!(matches!(
            "user".parse::<Address>(),
            Err(AddressError::MissingDomain(_))
        ));
        assert!(matches!(
            "@example.com".parse::<Address>(),
            Err(AddressError::MissingLocalPart(_))
        ));
        assert!(matches!(
            "user@".parse::<Address>(),
            Err(AddressError::MissingDomain(_))
        ));
        assert!(matches!(
            "us er@example.com".parse::<Address>(),
            Err(AddressError::InvalidCharacters(_))
        ));
        assert!(matches!(
            format!("{}@example.com", "a".repeat(65)).parse::<Address>(),
            Err(AddressError::TooLong(_))
        ));
    }

    #[test]
    fn serde_as_string() {
        let address: Address = "user@example.com".parse().unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"user@example.com\"");
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), address);
    }
}
