//! Domain newtype
//!
//! Domains are stored in their canonical form (ASCII lowercase, no trailing
//! root dot) so that equality and hashing follow DNS semantics. This is what
//! lets recipients be grouped per domain and matched against the catch-all
//! set without each caller remembering to fold case.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Deserializer, Serialize};

/// A canonicalised domain name.
///
/// # Examples
///
/// ```
/// use hermes_common::Domain;
///
/// let domain = Domain::new("Mail.Example.COM.");
/// assert_eq!(domain.as_str(), "mail.example.com");
/// assert_eq!(domain, Domain::new("mail.example.com"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        let trimmed = s.as_ref().trim().trim_end_matches('.');
        Self(Arc::from(trimmed.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Arc<str> {
        self.0
    }
}

impl<'de> Deserialize<'de> for Domain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Domain> for Arc<str> {
    fn from(domain: Domain) -> Self {
        domain.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_domain_canonical_form() {
        assert_eq!(Domain::new("EXAMPLE.com").as_str(), "example.com");
        assert_eq!(Domain::new("example.com.").as_str(), "example.com");
        assert_eq!(Domain::new("  example.com ").as_str(), "example.com");
    }

    #[test]
    fn test_domain_equality_ignores_case() {
        assert_eq!(Domain::new("Example.Test"), Domain::new("example.test"));
        assert_ne!(Domain::new("example.test"), Domain::new("sub.example.test"));
    }

    #[test]
    fn test_domain_display() {
        let domain = Domain::new("display.example.com");
        assert_eq!(format!("{domain}"), "display.example.com");
    }

    #[test]
    fn test_domain_deref() {
        let domain = Domain::new("deref.example.com");
        assert_eq!(domain.len(), "deref.example.com".len());
        assert!(domain.ends_with(".com"));
    }

    #[test]
    fn test_domain_serde() {
        let domain = Domain::new("serde.example.com");
        let serialized = serde_json::to_string(&domain).unwrap();
        assert_eq!(serialized, "\"serde.example.com\"");

        let deserialized: Domain = serde_json::from_str("\"SERDE.example.com\"").unwrap();
        assert_eq!(deserialized, domain);
    }

    #[test]
    fn test_domain_hash() {
        let mut map = HashMap::new();
        map.insert(Domain::new("hash.example.com"), 42);

        assert_eq!(map.get(&Domain::new("HASH.example.com")), Some(&42));
    }
}
