use std::fmt::{self, Display};

use base64::{Engine, engine::general_purpose::STANDARD};
use hermes_common::Domain;

use crate::canonical::CanonicalizationPair;

pub const HEADER_NAME: &str = "DKIM-Signature";

/// The only algorithm produced.
pub const ALGORITHM: &str = "rsa-sha256";

/// A computed `DKIM-Signature`.
///
/// An instance with an empty `signature` renders `b=` with no value, which
/// is exactly the form that is itself fed into the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignature {
    pub selector: String,
    pub domain: Domain,
    pub canonicalization: CanonicalizationPair,
    /// Lowercased names, in the order their canonical forms were hashed.
    pub signed_headers: Vec<String>,
    /// Base64 SHA-256 of the canonical body.
    pub body_hash: String,
    pub signature: Vec<u8>,
}

impl DkimSignature {
    /// The header value, tags in a fixed order.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!(
            "v=1; a={ALGORITHM}; c={}; d={}; s={}; h={}; bh={}; b={}",
            self.canonicalization,
            self.domain,
            self.selector,
            self.signed_headers.join(":"),
            self.body_hash,
            if self.signature.is_empty() {
                String::new()
            } else {
                STANDARD.encode(&self.signature)
            },
        )
    }
}

impl Display for DkimSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HEADER_NAME}: {}", self.header_value())
    }
}

#[cfg(test)]
mod tests {
    use hermes_common::Domain;
    use pretty_assertions::assert_eq;

    use super::DkimSignature;
    use crate::canonical::CanonicalizationPair;

    #[test]
    fn renders_tags_in_order() {
        let mut signature = DkimSignature {
            selector: String::from("mail"),
            domain: Domain::new("Hermes.Test"),
            canonicalization: CanonicalizationPair::default(),
            signed_headers: vec![String::from("from"), String::from("to")],
            body_hash: String::from("Ym9keQ=="),
            signature: Vec::new(),
        };

        assert_eq!(
            signature.to_string(),
            "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed; d=hermes.test; s=mail; \
             h=from:to; bh=Ym9keQ==; b="
        );

        signature.signature = b"sig".to_vec();
        assert!(signature.header_value().ends_with("; b=c2ln"));
    }
}
