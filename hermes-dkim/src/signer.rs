use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use hermes_common::{Domain, Message, tracing};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::SigningKey,
    pkcs8::DecodePrivateKey,
    signature::{SignatureEncoding, Signer},
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};

use crate::{
    DkimConfig,
    canonical::{self, CanonicalizationPair},
    error::DkimError,
    signature::{DkimSignature, HEADER_NAME},
};

/// Smallest modulus accepted, in bytes (1024 bits, RFC 8301 §3.2).
const MIN_KEY_BYTES: usize = 128;

/// Signs outbound messages for one domain and selector.
///
/// Signatures carry no timestamp, so signing the same message twice yields
/// the same header.
pub struct DkimSigner {
    key: SigningKey<Sha256>,
    domain: Domain,
    selector: String,
    canonicalization: CanonicalizationPair,
    signed_headers: Vec<String>,
}

impl fmt::Debug for DkimSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkimSigner")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .field("canonicalization", &self.canonicalization)
            .field("signed_headers", &self.signed_headers)
            .finish_non_exhaustive()
    }
}

impl DkimSigner {
    #[must_use]
    pub fn new(key: RsaPrivateKey, domain: Domain, selector: impl Into<String>) -> Self {
        Self {
            key: SigningKey::new(key),
            domain,
            selector: selector.into(),
            canonicalization: CanonicalizationPair::default(),
            signed_headers: crate::defaults::signed_headers(),
        }
    }

    /// Parse a PKCS#8 or PKCS#1 PEM encoded RSA key.
    ///
    /// # Errors
    /// If the key cannot be decoded or is shorter than 1024 bits.
    pub fn from_pem(pem: &str, domain: Domain, selector: impl Into<String>) -> Result<Self, DkimError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|err| DkimError::InvalidKey(err.to_string()))?;

        if key.size() < MIN_KEY_BYTES {
            return Err(DkimError::InvalidKey(format!(
                "{} bit keys are too short",
                key.size() * 8
            )));
        }

        Ok(Self::new(key, domain, selector))
    }

    /// Build the signer described by `config`.
    ///
    /// No key path means signing is switched off, which is not an error.
    ///
    /// # Errors
    /// If a key is configured but unreadable or invalid, or the signing
    /// domain or selector is missing.
    pub fn from_config(config: &DkimConfig) -> Result<Option<Self>, DkimError> {
        let Some(path) = config.private_key.as_ref() else {
            tracing::info!("No DKIM key configured, outbound mail will not be signed");
            return Ok(None);
        };

        let domain = config
            .domain
            .clone()
            .ok_or(DkimError::MissingField("dkim.domain"))?;
        if config.selector.trim().is_empty() {
            return Err(DkimError::MissingField("dkim.selector"));
        }

        let pem = std::fs::read_to_string(path).map_err(|source| DkimError::KeyUnreadable {
            path: path.clone(),
            source,
        })?;

        let signer = Self::from_pem(&pem, domain, config.selector.trim())?
            .with_canonicalization(config.canonicalization)
            .with_signed_headers(config.signed_headers.clone());

        tracing::info!(
            domain = %signer.domain,
            selector = %signer.selector,
            canonicalization = %signer.canonicalization,
            "DKIM signing enabled"
        );

        Ok(Some(signer))
    }

    #[must_use]
    pub const fn with_canonicalization(mut self, canonicalization: CanonicalizationPair) -> Self {
        self.canonicalization = canonicalization;
        self
    }

    /// `From` is always signed, whether listed or not.
    #[must_use]
    pub fn with_signed_headers(mut self, headers: Vec<String>) -> Self {
        let mut headers: Vec<String> = headers
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        if !headers.iter().any(|h| h == "from") {
            headers.insert(0, String::from("from"));
        }

        self.signed_headers = headers;
        self
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Compute the signature for `message` as it currently stands.
    ///
    /// A listed header that occurs more than once is signed from the bottom
    /// up, one instance per mention; listed headers the message lacks are
    /// left out of `h=`.
    ///
    /// # Errors
    /// If the RSA operation fails.
    #[tracing::instrument(level = "debug", skip_all, fields(domain = %self.domain, selector = %self.selector))]
    pub fn sign(&self, message: &Message) -> Result<DkimSignature, DkimError> {
        let body = canonical::body(self.canonicalization.body, message.body());
        let body_hash = STANDARD.encode(Sha256::digest(&body));

        let mut data = Vec::new();
        let mut signed_headers = Vec::with_capacity(self.signed_headers.len());

        for (idx, name) in self.signed_headers.iter().enumerate() {
            let seen = self.signed_headers[..idx]
                .iter()
                .filter(|earlier| *earlier == name)
                .count();

            let instance = message
                .headers()
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case(name))
                .nth_back(seen);

            if let Some((wire_name, value)) = instance {
                canonical::header(self.canonicalization.header, wire_name, value, &mut data);
                signed_headers.push(name.clone());
            }
        }

        let mut signature = DkimSignature {
            selector: self.selector.clone(),
            domain: self.domain.clone(),
            canonicalization: self.canonicalization,
            signed_headers,
            body_hash,
            signature: Vec::new(),
        };

        canonical::header(
            self.canonicalization.header,
            HEADER_NAME,
            &signature.header_value(),
            &mut data,
        );
        data.truncate(data.len() - 2);

        signature.signature = self.key.try_sign(&data)?.to_vec();
        tracing::debug!(headers = ?signature.signed_headers, "Message signed");

        Ok(signature)
    }

    /// Sign `message` and put the `DKIM-Signature` header on top.
    ///
    /// # Errors
    /// If the RSA operation fails.
    pub fn sign_message(&self, message: &mut Message) -> Result<DkimSignature, DkimError> {
        let signature = self.sign(message)?;
        message
            .headers_mut()
            .prepend(HEADER_NAME, signature.header_value());
        Ok(signature)
    }
}
