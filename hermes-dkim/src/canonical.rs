//! Header and body canonicalisation, RFC 6376 §3.4.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Canonicalization {
    Simple,
    #[default]
    Relaxed,
}

impl Display for Canonicalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::Relaxed => "relaxed",
        })
    }
}

/// The `c=` pair: header algorithm, then body algorithm.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalizationPair {
    #[serde(default)]
    pub header: Canonicalization,
    #[serde(default)]
    pub body: Canonicalization,
}

impl Display for CanonicalizationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.header, self.body)
    }
}

const fn is_wsp(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Append one canonical header line, CRLF included, to `out`.
///
/// `simple` reproduces the header as it is written on the wire.
pub fn header(algorithm: Canonicalization, name: &str, value: &str, out: &mut Vec<u8>) {
    match algorithm {
        Canonicalization::Simple => {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
        }
        Canonicalization::Relaxed => {
            out.extend_from_slice(name.trim().to_ascii_lowercase().as_bytes());
            out.push(b':');

            let mut pending_space = false;
            let mut started = false;
            for &b in value.as_bytes() {
                match b {
                    b'\r' | b'\n' => {}
                    b if is_wsp(b) => pending_space = true,
                    b => {
                        if pending_space && started {
                            out.push(b' ');
                        }
                        pending_space = false;
                        started = true;
                        out.push(b);
                    }
                }
            }
        }
    }
    out.extend_from_slice(b"\r\n");
}

/// Canonical form of a message body.
#[must_use]
pub fn body(algorithm: Canonicalization, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 2);

    match algorithm {
        Canonicalization::Simple => out.extend_from_slice(content),
        Canonicalization::Relaxed => {
            for line in content.split_inclusive(|&b| b == b'\n') {
                let (text, ending) = line
                    .strip_suffix(b"\r\n")
                    .map_or((line, &b""[..]), |text| (text, &b"\r\n"[..]));

                let mut pending_space = false;
                for &b in text {
                    if is_wsp(b) {
                        pending_space = true;
                    } else {
                        if pending_space {
                            out.push(b' ');
                        }
                        pending_space = false;
                        out.push(b);
                    }
                }
                out.extend_from_slice(ending);
            }
        }
    }

    while out.ends_with(b"\r\n\r\n") {
        out.truncate(out.len() - 2);
    }
    if out == b"\r\n" {
        out.clear();
    }

    match algorithm {
        Canonicalization::Simple if out.is_empty() => out.extend_from_slice(b"\r\n"),
        _ if !out.is_empty() && !out.ends_with(b"\r\n") => out.extend_from_slice(b"\r\n"),
        _ => {}
    }

    out
}
