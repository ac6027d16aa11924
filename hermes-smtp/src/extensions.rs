use core::fmt::{self, Display};

/// Service extensions advertised in reply to EHLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// RFC 1870. Zero means no limit is advertised.
    Size(usize),
    /// RFC 6152
    EightBitMime,
    /// RFC 2920
    Pipelining,
    /// RFC 3207, only offered when a certificate is configured and the
    /// connection is not already encrypted.
    StartTls,
    Help,
}

impl Extension {
    /// What a server with the given limit and TLS state offers.
    #[must_use]
    pub fn advertised(max_message_size: usize, offer_tls: bool) -> Vec<Self> {
        let mut extensions = vec![Self::Size(max_message_size), Self::EightBitMime, Self::Pipelining];

        if offer_tls {
            extensions.push(Self::StartTls);
        }

        extensions.push(Self::Help);
        extensions
    }
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size(0) => fmt.write_str("SIZE"),
            Self::Size(max) => write!(fmt, "SIZE {max}"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Help => fmt.write_str("HELP"),
        }
    }
}
