use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use ahash::AHashMap;
use hermes_common::Address;
use phf::phf_map;

/// ESMTP parameters for MAIL FROM (RFC 5321 §3.3).
///
/// Keys are stored upper-cased; known keys borrow a static string.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: AHashMap<Cow<'static, str>, Option<String>>,
}

static KNOWN_PARAMS: phf::Map<&'static str, &'static str> = phf_map! {
    "SIZE" => "SIZE",
    "BODY" => "BODY",
    "AUTH" => "AUTH",
    "RET" => "RET",
    "ENVID" => "ENVID",
    "SMTPUTF8" => "SMTPUTF8",
};

fn normalize_key(key: &str) -> Cow<'static, str> {
    let upper = key.to_ascii_uppercase();

    KNOWN_PARAMS
        .get(upper.as_str())
        .map_or(Cow::Owned(upper), |&s| Cow::Borrowed(s))
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `KEY=VALUE` and bare `FLAG` tokens.
    ///
    /// # Errors
    ///
    /// A repeated key, or a `SIZE` that is not a positive integer.
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::new();

        for token in params_str.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .map_or((token, None), |(key, value)| (key, Some(value)));

            let key = normalize_key(key);
            if params.params.contains_key(&key) {
                return Err(format!("Duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" {
                match value.map(str::parse::<usize>) {
                    Some(Ok(0)) => return Err(String::from("SIZE=0 is not allowed")),
                    Some(Ok(_)) => {}
                    _ => return Err(format!("Invalid SIZE value: {}", value.unwrap_or(""))),
                }
            }

            params.params.insert(key, value.map(str::to_string));
        }

        Ok(params)
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.params
            .insert(normalize_key(key.as_ref()), Some(value.into()));
    }

    pub fn insert_flag(&mut self, key: impl AsRef<str>) {
        self.params.insert(normalize_key(key.as_ref()), None);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(&normalize_key(key))?.as_deref()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(&normalize_key(key))
    }

    /// The declared message size (RFC 1870), if any.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut params = self.params.iter().collect::<Vec<_>>();
        params.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (idx, (key, value)) in params.into_iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }

            match value {
                None => f.write_str(key)?,
                Some(value) => write!(f, "{key}={value}")?,
            }
        }

        Ok(())
    }
}

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn client_id(&self) -> &str {
        match self {
            Self::Ehlo(id) | Self::Helo(id) => id,
        }
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// Verbs that take no argument, looked up after upper-casing.
#[derive(Clone, Copy, Debug)]
enum Verb {
    Data,
    Rset,
    Noop,
    Quit,
    Help,
    StartTls,
}

static BARE_VERBS: phf::Map<&'static str, Verb> = phf_map! {
    "DATA" => Verb::Data,
    "RSET" => Verb::Rset,
    "NOOP" => Verb::Noop,
    "QUIT" => Verb::Quit,
    "HELP" => Verb::Help,
    "STARTTLS" => Verb::StartTls,
};

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// `None` is the null reverse-path, `MAIL FROM:<>`.
    MailFrom(Option<Address>, MailParameters),
    RcptTo(Address),
    Data,
    Rset,
    Noop,
    Quit,
    Help,
    StartTls,
    Vrfy(String),
    Auth(String),
    /// A known verb whose arguments could not be parsed.
    Malformed { verb: &'static str, reason: String },
    /// Anything that is not a command this server knows.
    Invalid(String),
}

impl Command {
    /// Extract the SIZE parameter from a MAIL FROM command, if present.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::MailFrom(_, params) => params.size(),
            _ => None,
        }
    }

    /// A malformed envelope sender ends the session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed { verb: "MAIL", .. })
    }

    fn parse_mail_from(rest: &str) -> Result<Self, Self> {
        let malformed = |reason: String| Self::Malformed {
            verb: "MAIL",
            reason,
        };

        let rest = rest.trim();
        if rest.is_empty() {
            return Err(malformed(String::from("Expected a reverse-path")));
        }

        let (path, params) = rest
            .split_once(char::is_whitespace)
            .unwrap_or((rest, ""));
        let params = MailParameters::from_params_str(params).map_err(malformed)?;

        if path == "<>" {
            return Ok(Self::MailFrom(None, params));
        }

        path.parse::<Address>()
            .map(|sender| Self::MailFrom(Some(sender), params))
            .map_err(|err| malformed(err.to_string()))
    }

    fn parse_rcpt_to(rest: &str) -> Result<Self, Self> {
        let rest = rest.trim();
        let path = rest.split_once(char::is_whitespace).map_or(rest, |(p, _)| p);

        path.parse::<Address>().map(Self::RcptTo).map_err(|err| Self::Malformed {
            verb: "RCPT",
            reason: err.to_string(),
        })
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => write!(fmt, "{v} {}", v.client_id()),
            Self::MailFrom(sender, params) => {
                let path = sender.as_ref().map_or_else(|| String::from("<>"), Address::to_path);
                if params.is_empty() {
                    write!(fmt, "MAIL FROM:{path}")
                } else {
                    write!(fmt, "MAIL FROM:{path} {params}")
                }
            }
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:{}", rcpt.to_path()),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Help => fmt.write_str("HELP"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Vrfy(arg) => write!(fmt, "VRFY {arg}"),
            // Credentials are never echoed into logs
            Self::Auth(mechanism) => write!(fmt, "AUTH {mechanism}"),
            Self::Malformed { verb, reason } => write!(fmt, "{verb} ({reason})"),
            Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "MAIL FROM:") {
            return Self::parse_mail_from(rest);
        }

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "RCPT TO:") {
            return Self::parse_rcpt_to(rest);
        }

        let (verb, argument) = trimmed
            .split_once(' ')
            .map_or((trimmed, ""), |(verb, arg)| (verb, arg.trim()));
        let upper = verb.to_ascii_uppercase();

        match upper.as_str() {
            "EHLO" | "HELO" if argument.is_empty() => Err(Self::Malformed {
                verb: if upper == "EHLO" { "EHLO" } else { "HELO" },
                reason: format!("Expected hostname in {trimmed}"),
            }),
            "EHLO" => Ok(Self::Helo(HeloVariant::Ehlo(argument.to_string()))),
            "HELO" => Ok(Self::Helo(HeloVariant::Helo(argument.to_string()))),
            "MAIL" | "RCPT" => Err(Self::Malformed {
                verb: if upper == "MAIL" { "MAIL" } else { "RCPT" },
                reason: format!("Syntax error in {trimmed}"),
            }),
            "VRFY" => Ok(Self::Vrfy(argument.to_string())),
            "AUTH" => Ok(Self::Auth(
                argument
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase(),
            )),
            _ => match BARE_VERBS.get(upper.as_str()) {
                Some(_) if !argument.is_empty() && !matches!(upper.as_str(), "NOOP" | "HELP") => {
                    Err(Self::Malformed {
                        verb: "COMMAND",
                        reason: format!("{upper} takes no arguments"),
                    })
                }
                Some(Verb::Data) => Ok(Self::Data),
                Some(Verb::Rset) => Ok(Self::Rset),
                Some(Verb::Noop) => Ok(Self::Noop),
                Some(Verb::Quit) => Ok(Self::Quit),
                Some(Verb::Help) => Ok(Self::Help),
                Some(Verb::StartTls) => Ok(Self::StartTls),
                None => Err(Self::Invalid(trimmed.to_string())),
            },
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}
