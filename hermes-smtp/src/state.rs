use core::fmt::{self, Display, Formatter};
use std::sync::Arc;

use hermes_common::{
    Address, Domain, MessageId, error::StorageError, status::Status,
    traits::fsm::FiniteStateMachine,
};

use crate::{
    command::{Command, HeloVariant},
    extensions::Extension,
    response::Response,
};

/// RFC 5321 §4.5.3.1.8 requires accepting at least this many.
pub const MAX_RECIPIENTS: usize = 100;

/// Sender and recipients gathered for the message in progress.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// `None` with an open transaction is the null reverse-path.
    pub sender: Option<Address>,
    pub recipients: Vec<Address>,
    pub declared_size: Option<usize>,
}

/// Everything the state machine reads or writes besides the state itself.
#[derive(Debug, Clone)]
pub struct Context {
    pub banner: Arc<str>,
    pub catch_all: Arc<[Domain]>,
    /// Zero disables the limit.
    pub max_message_size: usize,
    pub tls_available: bool,
    pub tls_active: bool,
    pub client_id: Option<String>,
    pub envelope: Envelope,
    /// Reply to send for the last input, if any.
    pub response: Option<Response>,
    /// Set after a STARTTLS has been accepted.
    pub upgrade: bool,
}

impl Context {
    #[must_use]
    pub fn new(banner: Arc<str>, catch_all: Arc<[Domain]>, max_message_size: usize) -> Self {
        Self {
            banner,
            catch_all,
            max_message_size,
            tls_available: false,
            tls_active: false,
            client_id: None,
            envelope: Envelope::default(),
            response: None,
            upgrade: false,
        }
    }

    /// Catch-all match on the canonical (lower-cased) domain, subdomains excluded.
    #[must_use]
    pub fn accepts(&self, recipient: &Address) -> bool {
        self.catch_all.iter().any(|domain| domain == recipient.domain())
    }

    fn reply(&mut self, status: Status, text: impl Into<std::borrow::Cow<'static, str>>) {
        self.response = Some(Response::new(status, text));
    }

    fn exceeds_limit(&self, size: usize) -> bool {
        self.max_message_size > 0 && size > self.max_message_size
    }
}

/// Receiving side of the SMTP dialogue.
///
/// A session starts in [`State::Connected`], greets the client to reach
/// [`State::AwaitEhlo`], and loops between [`State::AwaitMailFrom`] and
/// [`State::MessageComplete`] once per message until it reaches
/// [`State::Closed`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum State {
    #[default]
    Connected,
    AwaitEhlo,
    AwaitMailFrom,
    AwaitRcptTo,
    AwaitData,
    ReceivingBody,
    MessageComplete,
    Closed,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Connected => "Connected",
            Self::AwaitEhlo => "AwaitEhlo",
            Self::AwaitMailFrom => "AwaitMailFrom",
            Self::AwaitRcptTo => "AwaitRcptTo",
            Self::AwaitData => "AwaitData",
            Self::ReceivingBody => "ReceivingBody",
            Self::MessageComplete => "MessageComplete",
            Self::Closed => "Closed",
        })
    }
}

impl State {
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    #[must_use]
    pub const fn in_transaction(self) -> bool {
        matches!(
            self,
            Self::AwaitRcptTo | Self::AwaitData | Self::ReceivingBody | Self::MessageComplete
        )
    }

    const fn greeted(self) -> bool {
        !matches!(self, Self::Connected | Self::AwaitEhlo)
    }

    /// Send the opening 220.
    #[must_use]
    pub fn greet(self, ctx: &mut Context) -> Self {
        match self {
            Self::Connected => {
                ctx.response = Some(Response::new(
                    Status::ServiceReady,
                    format!("{} ESMTP Hermes", ctx.banner),
                ));
                Self::AwaitEhlo
            }
            other => other,
        }
    }

    /// The terminating `.` has been read.
    #[must_use]
    pub const fn body_received(self) -> Self {
        match self {
            Self::ReceivingBody => Self::MessageComplete,
            other => other,
        }
    }

    /// The body outgrew the limit while it was being read.
    ///
    /// Nothing is stored and the session ends.
    #[must_use]
    pub fn size_exceeded(self, ctx: &mut Context) -> Self {
        ctx.envelope = Envelope::default();
        ctx.reply(
            Status::ActionUnavailable,
            format!(
                "Message exceeds the maximum size of {} bytes",
                ctx.max_message_size
            ),
        );
        Self::Closed
    }

    /// The completed message was handed to storage.
    #[must_use]
    pub fn message_handled(
        self,
        outcome: &Result<MessageId, StorageError>,
        ctx: &mut Context,
    ) -> Self {
        if self != Self::MessageComplete {
            return self;
        }

        ctx.envelope = Envelope::default();
        match outcome {
            Ok(_) => ctx.reply(Status::Ok, "Message accepted for delivery"),
            Err(_) => ctx.reply(Status::TransactionFailed, "Transaction failed"),
        }

        Self::AwaitMailFrom
    }

    /// The session is being torn down by the server.
    #[must_use]
    pub fn shutdown(self, ctx: &mut Context) -> Self {
        ctx.reply(Status::Unavailable, "Server shutting down");
        Self::Closed
    }

    fn ehlo(variant: &HeloVariant, ctx: &mut Context) -> Self {
        ctx.client_id = Some(variant.client_id().to_string());
        ctx.envelope = Envelope::default();

        let greeting = format!("{} greets {}", ctx.banner, variant.client_id());
        ctx.response = Some(match variant {
            HeloVariant::Helo(_) => Response::new(Status::Ok, greeting),
            HeloVariant::Ehlo(_) => Response::multiline(
                Status::Ok,
                std::iter::once(greeting)
                    .chain(
                        Extension::advertised(
                            ctx.max_message_size,
                            ctx.tls_available && !ctx.tls_active,
                        )
                        .iter()
                        .map(ToString::to_string),
                    )
                    .map(Into::into)
                    .collect(),
            ),
        });

        Self::AwaitMailFrom
    }

    fn mail_from(self, sender: Option<Address>, size: Option<usize>, ctx: &mut Context) -> Self {
        if let Some(declared) = size
            && ctx.exceeds_limit(declared)
        {
            ctx.reply(
                Status::ExceededStorage,
                format!(
                    "Declared message size {declared} exceeds the maximum of {} bytes",
                    ctx.max_message_size
                ),
            );
            return self;
        }

        ctx.envelope = Envelope {
            sender,
            recipients: Vec::new(),
            declared_size: size,
        };
        ctx.reply(Status::Ok, "Ok");

        Self::AwaitRcptTo
    }

    fn rcpt_to(self, recipient: Address, ctx: &mut Context) -> Self {
        if !ctx.accepts(&recipient) {
            ctx.reply(Status::Error, "Relay not permitted");
            return self;
        }

        if ctx.envelope.recipients.len() >= MAX_RECIPIENTS {
            ctx.reply(Status::InsufficientStorage, "Too many recipients");
            return self;
        }

        if !ctx.envelope.recipients.contains(&recipient) {
            ctx.envelope.recipients.push(recipient);
        }
        ctx.reply(Status::Ok, "Ok");

        Self::AwaitData
    }

    fn starttls(self, ctx: &mut Context) -> Self {
        if !ctx.tls_available || ctx.tls_active {
            ctx.reply(Status::NotImplemented, "TLS not available");
            return self;
        }

        ctx.upgrade = true;
        ctx.client_id = None;
        ctx.envelope = Envelope::default();
        ctx.reply(Status::ServiceReady, "Ready to start TLS");

        Self::AwaitEhlo
    }

    /// Answer a command line that overran the limit; the line itself is
    /// never interpreted.
    #[must_use]
    pub fn line_too_long(self, ctx: &mut Context) -> Self {
        ctx.reply(Status::SyntaxError, "Line too long");
        self
    }

    fn out_of_sequence(self, ctx: &mut Context, text: &'static str) -> Self {
        ctx.reply(Status::InvalidCommandSequence, text);
        self
    }
}

impl FiniteStateMachine for State {
    type Input = Command;
    type Context = Context;

    fn transition(self, command: Command, ctx: &mut Context) -> Self {
        if matches!(self, Self::Closed | Self::ReceivingBody | Self::MessageComplete) {
            return self;
        }

        match (self, command) {
            (_, Command::Quit) => {
                ctx.reply(Status::GoodBye, "Bye");
                Self::Closed
            }
            (_, Command::Noop) => {
                ctx.reply(Status::Ok, "Ok");
                self
            }
            (_, Command::Help) => {
                ctx.reply(
                    Status::HelpMessage,
                    "Supported: EHLO HELO MAIL RCPT DATA RSET NOOP QUIT HELP VRFY STARTTLS",
                );
                self
            }
            (_, Command::Vrfy(_)) => {
                ctx.reply(
                    Status::CannotVerify,
                    "Cannot VRFY user, but will accept message and attempt delivery",
                );
                self
            }
            (_, Command::Auth(_)) => {
                ctx.reply(Status::NotImplemented, "Authentication not available");
                self
            }
            (_, malformed @ Command::Malformed { .. }) => {
                let fatal = malformed.is_fatal();
                if let Command::Malformed { reason, .. } = malformed {
                    ctx.reply(Status::ParameterSyntaxError, reason);
                }
                if fatal { Self::Closed } else { self }
            }
            (_, Command::Invalid(_)) => {
                ctx.reply(Status::SyntaxError, "Command not recognized");
                self
            }
            (state, Command::Rset) => {
                ctx.envelope = Envelope::default();
                ctx.reply(Status::Ok, "Ok");
                if state.greeted() { Self::AwaitMailFrom } else { state }
            }
            (_, Command::Helo(variant)) => Self::ehlo(&variant, ctx),
            (Self::AwaitMailFrom, Command::StartTls) => self.starttls(ctx),
            (_, Command::StartTls) => {
                self.out_of_sequence(ctx, "STARTTLS not permitted during a transaction")
            }
            (Self::Connected | Self::AwaitEhlo, _) => {
                self.out_of_sequence(ctx, "Send EHLO/HELO first")
            }
            (Self::AwaitMailFrom, Command::MailFrom(sender, params)) => {
                self.mail_from(sender, params.size(), ctx)
            }
            (_, Command::MailFrom(..)) => self.out_of_sequence(ctx, "Nested MAIL command"),
            (Self::AwaitRcptTo | Self::AwaitData, Command::RcptTo(recipient)) => {
                self.rcpt_to(recipient, ctx)
            }
            (_, Command::RcptTo(_)) => self.out_of_sequence(ctx, "Need MAIL before RCPT"),
            (Self::AwaitData, Command::Data) => {
                ctx.reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>");
                Self::ReceivingBody
            }
            (Self::AwaitRcptTo, Command::Data) => self.out_of_sequence(ctx, "No valid recipients"),
            (_, Command::Data) => self.out_of_sequence(ctx, "Need MAIL command"),
        }
    }
}
