use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Instant};

use hermes_common::{
    Domain, Signal, config::ServerTimeouts, error::SessionError, internal, outgoing, tracing,
};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::{
    connection::Connection,
    inbox::Inbox,
    state::{Context, State},
};

mod io;

#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

pub struct SessionConfig {
    pub banner: String,
    pub catch_all: Arc<[Domain]>,
    pub max_message_size: usize,
    pub acceptor: Option<TlsAcceptor>,
    pub inbox: Option<Inbox>,
    pub timeouts: ServerTimeouts,
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct SessionConfigBuilder {
    banner: String,
    catch_all: Vec<Domain>,
    max_message_size: usize,
    acceptor: Option<TlsAcceptor>,
    inbox: Option<Inbox>,
    timeouts: ServerTimeouts,
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    #[must_use]
    pub fn with_catch_all(mut self, domains: Vec<Domain>) -> Self {
        self.catch_all = domains;
        self
    }

    /// Zero disables the limit.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Offer STARTTLS using this acceptor
    #[must_use]
    pub fn with_acceptor(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    #[must_use]
    pub fn with_inbox(mut self, inbox: Option<Inbox>) -> Self {
        self.inbox = inbox;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            banner: self.banner,
            catch_all: self.catch_all.into(),
            max_message_size: self.max_message_size,
            acceptor: self.acceptor,
            inbox: self.inbox,
            timeouts: self.timeouts,
        }
    }
}

/// One inbound SMTP conversation.
pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    pub(crate) state: State,
    pub(crate) context: Context,
    pub(super) connection: Connection<Stream>,
    acceptor: Option<TlsAcceptor>,
    inbox: Option<Inbox>,
    timeouts: ServerTimeouts,
    start_time: Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub fn create(stream: Stream, peer: SocketAddr, config: SessionConfig) -> Self {
        let banner: Arc<str> = if config.banner.is_empty() {
            std::env::var("HOSTNAME")
                .unwrap_or_else(|_| "localhost".to_string())
                .into()
        } else {
            config.banner.into()
        };

        let mut context = Context::new(banner, config.catch_all, config.max_message_size);
        context.tls_available = config.acceptor.is_some();

        Self {
            peer,
            state: State::default(),
            context,
            connection: Connection::new(stream),
            acceptor: config.acceptor,
            inbox: config.inbox,
            timeouts: config.timeouts,
            start_time: Instant::now(),
        }
    }

    /// Timeout for the next read, per RFC 5321 §4.5.3.2.
    const fn get_timeout_secs(&self, first_data_line: bool) -> u64 {
        match self.state {
            State::ReceivingBody if first_data_line => self.timeouts.data_init_secs,
            State::ReceivingBody => self.timeouts.data_block_secs,
            State::MessageComplete => self.timeouts.data_termination_secs,
            _ => self.timeouts.command_secs,
        }
    }

    ///
    /// Drive the conversation until either side closes it.
    ///
    /// # Errors
    /// On timeouts and I/O failures. Protocol errors by the client are
    /// answered with a reply code instead.
    ///
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, fields(peer = %self.peer))]
    pub async fn run(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected");

        self.state = self.state.greet(&mut self.context);
        let result = self.run_inner(&mut signal).await;

        internal!("Connection closed");
        result
    }

    async fn run_inner(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        loop {
            self.flush_response().await?;

            if self.state.is_closed() {
                return Ok(());
            }

            if self.context.upgrade {
                self.upgrade().await?;
                continue;
            }

            let connection_duration = self.start_time.elapsed();
            if connection_duration.as_secs() >= self.timeouts.connection_secs {
                tracing::warn!(
                    peer = %self.peer,
                    duration_secs = connection_duration.as_secs(),
                    max_secs = self.timeouts.connection_secs,
                    "Connection exceeded maximum lifetime, closing"
                );
                return Err(SessionError::Timeout(self.timeouts.connection_secs));
            }

            if self.state == State::ReceivingBody {
                self.receive_body(signal).await?;
            } else {
                self.receive_command(signal).await?;
            }
        }
    }

    async fn flush_response(&mut self) -> Result<(), SessionError> {
        let Some(response) = self.context.response.take() else {
            return Ok(());
        };

        outgoing!("{response}");

        self.connection
            .send(&response)
            .await
            .map(|_| ())
            .map_err(|err| {
                internal!(level = ERROR, "{err}");
                SessionError::Protocol(format!("Failed to send response: {err}"))
            })
    }

    async fn upgrade(&mut self) -> Result<(), SessionError> {
        self.context.upgrade = false;

        let Some(acceptor) = self.acceptor.as_ref() else {
            return Err(SessionError::Protocol(String::from(
                "STARTTLS accepted without a certificate",
            )));
        };

        self.connection
            .upgrade(acceptor)
            .await
            .map_err(|err| SessionError::Protocol(err.to_string()))?;
        self.context.tls_active = self.connection.is_tls();

        internal!(level = DEBUG, "Connection upgraded to TLS");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::Cursor,
        pin::Pin,
        sync::{Arc, Mutex},
        task::{Context as TaskContext, Poll},
    };

    use async_trait::async_trait;
    use hermes_common::{
        Domain, Message, MessageId, Signal,
        error::StorageError,
        event::{EventKind, WebhookEvent},
        traits::collaborator::MessageStore,
    };
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncRead, AsyncWrite, ReadBuf},
        sync::{broadcast, mpsc},
    };

    use super::{Session, SessionConfig};
    use crate::{inbox::Inbox, state::State};

    /// Replays client input and records everything the server writes.
    #[derive(Default)]
    struct Script {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl AsyncRead for Script {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().input).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Script {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.get_mut().output.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Default)]
    struct Store {
        messages: Mutex<Vec<Message>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageStore for Store {
        async fn store_message(&self, message: Message) -> Result<MessageId, StorageError> {
            if self.fail {
                return Err(StorageError::Unavailable(String::from("store offline")));
            }

            let mut messages = self.messages.lock().unwrap();
            messages.push(message);
            Ok(MessageId::new(format!("msg-{}", messages.len())))
        }
    }

    fn session(
        input: &[u8],
        store: Arc<Store>,
        events: Option<mpsc::Sender<WebhookEvent>>,
    ) -> Session<Script> {
        let mut inbox = Inbox::new(store);
        if let Some(events) = events {
            inbox = inbox.with_events(events);
        }

        Session::create(
            Script {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
            },
            "127.0.0.1:2525".parse().unwrap(),
            SessionConfig::builder()
                .with_banner("mx.hermes.test")
                .with_catch_all(vec![Domain::new("configured-domain.test")])
                .with_max_message_size(1024)
                .with_inbox(Some(inbox))
                .build(),
        )
    }

    async fn run(mut session: Session<Script>) -> (State, String) {
        let (_tx, mut rx) = broadcast::channel::<Signal>(1);

        session.state = session.state.greet(&mut session.context);
        let result = session.run_inner(&mut rx).await;
        assert!(result.is_ok(), "{result:?}");

        let written = &session.connection.get_ref().unwrap().output;
        (session.state, String::from_utf8_lossy(written).into_owned())
    }

    fn codes(transcript: &str) -> Vec<&str> {
        transcript
            .split("\r\n")
            .filter(|line| line.len() >= 4 && &line[3..4] == " ")
            .map(|line| &line[..3])
            .collect()
    }

    #[tokio::test]
    async fn receives_dot_stuffed_message() {
        let store = Arc::new(Store::default());
        let (tx, mut rx) = mpsc::channel(4);

        let input = b"EHLO client.test\r\n\
MAIL FROM:<sender@remote.test>\r\n\
RCPT TO:<anything@configured-domain.test>\r\n\
DATA\r\n\
From: sender@remote.test\r\n\
Subject: Dots\r\n\
\r\n\
..leading dot\r\n\
plain\r\n\
.\r\n\
QUIT\r\n";

        let (state, transcript) = run(session(input, Arc::clone(&store), Some(tx))).await;

        assert_eq!(state, State::Closed);
        assert_eq!(codes(&transcript), ["220", "250", "250", "250", "354", "250", "221"]);
        assert!(transcript.contains("250 Message accepted for delivery"));

        let messages = store.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body(), b".leading dot\r\nplain\r\n");
        assert_eq!(messages[0].subject(), Some("Dots"));
        assert!(messages[0].headers().get("Received").is_some());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Received);
        assert_eq!(event.email.id.as_str(), "msg-1");
    }

    #[tokio::test]
    async fn pipelined_messages_on_one_connection() {
        let store = Arc::new(Store::default());

        let input = b"EHLO client.test\r\n\
MAIL FROM:<a@remote.test>\r\nRCPT TO:<x@configured-domain.test>\r\nDATA\r\n\
Subject: one\r\n\r\nfirst\r\n.\r\n\
MAIL FROM:<b@remote.test>\r\nRCPT TO:<y@configured-domain.test>\r\nDATA\r\n\
Subject: two\r\n\r\nsecond\r\n.\r\n\
QUIT\r\n";

        let (_, transcript) = run(session(input, Arc::clone(&store), None)).await;

        assert_eq!(
            codes(&transcript),
            ["220", "250", "250", "250", "354", "250", "250", "250", "354", "250", "221"]
        );

        let messages = store.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].sender().to_string(), "b@remote.test");
    }

    #[tokio::test]
    async fn relay_is_refused() {
        let store = Arc::new(Store::default());
        let input = b"HELO client.test\r\nMAIL FROM:<a@remote.test>\r\nRCPT TO:<victim@elsewhere.test>\r\nDATA\r\nQUIT\r\n";

        let (_, transcript) = run(session(input, Arc::clone(&store), None)).await;

        assert_eq!(codes(&transcript), ["220", "250", "250", "550", "503", "221"]);
        assert!(store.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_and_closed() {
        let store = Arc::new(Store::default());
        let mut input =
            b"EHLO c\r\nMAIL FROM:<a@remote.test>\r\nRCPT TO:<x@configured-domain.test>\r\nDATA\r\n"
                .to_vec();
        for _ in 0..40 {
            input.extend_from_slice(b"0123456789012345678901234567890123456789\r\n");
        }
        input.extend_from_slice(b".\r\nQUIT\r\n");

        let (state, transcript) = run(session(&input, Arc::clone(&store), None)).await;

        assert_eq!(state, State::Closed);
        assert_eq!(codes(&transcript).last(), Some(&"451"));
        assert!(store.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_is_554() {
        let store = Arc::new(Store {
            fail: true,
            ..Store::default()
        });
        let input = b"EHLO c\r\nMAIL FROM:<a@remote.test>\r\nRCPT TO:<x@configured-domain.test>\r\nDATA\r\nSubject: x\r\n\r\nbody\r\n.\r\nQUIT\r\n";

        let (_, transcript) = run(session(input, store, None)).await;

        assert!(transcript.contains("554 Transaction failed"));
        assert_eq!(codes(&transcript).last(), Some(&"221"));
    }

    #[tokio::test]
    async fn malformed_sender_closes_session() {
        let input = b"EHLO c\r\nMAIL FROM:<not an address>\r\nQUIT\r\n";

        let (state, transcript) = run(session(input, Arc::new(Store::default()), None)).await;

        assert_eq!(state, State::Closed);
        assert_eq!(codes(&transcript), ["220", "250", "501"]);
    }

    #[tokio::test]
    async fn client_disconnect_mid_data_stores_nothing() {
        let store = Arc::new(Store::default());
        let input = b"EHLO c\r\nMAIL FROM:<a@remote.test>\r\nRCPT TO:<x@configured-domain.test>\r\nDATA\r\nSubject: x\r\n";

        let (state, _) = run(session(input, Arc::clone(&store), None)).await;

        assert_eq!(state, State::Closed);
        assert!(store.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlong_command_line_is_dropped_whole() {
        let mut input = b"EHLO c\r\nNOOP ".to_vec();
        input.extend(std::iter::repeat_n(b'x', 2043));
        input.extend_from_slice(b"QUIT\r\nNOOP\r\nQUIT\r\n");

        let (state, transcript) = run(session(&input, Arc::new(Store::default()), None)).await;

        assert_eq!(state, State::Closed);
        assert_eq!(codes(&transcript), ["220", "250", "500", "250", "221"]);
        assert!(transcript.contains("500 Line too long"));
    }

    #[tokio::test]
    async fn null_sender_is_accepted() {
        let store = Arc::new(Store::default());
        let input = b"EHLO c\r\nMAIL FROM:<>\r\nRCPT TO:<x@configured-domain.test>\r\nDATA\r\nSubject: bounce\r\n\r\nbody\r\n.\r\nQUIT\r\n";

        let _ = run(session(input, Arc::clone(&store), None)).await;

        let messages = store.messages.lock().unwrap();
        assert_eq!(messages[0].sender().to_string(), "MAILER-DAEMON@mx.hermes.test");
    }
}
