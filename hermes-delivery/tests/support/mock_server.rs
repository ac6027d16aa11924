//! Scriptable SMTP server for delivery tests.
#![allow(dead_code)]
//!
//! ```rust,ignore
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response_for("unknown@", 550, "No such user")
//!     .build()
//!     .await?;
//! ```

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    StartTls,
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Everything between `DATA` and the terminating dot, still stuffed.
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct SmtpResponse {
    code: u16,
    message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_code: u16,
    capabilities: Vec<String>,
    helo_response: SmtpResponse,
    starttls_response: SmtpResponse,
    auth_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    /// First match on a substring of the path wins.
    rcpt_to_overrides: Vec<(String, SmtpResponse)>,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    drop_after_commands: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "mock.hermes.test ESMTP"),
            ehlo_code: 250,
            capabilities: vec![
                "mock.hermes.test".to_string(),
                "SIZE 10000000".to_string(),
                "PIPELINING".to_string(),
            ],
            helo_response: SmtpResponse::new(250, "Hello"),
            starttls_response: SmtpResponse::new(502, "Command not implemented"),
            auth_response: SmtpResponse::new(235, "Authentication succeeded"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            rcpt_to_overrides: Vec::new(),
            data_response: SmtpResponse::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end_response: SmtpResponse::new(250, "OK: queued"),
            drop_after_commands: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// Bodies received, one per completed `DATA`.
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut seen = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            if config.drop_after_commands.is_some_and(|limit| seen >= limit) {
                return Ok(());
            }

            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            seen += 1;

            let command_line = line.trim_end().to_string();
            let (verb, argument) = command_line
                .split_once(' ')
                .map_or((command_line.as_str(), ""), |(verb, rest)| (verb, rest));

            let (command, response) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (
                    SmtpCommand::Ehlo(argument.to_string()),
                    ehlo_bytes(config.ehlo_code, &config.capabilities),
                ),
                "HELO" => (
                    SmtpCommand::Helo(argument.to_string()),
                    config.helo_response.to_bytes(),
                ),
                "STARTTLS" => (SmtpCommand::StartTls, config.starttls_response.to_bytes()),
                "AUTH" => (
                    SmtpCommand::Auth(argument.to_string()),
                    config.auth_response.to_bytes(),
                ),
                "MAIL" => (
                    SmtpCommand::MailFrom(argument.to_string()),
                    config.mail_from_response.to_bytes(),
                ),
                "RCPT" => {
                    let response = config
                        .rcpt_to_overrides
                        .iter()
                        .find(|(pattern, _)| argument.contains(pattern.as_str()))
                        .map_or(&config.rcpt_to_response, |(_, response)| response);
                    (SmtpCommand::RcptTo(argument.to_string()), response.to_bytes())
                }
                "DATA" => (SmtpCommand::Data, config.data_response.to_bytes()),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(b"221 Bye\r\n").await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    SmtpCommand::Other(command_line.clone()),
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            commands.write().await.push(command);
            writer.write_all(&response).await?;
            writer.flush().await?;

            if is_data && config.data_response.code == 354 {
                let mut content = Vec::new();
                loop {
                    let mut data_line = Vec::new();
                    if reader.read_until(b'\n', &mut data_line).await? == 0 {
                        return Ok(());
                    }
                    if data_line == b".\r\n" {
                        break;
                    }
                    content.extend_from_slice(&data_line);
                }

                commands
                    .write()
                    .await
                    .push(SmtpCommand::MessageContent(content));
                writer
                    .write_all(&config.data_end_response.to_bytes())
                    .await?;
                writer.flush().await?;
            }
        }
    }
}

fn ehlo_bytes(code: u16, capabilities: &[String]) -> Vec<u8> {
    let mut response = String::new();
    let last = capabilities.len().saturating_sub(1);

    for (index, capability) in capabilities.iter().enumerate() {
        let separator = if index == last { ' ' } else { '-' };
        let _ = write!(response, "{code}{separator}{capability}\r\n");
    }

    response.into_bytes()
}

pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub const fn with_ehlo_code(mut self, code: u16) -> Self {
        self.config.ehlo_code = code;
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.config.capabilities.push(capability.into());
        self
    }

    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    /// Answer `RCPT TO` paths containing `pattern` differently.
    #[must_use]
    pub fn with_rcpt_to_response_for(
        mut self,
        pattern: impl Into<String>,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .rcpt_to_overrides
            .push((pattern.into(), SmtpResponse::new(code, message)));
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Close the connection without a reply after `count` commands.
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    ///
    /// # Errors
    /// If no local port can be bound.
    ///
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let commands = Arc::clone(&commands);
            let connections = Arc::clone(&connections);
            let shutdown = Arc::clone(&shutdown);

            tokio::spawn(async move {
                while !shutdown.load(Ordering::Relaxed) {
                    let Ok(Ok((stream, _))) =
                        timeout(Duration::from_millis(100), listener.accept()).await
                    else {
                        continue;
                    };

                    connections.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands);
                    tokio::spawn(async move {
                        let _ = MockSmtpServer::handle_client(stream, config, commands).await;
                    });
                }
            });
        }

        Ok(MockSmtpServer {
            addr,
            commands,
            connections,
            shutdown,
        })
    }
}

/// A port on which nothing listens.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
