use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use hermes_common::{outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    error::{ClientError, Result},
    response::Response,
};
use crate::codec;

const BUFFER_SIZE: usize = 8192;

/// Replies larger than this are treated as a protocol error.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };

        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }

        Ok(n)
    }

    async fn into_tls(self, server_name: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError(String::from(
                "Connection is already TLS",
            )));
        };

        let connector = TlsConnector::from(Arc::new(client_config(accept_invalid_certs)?));
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid server name: {e}")))?;

        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::Tls(Box::new(stream)))
    }
}

fn client_config(accept_invalid_certs: bool) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        roots
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !native.errors.is_empty() {
        tracing::warn!(errors = ?native.errors, "Some native certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(config)
}

/// Accepts any certificate. Only reachable through
/// [`SmtpClient::accept_invalid_certs`].
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// SASL mechanisms the client knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    fn from_keyword(keyword: &str) -> Option<Self> {
        if keyword.eq_ignore_ascii_case("PLAIN") {
            Some(Self::Plain)
        } else if keyword.eq_ignore_ascii_case("LOGIN") {
            Some(Self::Login)
        } else {
            None
        }
    }
}

/// One SMTP connection, driven a command at a time.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_name: String,
    accept_invalid_certs: bool,
    capabilities: Vec<String>,
}

impl SmtpClient {
    /// Open a plaintext connection. `server_name` is what the certificate is
    /// checked against if the session later upgrades.
    ///
    /// # Errors
    /// If the TCP connection cannot be established.
    pub async fn connect(addr: impl ToSocketAddrs, server_name: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0; BUFFER_SIZE],
            buffer_pos: 0,
            server_name: server_name.into(),
            accept_invalid_certs: false,
            capabilities: Vec::new(),
        })
    }

    /// Open a connection that is TLS from the first byte (SMTPS, port 465).
    ///
    /// # Errors
    /// If the connection or the handshake fails.
    pub async fn connect_tls(
        addr: impl ToSocketAddrs,
        server_name: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let mut client = Self::connect(addr, server_name)
            .await?
            .accept_invalid_certs(accept_invalid_certs);
        client.upgrade().await?;
        Ok(client)
    }

    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Keywords from the most recent successful `EHLO`, as sent.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Whether the last `EHLO` advertised `keyword`.
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.capabilities.iter().any(|capability| {
            capability
                .split_whitespace()
                .next()
                .is_some_and(|k| k.eq_ignore_ascii_case(keyword))
        })
    }

    /// Mechanisms listed in the `AUTH` capability that this client speaks.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        self.capabilities
            .iter()
            .filter_map(|capability| {
                let mut words = capability.split_whitespace();
                words
                    .next()
                    .is_some_and(|k| k.eq_ignore_ascii_case("AUTH"))
                    .then_some(words)
            })
            .flatten()
            .filter_map(AuthMechanism::from_keyword)
            .collect()
    }

    /// # Errors
    /// If the connection fails or the greeting cannot be parsed.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Send one line. The CRLF is added here.
    ///
    /// # Errors
    /// If the connection is gone or the write fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");
        self.write_line(command).await
    }

    /// Send a line carrying credentials; only `shown` is logged.
    async fn send_secret(&mut self, secret: &str, shown: &str) -> Result<()> {
        outgoing!("{shown}");
        self.write_line(secret).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(format!("{line}\r\n").as_bytes())
            .await
    }

    /// # Errors
    /// If sending fails or the reply cannot be read.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Send `EHLO`, remembering the advertised extensions on success.
    ///
    /// # Errors
    /// If the exchange fails at the transport level.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;

        self.capabilities = if response.is_success() {
            response.lines.iter().skip(1).cloned().collect()
        } else {
            Vec::new()
        };

        Ok(response)
    }

    /// # Errors
    /// If the exchange fails at the transport level.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.capabilities.clear();
        self.command(&format!("HELO {domain}")).await
    }

    /// Send `STARTTLS` and, on a 220, run the handshake.
    ///
    /// Capabilities are forgotten either way once the upgrade happens; the
    /// caller must `EHLO` again.
    ///
    /// # Errors
    /// If the exchange or the handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            self.upgrade().await?;
            self.capabilities.clear();
        }

        Ok(response)
    }

    async fn upgrade(&mut self) -> Result<()> {
        let connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
        self.buffer_pos = 0;
        self.connection = Some(
            connection
                .into_tls(&self.server_name, self.accept_invalid_certs)
                .await?,
        );
        tracing::debug!(server = %self.server_name, "Client connection upgraded to TLS");
        Ok(())
    }

    /// Log in with `PLAIN` when the server offers it and `LOGIN` otherwise.
    ///
    /// # Errors
    /// [`ClientError::AuthFailed`] when the server refuses the credentials.
    pub async fn authenticate(&mut self, user: &str, password: &str) -> Result<Response> {
        let response = if self.auth_mechanisms().contains(&AuthMechanism::Plain) {
            self.auth_plain(user, password).await?
        } else {
            self.auth_login(user, password).await?
        };

        if response.is_success() {
            Ok(response)
        } else {
            Err(ClientError::AuthFailed(response.to_string()))
        }
    }

    /// RFC 4616 with an initial response.
    ///
    /// # Errors
    /// If the exchange fails at the transport level.
    pub async fn auth_plain(&mut self, user: &str, password: &str) -> Result<Response> {
        let token = STANDARD.encode(format!("\0{user}\0{password}"));
        self.send_secret(&format!("AUTH PLAIN {token}"), "AUTH PLAIN <redacted>")
            .await?;
        self.read_response().await
    }

    /// The `LOGIN` mechanism: username then password, each after a 334.
    ///
    /// # Errors
    /// If the exchange fails at the transport level.
    pub async fn auth_login(&mut self, user: &str, password: &str) -> Result<Response> {
        let response = self.command("AUTH LOGIN").await?;
        if response.code != 334 {
            return Ok(response);
        }

        self.send_secret(&STANDARD.encode(user), "<credentials>")
            .await?;
        let response = self.read_response().await?;
        if response.code != 334 {
            return Ok(response);
        }

        self.send_secret(&STANDARD.encode(password), "<credentials>")
            .await?;
        self.read_response().await
    }

    /// `MAIL FROM`. An empty `from` sends the null reverse-path.
    ///
    /// # Errors
    /// If the exchange fails at the transport level.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let command = match size {
            Some(size) if self.supports("SIZE") => format!("MAIL FROM:<{from}> SIZE={size}"),
            _ => format!("MAIL FROM:<{from}>"),
        };
        self.command(&command).await
    }

    /// # Errors
    /// If the exchange fails at the transport level.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    /// If the exchange fails at the transport level.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Send the message content after a 354, dot-stuffed and terminated.
    ///
    /// # Errors
    /// If the write fails or the final reply cannot be read.
    pub async fn send_data(&mut self, content: &[u8]) -> Result<Response> {
        let payload = codec::data_payload(content);
        outgoing!("<{} bytes of message content>", payload.len());

        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(&payload)
            .await?;

        self.read_response().await
    }

    /// Send `QUIT` and drop the connection whatever the answer.
    ///
    /// # Errors
    /// If the exchange fails at the transport level.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        self.connection = None;
        response
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                tracing::trace!(code = response.code, "Reply received");
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let grown = self.buffer.len() * 2;
                if grown > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Reply exceeds {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(grown, 0);
            }

            let n = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?
                .read(&mut self.buffer[self.buffer_pos..])
                .await?;
            self.buffer_pos += n;
        }
    }
}
