use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use hermes_common::tracing;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::{
    error::{ConnectionError, ConnectionResult, TlsError, TlsResult},
    session::TlsContext,
};

const BUFFER_SIZE: usize = 8192;

enum Transport<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Only observable if a handshake failed half way.
    Broken,
}

/// A server-side connection that reads whole lines.
///
/// Reads go through an internal buffer, so several pipelined commands that
/// arrive in one segment are handed out one at a time.
pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    transport: Transport<Stream>,
    read_buf: Box<[u8]>,
    read_pos: usize,
    read_len: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self {
            transport: Transport::Plain(stream),
            read_buf: vec![0; BUFFER_SIZE].into_boxed_slice(),
            read_pos: 0,
            read_len: 0,
        }
    }

    #[cfg(test)]
    pub(crate) const fn get_ref(&self) -> Option<&Stream> {
        match &self.transport {
            Transport::Plain(stream) => Some(stream),
            _ => None,
        }
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> ConnectionResult<usize> {
        let buffer = format!("{response}\r\n");

        match &mut self.transport {
            Transport::Plain(stream) => stream.write_all(buffer.as_bytes()).await?,
            Transport::Tls(stream) => stream.write_all(buffer.as_bytes()).await?,
            Transport::Broken => return Err(ConnectionError::Closed),
        }

        Ok(buffer.len())
    }

    async fn fill(&mut self) -> ConnectionResult<usize> {
        let read = match &mut self.transport {
            Transport::Plain(stream) => stream.read(&mut self.read_buf).await?,
            Transport::Tls(stream) => stream.read(&mut self.read_buf).await?,
            Transport::Broken => return Err(ConnectionError::Closed),
        };

        self.read_pos = 0;
        self.read_len = read;

        Ok(read)
    }

    /// Append the next line, including its `\n`, to `line`.
    ///
    /// At most `limit` bytes are appended; a longer line is returned in
    /// pieces. Returns the number of bytes appended, zero at end of stream.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn read_line(&mut self, line: &mut Vec<u8>, limit: usize) -> ConnectionResult<usize> {
        let mut appended = 0;

        while appended < limit {
            if self.read_pos >= self.read_len && self.fill().await? == 0 {
                break;
            }

            let available = &self.read_buf[self.read_pos..self.read_len];
            let wanted = available.len().min(limit - appended);
            let (take, done) = available[..wanted]
                .iter()
                .position(|&b| b == b'\n')
                .map_or((wanted, false), |idx| (idx + 1, true));

            line.extend_from_slice(&available[..take]);
            self.read_pos += take;
            appended += take;

            if done {
                break;
            }
        }

        Ok(appended)
    }

    /// Skip the rest of the current line, up to and including its `\n`.
    ///
    /// Returns the number of bytes dropped.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn discard_line(&mut self) -> ConnectionResult<usize> {
        let mut discarded = 0;

        loop {
            if self.read_pos >= self.read_len && self.fill().await? == 0 {
                return Ok(discarded);
            }

            let available = &self.read_buf[self.read_pos..self.read_len];
            match available.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    self.read_pos += idx + 1;
                    return Ok(discarded + idx + 1);
                }
                None => {
                    discarded += available.len();
                    self.read_pos = self.read_len;
                }
            }
        }
    }

    /// Run the server side of a TLS handshake in place.
    ///
    /// Anything the client pipelined behind `STARTTLS` in plaintext is
    /// discarded.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> TlsResult<()> {
        self.read_pos = 0;
        self.read_len = 0;

        match std::mem::replace(&mut self.transport, Transport::Broken) {
            Transport::Plain(stream) => {
                let stream = acceptor.accept(stream).await?;
                if let Some(version) = stream.get_ref().1.protocol_version() {
                    tracing::debug!(?version, "Connection upgraded");
                }
                self.transport = Transport::Tls(Box::new(stream));
                Ok(())
            }
            other => {
                self.transport = other;
                Err(TlsError::UpgradeFailed(String::from(
                    "Connection is not in plaintext",
                )))
            }
        }
    }
}

fn load_certs<P: AsRef<Path>>(path: &P) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn load_key<P: AsRef<Path>>(path: &P) -> TlsResult<PrivateKeyDer<'static>> {
    let path_str = path.as_ref().display().to_string();
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

/// Build the acceptor once, when the listener is validated.
///
/// # Errors
/// If the certificate or key cannot be read or do not form a valid pair.
pub fn acceptor(tls_context: &TlsContext) -> TlsResult<TlsAcceptor> {
    let certs =
        load_certs(&tls_context.certificate).map_err(|e| TlsError::CertificateLoad {
            path: tls_context.certificate.display().to_string(),
            source: e,
        })?;
    let key = load_key(&tls_context.key)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::Connection;

    #[tokio::test]
    async fn pipelined_lines_come_out_one_at_a_time() {
        let cursor = Cursor::new(b"EHLO a\r\nMAIL FROM:<x@y.z>\r\nQUIT".to_vec());
        let mut connection = Connection::new(cursor);

        let mut line = Vec::new();
        assert_eq!(connection.read_line(&mut line, 1024).await.unwrap(), 8);
        assert_eq!(line, b"EHLO a\r\n");

        line.clear();
        connection.read_line(&mut line, 1024).await.unwrap();
        assert_eq!(line, b"MAIL FROM:<x@y.z>\r\n");

        line.clear();
        connection.read_line(&mut line, 1024).await.unwrap();
        assert_eq!(line, b"QUIT");

        line.clear();
        assert_eq!(connection.read_line(&mut line, 1024).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn long_lines_are_split_at_the_limit() {
        let cursor = Cursor::new(b"abcdefgh\r\n".to_vec());
        let mut connection = Connection::new(cursor);

        let mut line = Vec::new();
        assert_eq!(connection.read_line(&mut line, 4).await.unwrap(), 4);
        assert_eq!(line, b"abcd");
    }

    #[tokio::test]
    async fn discard_line_resumes_after_the_newline() {
        let cursor = Cursor::new(b"abcdefgh\r\nNOOP\r\n".to_vec());
        let mut connection = Connection::new(cursor);

        let mut line = Vec::new();
        connection.read_line(&mut line, 4).await.unwrap();
        assert_eq!(connection.discard_line().await.unwrap(), 6);

        line.clear();
        connection.read_line(&mut line, 1024).await.unwrap();
        assert_eq!(line, b"NOOP\r\n");

        assert_eq!(connection.discard_line().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_appends_crlf() {
        let mut connection = Connection::new(Cursor::new(Vec::new()));
        assert_eq!(connection.send(&"250 Ok").await.unwrap(), 8);
    }
}
