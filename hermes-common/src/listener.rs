use std::net::SocketAddr;

use futures_util::future::join_all;
use serde::Deserialize;
use tokio::{net::TcpListener, sync::broadcast};

use crate::{
    Signal,
    error::{ConfigError, ListenerError},
    internal,
    traits::protocol::{Protocol, SessionHandler},
};

#[derive(Deserialize)]
pub struct Listener<Proto: Protocol> {
    #[serde(skip)]
    handler: Proto,
    socket: SocketAddr,
    #[serde(default)]
    args: Proto::Args,
}

impl<Proto: Protocol> Listener<Proto> {
    #[must_use]
    pub fn new(socket: SocketAddr, args: Proto::Args) -> Self {
        Self {
            handler: Proto::default(),
            socket,
            args,
        }
    }

    #[must_use]
    pub const fn socket(&self) -> SocketAddr {
        self.socket
    }

    pub fn map_args<F>(&mut self, f: F)
    where
        F: Fn(Proto::Args) -> Proto::Args,
    {
        self.args = f(std::mem::take(&mut self.args));
    }

    ///
    /// # Errors
    /// If the protocol rejects its arguments.
    ///
    #[tracing::instrument(skip(self), fields(protocol = Proto::ty(), socket = %self.socket))]
    pub fn init(&mut self) -> Result<(), ConfigError> {
        self.handler.validate(&mut self.args)
    }

    ///
    /// Bind the configured socket and serve until shutdown.
    ///
    /// # Errors
    /// If binding or accepting fails.
    ///
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        let listener =
            TcpListener::bind(self.socket)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: self.socket.to_string(),
                    source,
                })?;

        self.accept_loop(listener, shutdown).await
    }

    ///
    /// Accept connections on an already bound socket, one task per session.
    /// On shutdown, waits for every session to finish.
    ///
    /// # Errors
    /// If accepting a connection fails.
    ///
    #[tracing::instrument(level = "trace", skip_all, fields(protocol = Proto::ty()))]
    pub async fn accept_loop(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        let local = listener.local_addr()?;
        internal!(level = INFO, "{} listening on {}", Proto::ty(), local);

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "{} Listener {} Received Shutdown signal, finishing sessions ...", Proto::ty(), local);
                        join_all(sessions).await;
                        return Ok(());
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("Connection received on {local} from {peer}");

                    let session = self.handler.handle(stream, peer, &self.args);
                    let signal = shutdown.resubscribe();

                    sessions.retain(|s: &tokio::task::JoinHandle<()>| !s.is_finished());
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            internal!(level = ERROR, "Session with {peer} ended: {err}");
                        }
                    }));
                }
            }
        }
    }
}
