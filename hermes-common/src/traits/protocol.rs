use std::{fmt::Debug, net::SocketAddr};

use serde::Deserialize;
use tokio::net::TcpStream;

use crate::{
    Signal,
    error::{ConfigError, SessionError},
};

pub trait SessionHandler {
    fn run(
        self,
        signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;
}

pub trait Protocol: Default + Send + Sync {
    type Session: SessionHandler + Send + 'static;
    type Args: Default + Clone + Debug + Send + Sync + for<'a> Deserialize<'a>;

    fn handle(&self, stream: TcpStream, peer: SocketAddr, args: &Self::Args) -> Self::Session;

    ///
    /// Validate the arguments being provided to the protocol
    ///
    /// # Errors
    /// When the arguments cannot work, e.g. a TLS certificate path that does
    /// not exist or a listener with no accepted domains.
    ///
    fn validate(&self, args: &mut Self::Args) -> Result<(), ConfigError>;

    fn ty() -> &'static str;
}
