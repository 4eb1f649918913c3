//! Server role: accept connections initiated by the switch

use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::info;

use crate::{
    connection::{EslConnectOptions, EslConnection, EslEventStream},
    error::{EslError, EslResult},
};

/// Listener for outbound-socket connections (`socket` dialplan application).
///
/// Each accepted stream gets its own endpoint, handed out before a single
/// byte has been read. The first command on it should be `connect`.
#[derive(Debug)]
pub struct EslServer {
    listener: TcpListener,
    options: EslConnectOptions,
}

impl EslServer {
    /// Bind with default endpoint options.
    pub async fn bind(addr: impl ToSocketAddrs) -> EslResult<Self> {
        Self::bind_with_options(addr, EslConnectOptions::default()).await
    }

    /// Bind, applying `options` to every accepted endpoint.
    pub async fn bind_with_options(
        addr: impl ToSocketAddrs,
        options: EslConnectOptions,
    ) -> EslResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(EslError::Io)?;
        info!("ESL server listening on {}", listener.local_addr()?);
        Ok(Self::from_listener(listener, options))
    }

    /// Wrap an already-bound listener.
    pub fn from_listener(listener: TcpListener, options: EslConnectOptions) -> Self {
        Self { listener, options }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> EslResult<SocketAddr> {
        Ok(self
            .listener
            .local_addr()?)
    }

    /// Accept the next connection and start an endpoint on it.
    pub async fn accept(&self) -> EslResult<(EslConnection, EslEventStream)> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(EslError::Io)?;
        stream.set_nodelay(true)?;

        let (connection, events) = EslConnection::start(stream, self.options.clone());
        info!(
            "Accepted connection {} from {}",
            connection.id(),
            addr
        );
        Ok((connection, events))
    }
}
