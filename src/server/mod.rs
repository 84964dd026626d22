mod connection;
mod handlers;
#[cfg(test)]
mod tests;

pub use connection::serve_connection;
pub use handlers::CommandHandler;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ItsError, Result};

/// TCP front end: one client at a time, the listener closed while a session
/// is active.
pub struct ItsServer {
    config: ServerConfig,
    handler: CommandHandler,
}

impl ItsServer {
    pub fn new(config: ServerConfig, handler: CommandHandler) -> Self {
        Self { config, handler }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.config.address();
        TcpListener::bind(&address).await.map_err(|e| {
            ItsError::system(format!("Failed to bind server to {}: {}", address, e))
        })
    }

    /// Accept sessions until `shutdown` fires, or after the first one when
    /// configured for a single session.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let listener = self.bind().await?;
            info!("Listening on {}", self.config.address());

            if !self.serve_next(listener, &shutdown).await? {
                break;
            }
            if self.config.single_session {
                info!("Single session complete, not accepting further clients");
                break;
            }
            if shutdown.is_cancelled() {
                break;
            }
        }
        Ok(())
    }

    /// Accept one client on `listener` and serve it to completion. The
    /// listener is dropped as soon as the client is accepted. Returns false
    /// if shutdown arrived before any client did.
    pub async fn serve_next(
        &mut self,
        listener: TcpListener,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => {
                info!("Shutdown requested while waiting for a client");
                return Ok(false);
            }
        };
        drop(listener);
        info!("Accepted connection from {}", peer);

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Unable to disable Nagle on {}: {}", peer, e);
        }

        match serve_connection(&mut self.handler, stream, shutdown, &self.config).await {
            Ok(()) => info!("Session with {} finished", peer),
            Err(e) if shutdown.is_cancelled() => {
                info!("Session with {} interrupted by shutdown: {}", peer, e)
            }
            Err(e) => error!("Session with {} terminated: {}", peer, e),
        }
        Ok(true)
    }

    /// Release the device. The server cannot serve again afterwards.
    pub fn close(&mut self) -> Result<()> {
        self.handler.close()
    }
}
