use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use super::handlers::CommandHandler;
use crate::config::ServerConfig;
use crate::error::{ItsError, ProtocolError, Result};
use crate::protocol::{Command, ResponseWriter};

/// Serve one client until it disconnects, a fatal error occurs or `shutdown`
/// fires.
///
/// Commands are executed strictly one at a time. Responses are written by a
/// separate task so device callbacks never block on the socket.
pub async fn serve_connection<S>(
    handler: &mut CommandHandler,
    stream: S,
    shutdown: &CancellationToken,
    config: &ServerConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = info_span!("session", id = %Uuid::new_v4());
    run_session(handler, stream, shutdown, config)
        .instrument(span)
        .await
}

async fn run_session<S>(
    handler: &mut CommandHandler,
    stream: S,
    shutdown: &CancellationToken,
    config: &ServerConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!("Session started");
    let (read_half, write_half) = tokio::io::split(stream);
    let cancel = shutdown.child_token();
    let (responses, mut writer) = ResponseWriter::spawn(write_half, cancel.clone());
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(config.max_line_bytes),
    );
    let mut handled = 0usize;

    let outcome = loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = cancel.cancelled() => break Err(ItsError::Shutdown),
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                let e = ItsError::from(ProtocolError::LineTooLong {
                    limit: config.max_line_bytes,
                });
                error!("Rejecting command: {}", e);
                break Err(e);
            }
            Some(Err(LinesCodecError::Io(e))) => break Err(e.into()),
            None => {
                info!("Client closed the connection");
                break Ok(());
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!("Received: {}", line);

        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                let e = ItsError::from(e);
                if e.is_fatal() {
                    error!("Rejecting command: {}", e);
                    break Err(e);
                }
                warn!("Ignoring line: {}", e);
                continue;
            }
        };

        let name = command.name();
        debug!("Handling {}", name);
        if let Err(e) = handler.handle(command, &responses, &cancel).await {
            error!("{} failed: {}", name, e);
            break Err(e);
        }
        handled += 1;
    };

    handler.end_session();

    // Stopping the writer flushes whatever is still queued.
    drop(responses);
    cancel.cancel();
    let drain_timeout = config.drain_timeout();
    match tokio::time::timeout(drain_timeout, &mut writer).await {
        Ok(Ok(mut write_half)) => {
            if let Err(e) = write_half.shutdown().await {
                debug!("Socket shutdown failed: {}", e);
            }
        }
        Ok(Err(e)) => warn!("Response writer task failed: {}", e),
        Err(_) => {
            warn!("Responses not drained within {:?}, dropping them", drain_timeout);
            writer.abort();
        }
    }

    info!("Session ended after {} commands", handled);
    outcome
}
