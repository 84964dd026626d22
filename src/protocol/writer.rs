use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::response::Response;
use crate::error::{ItsError, Result};

/// A fully encoded response: header line plus optional payload
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) header: Vec<u8>,
    pub(crate) payload: Option<Bytes>,
}

/// The single entry point producers use to queue responses.
///
/// Header and payload travel as one queue item, so concurrent senders can
/// never interleave bytes of two responses. Safe to call from any thread.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ResponseSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, response: Response) -> Result<()> {
        if response.tag.carries_image() != response.payload.is_some() {
            return Err(ItsError::system(format!(
                "{} response with mismatched payload",
                response.tag.as_str()
            )));
        }
        let header = response.encode_header()?;
        trace!(
            "Queueing {} response ({} header bytes, {} payload bytes)",
            response.tag.as_str(),
            header.len(),
            response.payload.as_ref().map_or(0, Bytes::len)
        );
        self.tx
            .send(Outbound {
                header,
                payload: response.payload,
            })
            .map_err(|_| ItsError::Shutdown)
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drains the response queue into a byte stream
pub struct ResponseWriter;

impl ResponseWriter {
    /// Spawn the writer task. It exits when every sender is dropped, when a
    /// write fails (cancelling `cancel`), or when `cancel` fires; in the last
    /// case responses already queued are written best-effort first. The task
    /// hands the stream back so the caller can shut it down.
    pub fn spawn<W>(writer: W, cancel: CancellationToken) -> (ResponseSender, JoinHandle<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, rx) = ResponseSender::channel();
        let handle = tokio::spawn(run_writer(writer, rx, cancel));
        (sender, handle)
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) -> W
where
    W: AsyncWrite + Unpin,
{
    debug!("Response writer started");
    let mut written = 0usize;

    loop {
        tokio::select! {
            biased;

            message = rx.recv() => match message {
                Some(outbound) => {
                    if let Err(e) = write_outbound(&mut writer, &outbound).await {
                        error!("Failed to write response: {}", e);
                        cancel.cancel();
                        break;
                    }
                    written += 1;
                }
                None => break,
            },

            _ = cancel.cancelled() => {
                rx.close();
                while let Some(outbound) = rx.recv().await {
                    if let Err(e) = write_outbound(&mut writer, &outbound).await {
                        warn!("Dropping queued responses after write failure: {}", e);
                        break;
                    }
                    written += 1;
                }
                break;
            }
        }
    }

    info!("Response writer stopped after {} responses", written);
    writer
}

async fn write_outbound<W>(writer: &mut W, outbound: &Outbound) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&outbound.header).await?;
    if let Some(payload) = &outbound.payload {
        writer.write_all(payload).await?;
    }
    writer.flush().await
}
