//! Newline-delimited JSON bridge between a messenger endpoint and a byte
//! stream, so pane and preview can run in separate processes.
//!
//! Each side keeps one endpoint of a [`Messenger::pair`] and hands the other
//! to [`run_line_bridge`]. Every message the local side sends is written as
//! one envelope per line; every line read is re-sent to the local side.

use super::{Envelope, Messenger, contract::ENVELOPE_VERSION};
use crate::error::{RefreshError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Pump envelopes between `endpoint` and a reader/writer pair until the
/// reader reaches EOF. The endpoint is closed on return, so the local side
/// observes the remote as gone.
///
/// # Errors
///
/// Returns a channel error when reading fails.
pub async fn run_line_bridge<R, W>(
    endpoint: Messenger,
    reader: R,
    writer: W,
    capacity: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
    let seq = std::sync::atomic::AtomicU64::new(0);
    endpoint.bind_all(move |kind, payload| {
        let n = seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Err(e) = tx.try_send(Envelope::new(n, kind, payload)) {
            warn!(kind = %kind, error = %e, "line bridge outbound queue full or closed; dropping");
        }
    });

    let writer_handle = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize envelope; skipping");
                    continue;
                }
            };
            if let Err(e) = write_line(&mut writer, &json).await {
                warn!(error = %e, "line bridge write failed; stopping writer");
                break;
            }
        }
    });

    let result = read_lines(&endpoint, reader).await;
    endpoint.close();
    writer_handle.abort();
    let _ = writer_handle.await;
    result
}

async fn read_lines<R>(endpoint: &Messenger, reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| RefreshError::Channel(format!("failed to read envelope line: {e}")))?;
        if bytes_read == 0 {
            info!("line bridge reader closed (EOF)");
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, raw_line = %trimmed, "failed to parse envelope");
                continue;
            }
        };
        if envelope.v != ENVELOPE_VERSION {
            warn!(version = envelope.v, "unsupported envelope version; skipping");
            continue;
        }
        endpoint.send(envelope.kind, envelope.payload);
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| RefreshError::Channel(format!("failed to write envelope: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| RefreshError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| RefreshError::Channel(format!("failed to flush envelope: {e}")))?;
    Ok(())
}
