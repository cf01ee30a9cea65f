//! Unix-domain socket listener: one envelope per newline-terminated
//! line, per-connection reader/writer tasks, graceful stop that
//! unlinks the socket file.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::conn::ConnectionHandle;
use crate::router::MessageRouter;

/// Bind the Unix socket at `path`, creating parent directories and
/// removing any stale socket file left from a previous run. Serves
/// until `shutdown` fires, then unlinks the socket.
pub async fn serve(
    path: PathBuf,
    router: Arc<MessageRouter>,
    mut shutdown: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if path.exists() {
        tokio::fs::remove_file(&path).await?;
    }
    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "unix socket listening");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, router).await {
                        warn!(error = %e, "unix connection ended with error");
                    }
                });
            }
        }
    }

    let _ = tokio::fs::remove_file(&path).await;
    Ok(())
}

async fn handle_connection(stream: UnixStream, router: Arc<MessageRouter>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (conn, mut outgoing) = ConnectionHandle::new();

    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = outgoing.recv().await {
            let mut line = envelope.encode();
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }
        if let Some(envelope) = crate::transport::decode_or_report(&line, &conn) {
            router.handle(envelope, conn.clone()).await;
        }
    }

    crate::transport::dispatch_loop_exit(&router, &conn).await;
    writer_task.abort();
    Ok(())
}
