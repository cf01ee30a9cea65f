//! WebSocket listener: one envelope per WebSocket text message, mirroring
//! the Unix listener's per-connection reader/writer split.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::conn::ConnectionHandle;
use crate::router::MessageRouter;

/// Bind `(host, port)` and accept WebSocket clients until `shutdown` fires.
pub async fn serve(
    host: String,
    port: u16,
    router: Arc<MessageRouter>,
    mut shutdown: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid ws address: {e}"))
    })?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "websocket listening");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, router).await {
                        warn!(error = %e, "websocket connection ended with error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, router: Arc<MessageRouter>) -> std::io::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let (mut sink, mut source) = ws_stream.split();

    let (conn, mut outgoing) = ConnectionHandle::new();

    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = outgoing.recv().await {
            if sink.send(Message::Text(envelope.encode())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                if let Some(envelope) = crate::transport::decode_or_report(&text, &conn) {
                    router.handle(envelope, conn.clone()).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    crate::transport::dispatch_loop_exit(&router, &conn).await;
    writer_task.abort();
    Ok(())
}
