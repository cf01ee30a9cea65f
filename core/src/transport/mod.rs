//! Accept clients on a Unix-domain socket and a WebSocket, decode one
//! framed envelope at a time, and hand each to the router along with
//! the originating connection handle.

pub mod client;
pub mod unix;
pub mod websocket;

use std::sync::Arc;

use tracing::warn;

use crate::conn::ConnectionHandle;
use crate::envelope::{Envelope, ProtocolError, MSG_ERROR};
use crate::router::MessageRouter;

/// Decode one line/message; on failure, send a single `error` envelope
/// addressed to `"unknown"` back on the same connection rather than
/// dropping it.
pub(crate) fn decode_or_report(line: &str, conn: &ConnectionHandle) -> Option<Envelope> {
    match Envelope::decode(line) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(error = %err, "malformed envelope");
            let error = malformed_envelope_error(&err);
            let _ = conn.send(error);
            None
        }
    }
}

fn malformed_envelope_error(err: &ProtocolError) -> Envelope {
    let mut payload = std::collections::BTreeMap::new();
    payload.insert("error".to_string(), serde_json::Value::String(err.to_string()));
    Envelope::create(MSG_ERROR, "broker", "unknown", payload)
}

pub(crate) async fn dispatch_loop_exit(router: &Arc<MessageRouter>, conn: &ConnectionHandle) {
    router.handle_connection_lost(conn).await;
}
