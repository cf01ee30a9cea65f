//! The dispatch spine of the core: routes envelopes by type, tracks
//! pending commands, and forwards replies by `reply_to`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::conn::ConnectionHandle;
use crate::dispatcher::ServiceDispatcher;
use crate::envelope::{
    Envelope, MSG_AGENT_BROADCAST, MSG_AGENT_CATALOG, MSG_AGENT_DISCONNECT, MSG_AGENT_LIST,
    MSG_AGENT_MESSAGE, MSG_AGENT_READY, MSG_AGENT_REGISTER, MSG_COMMAND, MSG_ERROR, MSG_RESPONSE,
    MSG_RESPONSE_CHUNK, MSG_RESPONSE_END, MSG_SERVICE_REQUEST,
};
use crate::registry::{AgentRegistry, Manifest};

pub const BROKER_ID: &str = "broker";

/// The router's memory of a forwarded `command` awaiting its `response`.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub origin: ConnectionHandle,
    pub target_agent_id: String,
}

/// Invoked directly for envelopes addressed to the in-process privileged
/// agent, bypassing the connection-forwarding path entirely.
#[async_trait]
pub trait AdminHandler: Send + Sync {
    async fn handle(&self, router: &MessageRouter, msg: Envelope);
}

pub struct MessageRouter {
    registry: AgentRegistry,
    pending: DashMap<String, PendingCommand>,
    admin_handler: tokio::sync::RwLock<Option<std::sync::Arc<dyn AdminHandler>>>,
    dispatcher: tokio::sync::RwLock<Option<std::sync::Arc<ServiceDispatcher>>>,
    ui_connections: DashMap<u64, ConnectionHandle>,
}

impl MessageRouter {
    pub fn new(registry: AgentRegistry) -> Self {
        MessageRouter {
            registry,
            pending: DashMap::new(),
            admin_handler: tokio::sync::RwLock::new(None),
            dispatcher: tokio::sync::RwLock::new(None),
            ui_connections: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub async fn set_admin_handler(&self, handler: std::sync::Arc<dyn AdminHandler>) {
        *self.admin_handler.write().await = Some(handler);
    }

    pub async fn set_dispatcher(&self, dispatcher: std::sync::Arc<ServiceDispatcher>) {
        *self.dispatcher.write().await = Some(dispatcher);
    }

    pub fn add_ui_connection(&self, conn: ConnectionHandle) {
        self.ui_connections.insert(conn.id(), conn);
    }

    pub fn remove_ui_connection(&self, conn: &ConnectionHandle) {
        self.ui_connections.remove(&conn.id());
    }

    pub fn broadcast_to_ui(&self, envelope: Envelope) {
        for entry in self.ui_connections.iter() {
            let _ = entry.value().send(envelope.clone());
        }
    }

    /// Entry point: dispatch one envelope arriving on `conn`.
    pub async fn handle(&self, msg: Envelope, conn: ConnectionHandle) {
        match msg.r#type.as_str() {
            MSG_AGENT_REGISTER => self.on_register(msg, conn).await,
            MSG_AGENT_DISCONNECT => self.on_disconnect(conn).await,
            MSG_AGENT_LIST => self.on_list(msg, conn).await,
            MSG_COMMAND => self.on_command(msg, conn).await,
            MSG_RESPONSE => self.on_response(msg).await,
            MSG_RESPONSE_CHUNK | MSG_RESPONSE_END => self.on_response(msg).await,
            MSG_SERVICE_REQUEST => self.on_service_request(msg, conn).await,
            MSG_AGENT_MESSAGE => self.on_agent_message(msg, conn).await,
            MSG_AGENT_BROADCAST => self.on_agent_broadcast(msg).await,
            other => {
                warn!(msg_type = other, "unknown message type");
                self.send_error(&conn, &msg, &format!("unknown message type: {other}"));
            }
        }
    }

    /// Called when a connection's reader task observes EOF or a fatal
    /// transport error; unregisters the agent (if any) and purges its
    /// pending commands.
    pub async fn handle_connection_lost(&self, conn: &ConnectionHandle) {
        self.remove_ui_connection(conn);
        if let Some(entry) = self.registry.unregister_by_conn(conn) {
            info!(agent_id = %entry.agent_id, "agent disconnected");
            self.purge_pending_for(&entry.agent_id);
        }
    }

    async fn on_register(&self, msg: Envelope, conn: ConnectionHandle) {
        let manifest: Manifest = match crate::envelope::payload_as(&msg.payload) {
            Ok(m) => m,
            Err(e) => {
                self.send_error(&conn, &msg, &format!("invalid manifest: {e}"));
                return;
            }
        };
        let entry = self.registry.register(Some(conn.clone()), manifest, false);
        info!(agent_id = %entry.agent_id, "agent registered");
        let mut payload = BTreeMap::new();
        payload.insert("agent_id".to_string(), Value::String(entry.agent_id.clone()));
        let reply = Envelope::reply(&msg, BROKER_ID, MSG_AGENT_READY, payload);
        let _ = conn.send(reply);
    }

    async fn on_disconnect(&self, conn: ConnectionHandle) {
        self.handle_connection_lost(&conn).await;
    }

    async fn on_list(&self, msg: Envelope, conn: ConnectionHandle) {
        let catalog = self.registry.build_catalog();
        let mut payload = BTreeMap::new();
        payload.insert("agents".to_string(), json!(catalog));
        let reply = Envelope::reply(&msg, BROKER_ID, MSG_AGENT_CATALOG, payload);
        let _ = conn.send(reply);
    }

    async fn on_command(&self, msg: Envelope, conn: ConnectionHandle) {
        let Some(target) = self.registry.get_by_id(&msg.to) else {
            self.send_error(&conn, &msg, &format!("unknown agent: {}", msg.to));
            return;
        };

        self.pending.insert(
            msg.id.clone(),
            PendingCommand { origin: conn.clone(), target_agent_id: target.agent_id.clone() },
        );

        if target.privileged && target.connection.is_none() {
            let handler = self.admin_handler.read().await.clone();
            if let Some(handler) = handler {
                debug!(target = %target.agent_id, "dispatching command to in-process agent");
                handler.handle(self, msg).await;
            } else {
                warn!("no admin handler registered");
                self.pending.remove(&msg.id);
                self.send_error(&conn, &msg, "admin handler not ready");
            }
            return;
        }

        self.forward_command(&target.agent_id, msg.clone());
    }

    /// Forward a command envelope (unchanged id) to its target's
    /// connection. On send failure, the target is treated as
    /// disconnected: its pendings are purged and each origin is told.
    pub fn forward_command(&self, target_agent_id: &str, msg: Envelope) {
        let Some(target) = self.registry.get_by_id(target_agent_id) else {
            return;
        };
        let Some(target_conn) = target.connection.clone() else {
            return;
        };
        if target_conn.send(msg).is_err() {
            warn!(agent_id = %target_agent_id, "forward failed, treating as disconnected");
            self.registry.unregister(target_agent_id);
            self.purge_pending_for(target_agent_id);
        }
    }

    async fn on_response(&self, msg: Envelope) {
        let Some(reply_to) = msg.reply_to.clone() else {
            warn!("response missing reply_to, dropping");
            return;
        };
        let Some((_, pending)) = self.pending.remove(&reply_to) else {
            debug!(reply_to = %reply_to, "no pending command for response, dropping");
            return;
        };
        let _ = pending.origin.send(msg);
    }

    /// Used by the admin handler to send its own responses back through
    /// the pending-command table, exactly as a forwarded agent's
    /// `response` would be handled.
    pub fn deliver_response(&self, msg: Envelope) {
        if let Some(reply_to) = &msg.reply_to {
            if let Some((_, pending)) = self.pending.remove(reply_to) {
                let _ = pending.origin.send(msg);
                return;
            }
        }
        self.broadcast_to_ui(msg);
    }

    async fn on_service_request(&self, msg: Envelope, conn: ConnectionHandle) {
        let dispatcher = self.dispatcher.read().await.clone();
        let Some(dispatcher) = dispatcher else {
            self.send_error(&conn, &msg, "service dispatcher not ready");
            return;
        };
        let reply = dispatcher.dispatch(&msg).await;
        let _ = conn.send(reply);
    }

    async fn on_agent_message(&self, msg: Envelope, conn: ConnectionHandle) {
        let Some(target) = self.registry.get_by_id(&msg.to) else {
            self.send_error(&conn, &msg, &format!("unknown agent: {}", msg.to));
            return;
        };
        if let Some(target_conn) = target.connection {
            let _ = target_conn.send(msg);
        } else {
            self.send_error(&conn, &msg, &format!("agent has no connection: {}", msg.to));
        }
    }

    async fn on_agent_broadcast(&self, msg: Envelope) {
        let handler = self.admin_handler.read().await.clone();
        for entry in self.registry.all_agents() {
            if entry.agent_id == msg.sender {
                continue;
            }
            if entry.privileged && entry.connection.is_none() {
                if let Some(handler) = &handler {
                    handler.handle(self, msg.clone()).await;
                }
                continue;
            }
            if let Some(conn) = &entry.connection {
                let _ = conn.send(msg.clone());
            }
        }
    }

    fn purge_pending_for(&self, agent_id: &str) {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().target_agent_id == agent_id)
            .map(|e| e.key().clone())
            .collect();
        for id in stale {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let mut payload = BTreeMap::new();
                payload.insert(
                    "error".to_string(),
                    Value::String(format!("agent disconnected: {agent_id}")),
                );
                let error = Envelope::create(MSG_ERROR, BROKER_ID, "unknown", payload);
                let _ = pending.origin.send(error);
            }
        }
    }

    fn send_error(&self, conn: &ConnectionHandle, original: &Envelope, reason: &str) {
        let mut payload = BTreeMap::new();
        payload.insert("error".to_string(), Value::String(reason.to_string()));
        let error = Envelope::reply(original, BROKER_ID, MSG_ERROR, payload);
        let _ = conn.send(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ManifestCommand;

    fn manifest(name: &str) -> Manifest {
        Manifest { name: name.to_string(), description: None, commands: vec![], panels: Value::Null }
    }

    #[tokio::test]
    async fn register_then_list_round_trip() {
        let router = MessageRouter::new(AgentRegistry::new());
        let (conn_a, mut rx_a) = ConnectionHandle::new();
        let mut register_payload = BTreeMap::new();
        register_payload.insert("name".to_string(), Value::String("mist".to_string()));
        let register = Envelope::create(MSG_AGENT_REGISTER, "client", BROKER_ID, register_payload);
        router.handle(register, conn_a.clone()).await;
        let ready = rx_a.try_recv().unwrap();
        assert_eq!(ready.r#type, MSG_AGENT_READY);
        assert_eq!(ready.payload["agent_id"], Value::String("mist-0".to_string()));

        let (conn_b, mut rx_b) = ConnectionHandle::new();
        let list = Envelope::create(MSG_AGENT_LIST, "ui", BROKER_ID, BTreeMap::new());
        router.handle(list, conn_b).await;
        let catalog = rx_b.try_recv().unwrap();
        assert_eq!(catalog.r#type, MSG_AGENT_CATALOG);
        let agents = catalog.payload["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0]["agent_id"], Value::String("mist-0".to_string()));
    }

    #[tokio::test]
    async fn command_round_trip_to_connected_agent() {
        let router = MessageRouter::new(AgentRegistry::new());
        let (agent_conn, mut agent_rx) = ConnectionHandle::new();
        let mut m = manifest("echo");
        m.commands.push(ManifestCommand::Name("ping".to_string()));
        let entry = router.registry().register(Some(agent_conn.clone()), m, false);

        let (ui_conn, mut ui_rx) = ConnectionHandle::new();
        let mut payload = BTreeMap::new();
        payload.insert("text".to_string(), Value::String("hello".to_string()));
        let cmd = Envelope::create(MSG_COMMAND, "ui", &entry.agent_id, payload);
        let cmd_id = cmd.id.clone();
        router.handle(cmd, ui_conn).await;

        let forwarded = agent_rx.try_recv().unwrap();
        assert_eq!(forwarded.id, cmd_id);

        let mut reply_payload = BTreeMap::new();
        reply_payload.insert("text".to_string(), Value::String("echoed: hello".to_string()));
        let response = Envelope::reply(&forwarded, &entry.agent_id, MSG_RESPONSE, reply_payload);
        router.handle(response, agent_conn).await;

        let delivered = ui_rx.try_recv().unwrap();
        assert_eq!(delivered.payload["text"], Value::String("echoed: hello".to_string()));
    }

    #[tokio::test]
    async fn unknown_target_returns_error() {
        let router = MessageRouter::new(AgentRegistry::new());
        let (conn, mut rx) = ConnectionHandle::new();
        let cmd = Envelope::create(MSG_COMMAND, "ui", "ghost-0", BTreeMap::new());
        router.handle(cmd, conn).await;
        let error = rx.try_recv().unwrap();
        assert_eq!(error.r#type, MSG_ERROR);
    }

    #[tokio::test]
    async fn disconnect_purges_pending_and_notifies_origin() {
        let router = MessageRouter::new(AgentRegistry::new());
        let (agent_conn, _agent_rx) = ConnectionHandle::new();
        let entry = router.registry().register(Some(agent_conn.clone()), manifest("echo"), false);

        let (ui_conn, mut ui_rx) = ConnectionHandle::new();
        let cmd = Envelope::create(MSG_COMMAND, "ui", &entry.agent_id, BTreeMap::new());
        router.handle(cmd, ui_conn).await;

        router.handle_connection_lost(&agent_conn).await;
        let error = ui_rx.try_recv().unwrap();
        assert_eq!(error.r#type, MSG_ERROR);
        assert!(error.payload["error"].as_str().unwrap().contains("agent disconnected"));
    }
}
