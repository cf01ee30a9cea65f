//! MIST core: the broker process that agents, the TUI, and other clients
//! connect to over a Unix socket or WebSocket.

pub mod admin;
pub mod config;
pub mod conn;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod llm;
pub mod registry;
pub mod router;
pub mod storage;
pub mod transport;

pub use config::{Args, Paths};
pub use dispatcher::ServiceDispatcher;
pub use envelope::Envelope;
pub use error::{MistError, Result};
pub use llm::{HttpLlmClient, LlmClient, LlmQueue};
pub use registry::AgentRegistry;
pub use router::MessageRouter;
pub use storage::Storage;

use std::sync::Arc;

use tokio::sync::oneshot;

use admin::AdminAgent;

const DEFAULT_MAX_CONCURRENT_LLM: usize = 1;

/// The assembled broker: storage, registry/router, LLM queue, the admin
/// agent, and the transport listeners, wired together and ready to serve.
pub struct Mist {
    pub storage: Arc<Storage>,
    pub router: Arc<MessageRouter>,
    pub llm: Arc<LlmQueue>,
    paths: Paths,
    ws_host: String,
    ws_port: u16,
    unix_shutdown: Option<oneshot::Sender<()>>,
    ws_shutdown: Option<oneshot::Sender<()>>,
    unix_task: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
    ws_task: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
}

impl Mist {
    /// Assemble the broker from parsed CLI arguments.
    pub async fn new(args: &Args) -> Result<Self> {
        let paths = Paths::new(args.data_dir.clone());
        let storage = Arc::new(Storage::open(&paths)?);

        let llm_client: Arc<dyn LlmClient> =
            Arc::new(HttpLlmClient::new("http://127.0.0.1:11434", Arc::clone(&storage)));
        let llm = LlmQueue::new(llm_client, DEFAULT_MAX_CONCURRENT_LLM);

        let router = Arc::new(MessageRouter::new(AgentRegistry::new()));
        let dispatcher = Arc::new(ServiceDispatcher::new(Arc::clone(&storage), Arc::clone(&llm)));
        router.set_dispatcher(dispatcher).await;

        let admin = Arc::new(AdminAgent::new(Arc::clone(&storage), Arc::clone(&llm), paths.clone()));
        admin.register(&router);
        router.set_admin_handler(admin).await;

        Ok(Mist {
            storage,
            router,
            llm,
            paths,
            ws_host: args.ws_host.clone(),
            ws_port: args.ws_port,
            unix_shutdown: None,
            ws_shutdown: None,
            unix_task: None,
            ws_task: None,
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Start the LLM queue loop and both transport listeners.
    pub async fn start(&mut self) -> std::io::Result<()> {
        tokio::spawn(Arc::clone(&self.llm).run());

        let (unix_tx, unix_rx) = oneshot::channel();
        let (ws_tx, ws_rx) = oneshot::channel();
        self.unix_shutdown = Some(unix_tx);
        self.ws_shutdown = Some(ws_tx);

        let socket_path = self.paths.socket_path();
        let router = Arc::clone(&self.router);
        self.unix_task = Some(tokio::spawn(transport::unix::serve(socket_path, router, unix_rx)));

        let host = self.ws_host.clone();
        let port = self.ws_port;
        let router = Arc::clone(&self.router);
        self.ws_task = Some(tokio::spawn(transport::websocket::serve(host, port, router, ws_rx)));

        tracing::info!("mist core started");
        Ok(())
    }

    /// Signal both listeners to stop and wait for them to exit.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        if let Some(tx) = self.unix_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.ws_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.unix_task.take() {
            join_listener(task).await?;
        }
        if let Some(task) = self.ws_task.take() {
            join_listener(task).await?;
        }
        tracing::info!("mist core shut down");
        Ok(())
    }
}

async fn join_listener(task: tokio::task::JoinHandle<std::io::Result<()>>) -> std::io::Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
    }
}
