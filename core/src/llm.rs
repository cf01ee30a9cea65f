//! LLM request queue: priority scheduling with FIFO tie-breaks and
//! bounded concurrency, plus the HTTP chat capability it dispatches to.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify, Semaphore};

use crate::error::{MistError, Result};
use crate::storage::Storage;

pub const PRIORITY_ADMIN: u8 = 0;
pub const PRIORITY_AGENT: u8 = 1;

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub command: Option<String>,
    pub temperature: f32,
    pub system: Option<String>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        ChatRequest { prompt: prompt.into(), temperature: 0.3, ..Default::default() }
    }
}

/// The synchronous-at-the-boundary `chat(prompt, model, system) -> text`
/// capability the core is given, not implemented here.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// A `chat` capability backed by a local HTTP inference server speaking
/// the Ollama-style `/api/generate` contract.
///
/// Model resolution mirrors the original Ollama wrapper: an explicit
/// `request.model` wins, otherwise the settings chain (`model_<command>`
/// then `model`, falling back to the built-in default) is consulted.
pub struct HttpLlmClient {
    base_url: String,
    http: reqwest::Client,
    storage: Arc<Storage>,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, storage: Arc<Storage>) -> Self {
        HttpLlmClient { base_url: base_url.into(), http: reqwest::Client::new(), storage }
    }
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let resolved;
        let model = match request.model.as_deref() {
            Some(m) => m,
            None => {
                let settings = self.storage.settings.lock().expect("settings mutex poisoned");
                resolved = settings.get_model(request.command.as_deref());
                &resolved
            }
        };
        let body = GenerateRequest {
            model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: false,
            options: GenerateOptions { temperature: request.temperature },
        };
        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| MistError::Llm(e.to_string()))?
            .error_for_status()
            .map_err(|e| MistError::Llm(e.to_string()))?
            .json::<GenerateResponse>()
            .await
            .map_err(|e| MistError::Llm(e.to_string()))?;
        Ok(resp.response)
    }
}

struct QueueItem {
    priority: u8,
    seq: u64,
    request: ChatRequest,
    reply: oneshot::Sender<Result<String>>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueItem {}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want lower priority number and
        // lower seq dequeued first, so reverse both comparisons.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of pending LLM calls. Two levels, `PRIORITY_ADMIN`
/// dequeued ahead of `PRIORITY_AGENT`; ties broken by arrival order.
/// Bounded concurrency is enforced by a semaphore acquired per dequeued
/// item so the dispatch loop itself is never blocked on inference.
pub struct LlmQueue {
    heap: AsyncMutex<BinaryHeap<QueueItem>>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    seq: AtomicU64,
    client: Arc<dyn LlmClient>,
}

impl LlmQueue {
    pub fn new(client: Arc<dyn LlmClient>, max_concurrent: usize) -> Arc<Self> {
        Arc::new(LlmQueue {
            heap: AsyncMutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            seq: AtomicU64::new(0),
            client,
        })
    }

    /// Enqueue a request at the given priority and await its result.
    pub async fn submit(self: &Arc<Self>, request: ChatRequest, priority: u8) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut heap = self.heap.lock().await;
            heap.push(QueueItem { priority, seq, request, reply: tx });
        }
        self.notify.notify_one();
        rx.await.map_err(|_| MistError::Llm("llm worker dropped the request".to_string()))?
    }

    /// Background dispatch loop: pop the highest-priority item and spawn
    /// its inference call without blocking the next pop.
    pub async fn run(self: Arc<Self>) {
        loop {
            let item = loop {
                let mut heap = self.heap.lock().await;
                if let Some(item) = heap.pop() {
                    break item;
                }
                drop(heap);
                self.notify.notified().await;
            };

            let semaphore = self.semaphore.clone();
            let client = self.client.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let result = client.chat(&item.request).await;
                let _ = item.reply.send(result);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingClient {
        order: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl LlmClient for RecordingClient {
        async fn chat(&self, request: &ChatRequest) -> Result<String> {
            self.order.lock().unwrap().push(request.prompt.clone());
            Ok(format!("echo: {}", request.prompt))
        }
    }

    #[tokio::test]
    async fn admin_priority_dispatches_before_agent() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let client = Arc::new(RecordingClient { order: order.clone() });
        let queue = LlmQueue::new(client, 1);
        tokio::spawn(queue.clone().run());

        // Submit agent-priority first, then admin-priority, before either
        // has a chance to be dequeued, by not awaiting between pushes.
        let agent_fut = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(ChatRequest::new("agent"), PRIORITY_AGENT).await })
        };
        tokio::task::yield_now().await;
        let admin_fut = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(ChatRequest::new("admin"), PRIORITY_ADMIN).await })
        };

        let _ = admin_fut.await.unwrap().unwrap();
        let _ = agent_fut.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn submit_returns_chat_result() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let client = Arc::new(RecordingClient { order });
        let queue = LlmQueue::new(client, 1);
        tokio::spawn(queue.clone().run());
        let result = queue.submit(ChatRequest::new("hello"), PRIORITY_AGENT).await.unwrap();
        assert_eq!(result, "echo: hello");
    }
}
