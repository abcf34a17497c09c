// src/queue/mod.rs
// Write queue (spec.md §4.F): single-writer serialization across the whole
// process. Realized per spec.md §9's redesign guidance as an actor task
// owning the pool handle, driven by a channel of `Signal` messages —
// `run_exclusive` is a channel variant, not a separate lock.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tracing::warn;

use crate::embedding::EmbeddingClient;
use crate::error::{AgenrError, Result};
use crate::llm::LlmClient;
use crate::storage::pool::AgenrPool;
use crate::storage::{StoreOptions, StoreResult};
use crate::types::KnowledgeEntry;

const RETRY_ATTEMPTS: u32 = 2;
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

type ExclusiveTask = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send>;

struct PendingBatch {
    file_key: String,
    content_hash: String,
    entries: Vec<KnowledgeEntry>,
    options: StoreOptions,
    respond_to: oneshot::Sender<Result<StoreResult>>,
}

enum Signal {
    Wake,
    RunExclusive(ExclusiveTask, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

struct Shared {
    pending: Mutex<VecDeque<PendingBatch>>,
    pending_count: AtomicUsize,
    shutting_down: AtomicBool,
    high_watermark: usize,
    capacity_freed: Notify,
}

/// Handle callers push through. Cloning is cheap (`Arc` inside); every
/// clone talks to the same single-writer actor task.
#[derive(Clone)]
pub struct WriteQueue {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Signal>,
}

impl WriteQueue {
    /// Spawn the actor task and return a handle. `retry_on_failure`
    /// defaults true per spec.md §4.F; pass false to disable the 2-attempt
    /// retry (used by tests that want to see the bare first error).
    pub fn spawn(
        pool: AgenrPool,
        embedder: Arc<dyn EmbeddingClient>,
        judge_llm: Option<Arc<dyn LlmClient>>,
        judge_model: String,
        high_watermark: usize,
        retry_on_failure: bool,
    ) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            pending_count: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            high_watermark,
            capacity_freed: Notify::new(),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_actor(
            Arc::clone(&shared),
            cmd_rx,
            pool,
            embedder,
            judge_llm,
            judge_model,
            retry_on_failure,
        ));

        Self { shared, cmd_tx }
    }

    /// Enqueue a batch tagged with its file. Resolves when that specific
    /// batch has been persisted (or rejected).
    pub async fn push(
        &self,
        entries: Vec<KnowledgeEntry>,
        file_key: impl Into<String>,
        content_hash: impl Into<String>,
        options: StoreOptions,
    ) -> Result<StoreResult> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(AgenrError::Shutdown);
        }

        // Backpressure: block until pending + incoming drops below the
        // high watermark (spec.md §4.F).
        loop {
            let current = self.shared.pending_count.load(Ordering::SeqCst);
            if current < self.shared.high_watermark {
                break;
            }
            self.shared.capacity_freed.notified().await;
        }

        let (tx, rx) = oneshot::channel();
        let batch_len = entries.len();
        {
            let mut pending = self.shared.pending.lock().await;
            pending.push_back(PendingBatch {
                file_key: file_key.into(),
                content_hash: content_hash.into(),
                entries,
                options,
                respond_to: tx,
            });
        }
        self.shared.pending_count.fetch_add(batch_len.max(1), Ordering::SeqCst);

        self.cmd_tx
            .send(Signal::Wake)
            .map_err(|_| AgenrError::Shutdown)?;

        rx.await.map_err(|_| AgenrError::Shutdown)?
    }

    /// Remove all not-yet-started batches for `file_key`; their `push`
    /// callers receive `AgenrError::Cancelled`.
    pub async fn cancel(&self, file_key: &str) {
        let mut pending = self.shared.pending.lock().await;
        let mut i = 0;
        while i < pending.len() {
            if pending[i].file_key == file_key {
                let removed = pending.remove(i).expect("index in bounds");
                self.shared
                    .pending_count
                    .fetch_sub(removed.entries.len().max(1), Ordering::SeqCst);
                let _ = removed.respond_to.send(Err(AgenrError::Cancelled));
            } else {
                i += 1;
            }
        }
        self.shared.capacity_freed.notify_waiters();
    }

    /// Schedule an async action that runs serially with writes — used by
    /// the consolidator for index rebuilds.
    pub async fn run_exclusive<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: ExclusiveTask = Box::new(move || Box::pin(f()));
        self.cmd_tx
            .send(Signal::RunExclusive(task, tx))
            .map_err(|_| AgenrError::Shutdown)?;
        rx.await.map_err(|_| AgenrError::Shutdown)?
    }

    /// Resolves only after every currently enqueued batch has completed.
    pub async fn drain(&self) {
        loop {
            if self.shared.pending_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.shared.capacity_freed.notified().await;
        }
    }

    /// Refuse new pushes; reject pending with `Shutdown`; the in-flight
    /// batch still finishes.
    pub async fn destroy(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let mut pending = self.shared.pending.lock().await;
        while let Some(batch) = pending.pop_front() {
            self.shared
                .pending_count
                .fetch_sub(batch.entries.len().max(1), Ordering::SeqCst);
            let _ = batch.respond_to.send(Err(AgenrError::Shutdown));
        }
        drop(pending);
        self.shared.capacity_freed.notify_waiters();

        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Signal::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Number of entries enqueued but not yet written.
    pub fn pending_count(&self) -> usize {
        self.shared.pending_count.load(Ordering::SeqCst)
    }
}

async fn run_actor(
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::UnboundedReceiver<Signal>,
    pool: AgenrPool,
    embedder: Arc<dyn EmbeddingClient>,
    judge_llm: Option<Arc<dyn LlmClient>>,
    judge_model: String,
    retry_on_failure: bool,
) {
    while let Some(signal) = cmd_rx.recv().await {
        match signal {
            Signal::Wake => {
                let batch = {
                    let mut pending = shared.pending.lock().await;
                    pending.pop_front()
                };
                let Some(batch) = batch else { continue };
                let batch_len = batch.entries.len().max(1);

                let result = execute_with_retry(
                    &pool,
                    embedder.as_ref(),
                    judge_llm.as_deref(),
                    &judge_model,
                    &batch.file_key,
                    &batch.content_hash,
                    batch.entries,
                    &batch.options,
                    retry_on_failure,
                )
                .await;

                shared.pending_count.fetch_sub(batch_len, Ordering::SeqCst);
                shared.capacity_freed.notify_waiters();
                let _ = batch.respond_to.send(result);
            }
            Signal::RunExclusive(task, respond_to) => {
                let result = task().await;
                let _ = respond_to.send(result);
            }
            Signal::Shutdown(respond_to) => {
                let _ = respond_to.send(());
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_with_retry(
    pool: &AgenrPool,
    embedder: &dyn EmbeddingClient,
    judge_llm: Option<&dyn LlmClient>,
    judge_model: &str,
    file_key: &str,
    content_hash: &str,
    entries: Vec<KnowledgeEntry>,
    options: &StoreOptions,
    retry_on_failure: bool,
) -> Result<StoreResult> {
    let attempts = if retry_on_failure { RETRY_ATTEMPTS } else { 1 };
    let mut last_err = None;

    for attempt in 1..=attempts {
        match crate::storage::store_entries(
            pool,
            embedder,
            judge_llm,
            judge_model,
            file_key,
            content_hash,
            entries.clone(),
            options,
        )
        .await
        {
            Ok(result) => return Ok(result),
            Err(e) => {
                warn!(file_key, attempt, error = %e, "write batch failed");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    Err(last_err.expect("loop runs at least once"))
}
