//! Run registry and event relay.
//!
//! One background driver task per run pushes [`RunEvent`]s onto an unbounded
//! FIFO queue; the HTTP boundary drains that queue as an SSE stream. A
//! supervisor task observes every driver exit (completion, failure, panic or
//! abort) and finalizes the run: remove it from the registry, then push the
//! terminal sentinel so any open consumer sees the stream end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use agent_relay_error::RelayError;

use crate::config::RelayConfig;
use crate::events::{RunErrorCode, RunEvent};
use crate::model::{ChatBackend, ChatMessage, ChatRequest};
use crate::settings_store::SettingsStore;

pub const DEFAULT_TEMPERATURE: f64 = 0.2;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are AgentRelay conversation assistant. Keep replies concise.";

/// Validated run input, produced by the HTTP boundary.
#[derive(Debug, Clone)]
pub struct RunPayload {
    pub prompt: Option<String>,
    pub conversation: Vec<ConversationTurn>,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// Queue slot: an event, or `None` as the terminal sentinel.
type QueueItem = Option<RunEvent>;

#[derive(Debug)]
struct RunContext {
    events_tx: UnboundedSender<QueueItem>,
    /// Taken by the first (and only) event-stream subscriber.
    events_rx: Option<UnboundedReceiver<QueueItem>>,
    cancel: Arc<AtomicBool>,
    abort: AbortHandle,
}

#[derive(Debug)]
struct RunManagerInner {
    config: RelayConfig,
    settings_store: SettingsStore,
    backend: ChatBackend,
    runs: Mutex<HashMap<String, RunContext>>,
}

#[derive(Debug, Clone)]
pub struct RunManager {
    inner: Arc<RunManagerInner>,
}

impl RunManager {
    pub fn new(config: RelayConfig, settings_store: SettingsStore) -> Self {
        Self::with_backend(config, settings_store, ChatBackend::http())
    }

    pub fn with_backend(
        config: RelayConfig,
        settings_store: SettingsStore,
        backend: ChatBackend,
    ) -> Self {
        Self {
            inner: Arc::new(RunManagerInner {
                config,
                settings_store,
                backend,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register `run_id` and schedule its driver. Returns without waiting for
    /// any backend interaction. Check-and-insert happens under one lock
    /// acquisition, so two concurrent creates cannot both succeed.
    pub async fn create_run(&self, run_id: &str, payload: RunPayload) -> Result<(), RelayError> {
        let mut runs = self.inner.runs.lock().await;
        if runs.contains_key(run_id) {
            return Err(RelayError::RunAlreadyExists {
                run_id: run_id.to_string(),
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let driver = tokio::spawn(drive_run(
            self.inner.clone(),
            run_id.to_string(),
            events_tx.clone(),
            cancel.clone(),
            payload,
        ));
        let abort = driver.abort_handle();

        let inner = self.inner.clone();
        let supervised = run_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = driver.await {
                if err.is_panic() {
                    tracing::error!(run_id = %supervised, error = %err, "run driver panicked");
                }
            }
            finalize_run(&inner, &supervised).await;
        });

        runs.insert(
            run_id.to_string(),
            RunContext {
                events_tx,
                events_rx: Some(events_rx),
                cancel,
                abort,
            },
        );
        tracing::info!(run_id = %run_id, "run created");
        Ok(())
    }

    pub async fn ensure_run_exists(&self, run_id: &str) -> Result<(), RelayError> {
        let runs = self.inner.runs.lock().await;
        if runs.contains_key(run_id) {
            Ok(())
        } else {
            Err(RelayError::RunNotFound {
                run_id: run_id.to_string(),
            })
        }
    }

    /// Take the run's event queue as a finite stream. The receiver is captured
    /// before this returns, so the stream stays readable after the run is
    /// removed from the registry; it ends when the sentinel is read.
    pub async fn stream_events(
        &self,
        run_id: &str,
    ) -> Result<impl Stream<Item = RunEvent> + Send + 'static, RelayError> {
        let receiver = {
            let mut runs = self.inner.runs.lock().await;
            let ctx = runs.get_mut(run_id).ok_or_else(|| RelayError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
            ctx.events_rx
                .take()
                .ok_or_else(|| RelayError::StreamConsumed {
                    run_id: run_id.to_string(),
                })?
        };

        Ok(stream::unfold(receiver, |mut rx| async move {
            match rx.recv().await {
                Some(Some(event)) => Some((event, rx)),
                // sentinel, or every sender is gone
                Some(None) | None => None,
            }
        }))
    }

    /// Raise the run's cancel flag. Cooperative: the driver notices at the
    /// next chunk boundary. A repeat cancel on a registered run is a no-op.
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), RelayError> {
        let runs = self.inner.runs.lock().await;
        let ctx = runs.get(run_id).ok_or_else(|| RelayError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        ctx.cancel.store(true, Ordering::SeqCst);
        tracing::info!(run_id = %run_id, "run cancellation requested");
        Ok(())
    }

    /// Abort every active driver. Supervisors still run, so each aborted run
    /// is finalized and its consumers see stream end.
    pub async fn shutdown(&self) {
        let runs = self.inner.runs.lock().await;
        for (run_id, ctx) in runs.iter() {
            tracing::info!(run_id = %run_id, "aborting run for shutdown");
            ctx.abort.abort();
        }
    }
}

/// Remove the run and deliver the sentinel exactly once.
async fn finalize_run(inner: &Arc<RunManagerInner>, run_id: &str) {
    let ctx = inner.runs.lock().await.remove(run_id);
    if let Some(ctx) = ctx {
        let _ = ctx.events_tx.send(None);
        tracing::debug!(run_id = %run_id, "run finalized");
    }
}

async fn drive_run(
    inner: Arc<RunManagerInner>,
    run_id: String,
    events: UnboundedSender<QueueItem>,
    cancel: Arc<AtomicBool>,
    payload: RunPayload,
) {
    publish(&events, RunEvent::started(&run_id));

    let provider = inner
        .settings_store
        .provider_settings(&inner.config.api_base);
    let Some(api_key) = provider.api_key else {
        publish(
            &events,
            RunEvent::failed(
                &run_id,
                RunErrorCode::MissingApiKey,
                "DeepSeek API key is not configured.",
            ),
        );
        return;
    };

    let request = ChatRequest {
        model: inner.config.model.clone(),
        messages: build_messages(&payload),
        temperature: payload.temperature,
    };

    let mut chat_stream = match inner
        .backend
        .open_stream(&api_key, &provider.base_url, &request)
        .await
    {
        Ok(chat_stream) => chat_stream,
        Err(err) => {
            tracing::error!(run_id = %run_id, error = %err, "model stream setup failed");
            publish(
                &events,
                RunEvent::failed(&run_id, RunErrorCode::ModelError, &err.to_string()),
            );
            return;
        }
    };

    // a cancel raised during setup is observed before the first chunk
    if cancel.load(Ordering::SeqCst) {
        publish(&events, RunEvent::cancelled(&run_id));
        return;
    }

    let mut accumulated = String::new();
    loop {
        match chat_stream.next_delta().await {
            Ok(Some(text)) => {
                if cancel.load(Ordering::SeqCst) {
                    // dropping the stream closes the backend connection
                    publish(&events, RunEvent::cancelled(&run_id));
                    return;
                }
                accumulated.push_str(&text);
                publish(&events, RunEvent::delta(&run_id, &text));
            }
            Ok(None) => {
                if cancel.load(Ordering::SeqCst) {
                    publish(&events, RunEvent::cancelled(&run_id));
                    return;
                }
                publish(&events, RunEvent::completed(&run_id, accumulated.trim()));
                return;
            }
            Err(err) => {
                tracing::error!(run_id = %run_id, error = %err, "model stream failed");
                publish(
                    &events,
                    RunEvent::failed(&run_id, RunErrorCode::ModelError, &err.to_string()),
                );
                return;
            }
        }
    }
}

fn publish(events: &UnboundedSender<QueueItem>, event: RunEvent) {
    if events.send(Some(event)).is_err() {
        tracing::debug!("dropping run event, queue is closed");
    }
}

fn build_messages(payload: &RunPayload) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(prompt) = payload.prompt.as_deref().filter(|prompt| !prompt.is_empty()) {
        messages.push(ChatMessage::new("system", prompt));
    }
    for turn in &payload.conversation {
        if !turn.content.is_empty() {
            messages.push(ChatMessage::new(&turn.role, &turn.content));
        }
    }
    if messages.is_empty() {
        messages.push(ChatMessage::new("system", DEFAULT_SYSTEM_PROMPT));
    }
    messages
}
