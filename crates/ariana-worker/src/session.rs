//! Streaming assistant conversation wrapper.
//!
//! The session owns the ordered message log of one LLM conversation and the
//! coordination around it: a strict FIFO submit pipeline, interrupt that
//! never interleaves with a fresh submit, dedup-on-update of re-yielded
//! streaming messages, and export/restore for fork and resume.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ariana_types::{CoreError, MessageRole};
use ariana_wire::ContextUsage;

//─────────────────────────────
//  Assistant collaborator
//─────────────────────────────

/// Token accounting reported with an assistant result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Model that produced the result.
    pub model: String,
    /// The model's context window, when the vendor reports it.
    pub context_window: Option<u64>,
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Tokens written to the prompt cache.
    pub cache_creation_input_tokens: u64,
    /// Tokens served from the prompt cache.
    pub cache_read_input_tokens: u64,
}

impl ModelUsage {
    /// Input-side tokens counted against the context window.
    pub fn total_context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }
}

/// One event of a streaming assistant query.
///
/// The assistant re-yields the same logical message several times as its
/// content grows; `api_message_id` is stable across re-yields.
#[derive(Debug, Clone)]
pub enum AssistantEvent {
    /// A message's content so far.
    Message {
        /// Stable id of the logical message.
        api_message_id: String,
        /// Author.
        role: MessageRole,
        /// Full content accumulated so far.
        content: String,
    },
    /// The query settled; usage attached.
    Result {
        /// Token accounting.
        usage: ModelUsage,
    },
    /// The assistant compacted its context.
    CompactBoundary {
        /// What triggered compaction.
        trigger: String,
        /// Context tokens immediately before compaction.
        pre_tokens: u64,
    },
    /// The assistant failed.
    Error {
        /// Failure detail.
        message: String,
    },
}

/// Handle on one in-flight streaming query.
pub struct AssistantStream {
    /// Vendor session id; reused to continue the conversation.
    pub session_id: String,
    /// Ordered event stream.
    pub events: mpsc::Receiver<AssistantEvent>,
}

/// Abstract streaming assistant the worker converses with.
#[async_trait]
pub trait AssistantQuery: Send + Sync {
    /// Begin (or, given a session id, continue) a streaming query.
    ///
    /// The implementation must stop yielding promptly once `cancel` fires.
    async fn query(
        &self,
        session_id: Option<String>,
        prompt: String,
        model: Option<String>,
        cancel: CancellationToken,
    ) -> Result<AssistantStream, CoreError>;

    /// Ask the in-flight query to stop as soon as possible. Idempotent and
    /// safe to call when nothing is in flight.
    async fn interrupt(&self);

    /// One-shot non-streaming helper used for commit names and task
    /// summaries.
    async fn oneshot(&self, prompt: String, model: String) -> Result<String, CoreError>;
}

//─────────────────────────────
//  Session state
//─────────────────────────────

/// One acknowledged message of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Session-local uuid.
    pub uuid: String,
    /// The assistant API's stable id, dedup key.
    pub api_message_id: String,
    /// Author.
    pub role: MessageRole,
    /// Content.
    pub content: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A recorded context compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionEvent {
    /// What triggered compaction.
    pub trigger: String,
    /// Context tokens immediately before compaction.
    pub pre_tokens: u64,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Serializable session state consumed by fork/resume.
///
/// Timestamps pass through RFC 3339 strings, so an export/restore round trip
/// reproduces `get_messages` exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Vendor session id, kept so the next submit resumes the conversation.
    pub session_id: Option<String>,
    /// Acknowledged messages in order.
    pub messages: Vec<SessionMessage>,
    /// Conversations archived by `reset`.
    pub past_conversations: Vec<Vec<SessionMessage>>,
    /// Recorded compactions.
    pub compactions: Vec<CompactionEvent>,
    /// Usage of the last assistant result.
    pub last_usage: Option<ModelUsage>,
}

#[derive(Default)]
struct SessionState {
    snapshot: SessionSnapshot,
    /// api_message_id → index into `snapshot.messages`, for update-in-place.
    by_api_id: HashMap<String, usize>,
    /// Concatenated text deltas of the in-flight assistant message.
    streaming_buffer: Option<String>,
    streaming_api_id: Option<String>,
}

/// A message as returned by [`AssistantSession::get_messages`]: the log plus,
/// while streaming, a synthetic in-flight tail.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleMessage {
    /// Session-local uuid (empty for the synthetic tail).
    pub uuid: String,
    /// Stable api id.
    pub api_message_id: String,
    /// Author.
    pub role: MessageRole,
    /// Content so far.
    pub content: String,
    /// True only for the synthetic streaming tail.
    pub is_streaming: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Session
//─────────────────────────────

/// Wraps one streaming LLM conversation.
///
/// Locking: `pipeline` is the FIFO submit gate (a `submit` waits for the
/// previous one to settle before it begins); `state` guards the message log
/// and is never held across an await of the assistant. `interrupt` takes
/// neither long-lived lock, so it can fire while a submit streams.
pub struct AssistantSession {
    assistant: Arc<dyn AssistantQuery>,
    pipeline: Mutex<()>,
    state: Mutex<SessionState>,
    cancel: Mutex<CancellationToken>,
}

impl AssistantSession {
    /// Create an empty session over the given assistant.
    pub fn new(assistant: Arc<dyn AssistantQuery>) -> Self {
        Self {
            assistant,
            pipeline: Mutex::new(()),
            state: Mutex::new(SessionState::default()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Submit a user message and stream the assistant's reply to completion.
    ///
    /// Waits for any previous `submit` still in flight, so interrupt-and-retry
    /// never races a fresh prompt. Returns `Cancelled` when interrupted; the
    /// session id survives so the next submit resumes the same conversation.
    pub async fn submit(&self, text: String, model: Option<String>) -> Result<(), CoreError> {
        let _pipeline = self.pipeline.lock().await;

        let cancel = {
            let mut guard = self.cancel.lock().await;
            *guard = CancellationToken::new();
            guard.clone()
        };

        let session_id = {
            let mut state = self.state.lock().await;
            let uuid = Uuid::new_v4().to_string();
            let message = SessionMessage {
                uuid: uuid.clone(),
                api_message_id: format!("user-{uuid}"),
                role: MessageRole::User,
                content: text.clone(),
                created_at: Utc::now(),
            };
            let index = state.snapshot.messages.len();
            state.by_api_id.insert(message.api_message_id.clone(), index);
            state.snapshot.messages.push(message);
            state.snapshot.session_id.clone()
        };

        debug!(resuming = session_id.is_some(), "submitting prompt to assistant");
        let mut stream = self
            .assistant
            .query(session_id, text, model, cancel.clone())
            .await?;

        {
            let mut state = self.state.lock().await;
            state.snapshot.session_id = Some(stream.session_id.clone());
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.clear_streaming().await;
                    return Err(CoreError::Cancelled);
                }
                event = stream.events.recv() => event,
            };

            let Some(event) = event else {
                // Stream ended without a result event; treat as settled.
                self.clear_streaming().await;
                return Ok(());
            };

            match event {
                AssistantEvent::Message {
                    api_message_id,
                    role,
                    content,
                } => {
                    self.absorb_message(api_message_id, role, content).await;
                }
                AssistantEvent::Result { usage } => {
                    let mut state = self.state.lock().await;
                    state.snapshot.last_usage = Some(usage);
                    state.streaming_buffer = None;
                    state.streaming_api_id = None;
                    return Ok(());
                }
                AssistantEvent::CompactBoundary { trigger, pre_tokens } => {
                    info!(%trigger, pre_tokens, "assistant compacted its context");
                    let mut state = self.state.lock().await;
                    state.snapshot.compactions.push(CompactionEvent {
                        trigger,
                        pre_tokens,
                        at: Utc::now(),
                    });
                }
                AssistantEvent::Error { message } => {
                    self.clear_streaming().await;
                    return Err(CoreError::AssistantFailure(message));
                }
            }
        }
    }

    /// Record a (possibly re-yielded) streaming message.
    ///
    /// A known `api_message_id` updates the existing entry in place; only a
    /// brand-new id allocates a new session uuid.
    async fn absorb_message(&self, api_message_id: String, role: MessageRole, content: String) {
        let mut state = self.state.lock().await;
        if role == MessageRole::Assistant {
            state.streaming_buffer = Some(content.clone());
            state.streaming_api_id = Some(api_message_id.clone());
        }
        match state.by_api_id.get(&api_message_id).copied() {
            Some(index) => {
                let message = &mut state.snapshot.messages[index];
                message.content = content;
                message.role = role;
            }
            None => {
                let index = state.snapshot.messages.len();
                state.by_api_id.insert(api_message_id.clone(), index);
                state.snapshot.messages.push(SessionMessage {
                    uuid: Uuid::new_v4().to_string(),
                    api_message_id,
                    role,
                    content,
                    created_at: Utc::now(),
                });
            }
        }
    }

    async fn clear_streaming(&self) {
        let mut state = self.state.lock().await;
        state.streaming_buffer = None;
        state.streaming_api_id = None;
    }

    /// Request the in-flight query to stop as soon as possible.
    ///
    /// Signals both the assistant and the local cancellation token (the
    /// streaming loop reads both). Idempotent; safe before any submit.
    pub async fn interrupt(&self) {
        self.cancel.lock().await.cancel();
        self.assistant.interrupt().await;
        self.clear_streaming().await;
    }

    /// The ordered acknowledged messages plus, while streaming, a synthetic
    /// in-flight assistant message carrying the buffered deltas.
    pub async fn get_messages(&self) -> Vec<VisibleMessage> {
        let state = self.state.lock().await;
        let mut visible: Vec<VisibleMessage> = state
            .snapshot
            .messages
            .iter()
            .map(|m| VisibleMessage {
                uuid: m.uuid.clone(),
                api_message_id: m.api_message_id.clone(),
                role: m.role,
                content: m.content.clone(),
                is_streaming: false,
                created_at: m.created_at,
            })
            .collect();

        if let (Some(buffer), Some(api_id)) =
            (&state.streaming_buffer, &state.streaming_api_id)
        {
            // The in-flight message is already absorbed into the log; flag it
            // as streaming rather than appending a duplicate.
            if let Some(index) = state.by_api_id.get(api_id).copied() {
                visible[index].is_streaming = true;
            } else {
                visible.push(VisibleMessage {
                    uuid: String::new(),
                    api_message_id: api_id.clone(),
                    role: MessageRole::Assistant,
                    content: buffer.clone(),
                    is_streaming: true,
                    created_at: Utc::now(),
                });
            }
        }
        visible
    }

    /// Archive the current conversation and start fresh on the next submit.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let archived = std::mem::take(&mut state.snapshot.messages);
        if !archived.is_empty() {
            state.snapshot.past_conversations.push(archived);
        }
        state.snapshot.session_id = None;
        state.by_api_id.clear();
        state.streaming_buffer = None;
        state.streaming_api_id = None;
    }

    /// Serialize the session for transfer to another machine.
    pub async fn export_state(&self) -> SessionSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    /// Replace the session state with an exported snapshot.
    pub async fn restore_state(&self, snapshot: SessionSnapshot) {
        let mut state = self.state.lock().await;
        state.by_api_id = snapshot
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.api_message_id.clone(), i))
            .collect();
        state.snapshot = snapshot;
        state.streaming_buffer = None;
        state.streaming_api_id = None;
    }

    /// Context consumption computed from the last assistant result, or None
    /// until the first result (or when the model reports no window).
    pub async fn get_context_usage(&self) -> Option<ContextUsage> {
        let state = self.state.lock().await;
        let usage = state.snapshot.last_usage.as_ref()?;
        let window = usage.context_window?;
        if window == 0 {
            warn!("assistant reported a zero context window");
            return None;
        }
        let total = usage.total_context_tokens();
        let used = (total as f64 / window as f64) * 100.0;
        Some(ContextUsage {
            used_percent: used,
            remaining_percent: 100.0 - used,
            total_tokens: total,
            context_window: window,
        })
    }

    /// Compactions recorded so far.
    pub async fn compactions(&self) -> Vec<CompactionEvent> {
        self.state.lock().await.snapshot.compactions.clone()
    }
}
