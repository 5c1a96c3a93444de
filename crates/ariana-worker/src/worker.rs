//! Worker process state and the prompt pipeline.
//!
//! One `Worker` instance per VM, constructed at startup. All process-wide
//! registries live here as instance fields rather than module globals so
//! tests can construct independent instances.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ariana_types::{AgentPrompt, CoreError, PromptId, PromptStatus};
use ariana_wire::{
    AgentCipher, AutomationEvent, SetupMode, StartRequest, StartResponse, WireMessage,
};

use crate::automation::AutomationEngine;
use crate::git::GitContext;
use crate::script::ScriptVariables;
use crate::session::{AssistantQuery, AssistantSession, SessionSnapshot};
use crate::setup::ProjectSetup;
use crate::spool::{ActionSpool, ControlAction};

/// How often the prompt pump re-checks the blocking-automation gate.
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Model used by the commit-name and task-summary helpers.
pub const HELPER_MODEL: &str = "claude-haiku";

/// Attempts for the LLM helper endpoints before falling back.
const HELPER_RETRIES: usize = 3;

//─────────────────────────────
//  Snapshot installation
//─────────────────────────────

/// Installs a filesystem image from presigned chunk URLs.
///
/// The real installer streams every chunk to disk in order and hands the
/// image to the host reimage hook; tests substitute a recording fake.
#[async_trait]
pub trait ImageInstaller: Send + Sync {
    /// Download the chunks in order and reinstall the filesystem.
    async fn install(&self, chunk_urls: Vec<String>) -> Result<()>;
}

/// Default installer: concatenates chunks into an image file on disk.
pub struct HttpImageInstaller {
    client: reqwest::Client,
    image_path: PathBuf,
}

impl HttpImageInstaller {
    /// Write downloaded images under the given path.
    pub fn new(image_path: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            image_path,
        }
    }
}

#[async_trait]
impl ImageInstaller for HttpImageInstaller {
    async fn install(&self, chunk_urls: Vec<String>) -> Result<()> {
        if let Some(parent) = self.image_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut image = Vec::new();
        for url in &chunk_urls {
            let bytes = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .context("downloading snapshot chunk")?
                .bytes()
                .await?;
            image.extend_from_slice(&bytes);
        }
        tokio::fs::write(&self.image_path, image)
            .await
            .with_context(|| format!("writing image to {}", self.image_path.display()))?;
        info!(chunks = chunk_urls.len(), path = %self.image_path.display(), "snapshot image staged");
        Ok(())
    }
}

//─────────────────────────────
//  Worker
//─────────────────────────────

/// Static configuration of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The working tree.
    pub project_dir: PathBuf,
    /// Root for scripts, spilled variables, and the action spool.
    pub automations_dir: PathBuf,
    /// Home directory holding `.ariana/conversation-state.json`.
    pub home_dir: PathBuf,
    /// Provisioning secret the wire cipher derives from.
    pub agent_secret: String,
}

impl WorkerConfig {
    /// Directory the action spool polls.
    pub fn actions_dir(&self) -> PathBuf {
        self.automations_dir.join("actions")
    }

    /// Path of the persisted conversation state.
    pub fn conversation_state_path(&self) -> PathBuf {
        self.home_dir.join(".ariana").join("conversation-state.json")
    }
}

/// Everything `/start` established, absent until it runs.
#[derive(Debug, Clone)]
pub struct StartedState {
    /// Branch the agent works on.
    pub branch_name: String,
    /// owner/repo extracted from the remote.
    pub github_repo: Option<(String, String)>,
    /// HEAD at setup time.
    pub start_commit_sha: Option<String>,
    /// Forge token for push operations and script variables.
    pub github_token: Option<String>,
}

struct QueuedPrompt {
    id: PromptId,
    text: String,
    model: Option<String>,
}

/// Per-VM worker runtime: session, engine, spool, prompt pipeline.
pub struct Worker {
    /// Static configuration.
    pub config: WorkerConfig,
    /// Wire cipher shared with the controller.
    pub cipher: AgentCipher,
    /// The LLM conversation.
    pub session: AssistantSession,
    /// Automation engine.
    pub engine: Arc<AutomationEngine>,
    /// Git bound to the project dir.
    pub git: GitContext,
    assistant: Arc<dyn AssistantQuery>,
    installer: Arc<dyn ImageInstaller>,
    started: Mutex<Option<StartedState>>,
    prompt_tx: mpsc::UnboundedSender<QueuedPrompt>,
    prompt_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedPrompt>>>,
    active_prompt: Mutex<Option<PromptId>>,
    queued_prompts: Mutex<Vec<AgentPrompt>>,
    last_prompts: Mutex<Vec<String>>,
    stop_requested: Mutex<bool>,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl Worker {
    /// Construct a worker; background loops start on [`Worker::spawn_loops`].
    pub fn new(
        config: WorkerConfig,
        assistant: Arc<dyn AssistantQuery>,
        installer: Arc<dyn ImageInstaller>,
    ) -> Arc<Self> {
        let cipher = AgentCipher::from_secret(&config.agent_secret);
        let session = AssistantSession::new(assistant.clone());
        let engine = Arc::new(AutomationEngine::new(
            config.project_dir.clone(),
            config.automations_dir.clone(),
        ));
        let git = GitContext::new(&config.project_dir);
        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            cipher,
            session,
            engine,
            git,
            assistant,
            installer,
            started: Mutex::new(None),
            prompt_tx,
            prompt_rx: Mutex::new(Some(prompt_rx)),
            active_prompt: Mutex::new(None),
            queued_prompts: Mutex::new(Vec::new()),
            last_prompts: Mutex::new(Vec::new()),
            stop_requested: Mutex::new(false),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Seconds since process start, for the health probe.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Token fired at process shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the prompt pump and the action-spool poller.
    pub fn spawn_loops(self: &Arc<Self>) {
        let (action_tx, mut action_rx) = mpsc::unbounded_channel();
        let spool = ActionSpool::new(self.config.actions_dir(), action_tx);
        tokio::spawn(spool.run(self.shutdown.clone()));

        let worker = self.clone();
        tokio::spawn(async move {
            while let Some(action) = action_rx.recv().await {
                worker.handle_control_action(action).await;
            }
        });

        let worker = self.clone();
        tokio::spawn(async move { worker.prompt_pump().await });
    }

    async fn handle_control_action(&self, action: ControlAction) {
        match action {
            ControlAction::StopAgent { automation_name } => {
                info!(%automation_name, "automation requested agent stop");
                *self.stop_requested.lock().await = true;
            }
            ControlAction::QueuePrompt {
                automation_name,
                prompt_text,
            } => {
                info!(%automation_name, "automation queued a prompt");
                let id = PromptId(uuid::Uuid::new_v4().to_string());
                self.enqueue_prompt(id, prompt_text, None).await;
            }
        }
    }

    //─────────────────────────────
    //  Prompt pipeline
    //─────────────────────────────

    /// Append a prompt to the worker-side queue.
    pub async fn enqueue_prompt(&self, id: PromptId, text: String, model: Option<String>) {
        {
            let mut queued = self.queued_prompts.lock().await;
            queued.push(AgentPrompt {
                id: id.clone(),
                agent_id: ariana_types::AgentId(String::new()),
                text: text.clone(),
                status: PromptStatus::Queued,
                created_at: chrono::Utc::now(),
            });
        }
        let _ = self.prompt_tx.send(QueuedPrompt { id, text, model });
    }

    /// Strict-FIFO pump: one prompt at a time, admission deferred while any
    /// blocking automation runs.
    async fn prompt_pump(self: Arc<Self>) {
        let mut rx = match self.prompt_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        loop {
            let prompt = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                prompt = rx.recv() => match prompt {
                    Some(prompt) => prompt,
                    None => return,
                },
            };

            // Blocking automations gate prompt admission.
            while self.engine.has_blocking().await {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(BLOCKING_POLL_INTERVAL) => {}
                }
            }

            self.set_prompt_status(&prompt.id, PromptStatus::Active).await;
            *self.active_prompt.lock().await = Some(prompt.id.clone());
            self.last_prompts.lock().await.push(prompt.text.clone());

            let result = self.session.submit(prompt.text, prompt.model).await;
            match &result {
                Ok(()) => self.set_prompt_status(&prompt.id, PromptStatus::Done).await,
                Err(CoreError::Cancelled) => {
                    info!(prompt = %prompt.id, "prompt cancelled");
                    self.set_prompt_status(&prompt.id, PromptStatus::Failed).await;
                }
                Err(error) => {
                    error!(prompt = %prompt.id, %error, "prompt failed");
                    self.set_prompt_status(&prompt.id, PromptStatus::Failed).await;
                }
            }
            *self.active_prompt.lock().await = None;

            if let Err(error) = self.persist_conversation_state().await {
                warn!(%error, "failed to persist conversation state");
            }
        }
    }

    async fn set_prompt_status(&self, id: &PromptId, status: PromptStatus) {
        let mut queued = self.queued_prompts.lock().await;
        if let Some(prompt) = queued.iter_mut().find(|p| &p.id == id) {
            prompt.status = status;
        }
    }

    /// True when a new prompt would be admitted immediately.
    pub async fn is_ready(&self) -> bool {
        self.started.lock().await.is_some()
            && self.active_prompt.lock().await.is_none()
            && !self.engine.has_blocking().await
    }

    /// Whether a user script requested the agent be stopped.
    pub async fn stop_requested(&self) -> bool {
        *self.stop_requested.lock().await
    }

    /// Statuses of worker-side prompts, for tests and introspection.
    pub async fn prompt_status(&self, id: &PromptId) -> Option<PromptStatus> {
        self.queued_prompts
            .lock()
            .await
            .iter()
            .find(|p| &p.id == id)
            .map(|p| p.status)
    }

    //─────────────────────────────
    //  Start
    //─────────────────────────────

    /// One-time initialization driven by `/start`.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<StartResponse, CoreError> {
        let existing = self.started.lock().await.clone();
        if let Some(state) = existing {
            // A retried /start after an image restore; report the established
            // state instead of re-running setup.
            return Ok(StartResponse {
                status: "ok".to_string(),
                git_info_status: "ok".to_string(),
                start_commit_sha: state.start_commit_sha,
                git_history_last_pushed_commit_sha: self.git.head_sha().await,
                git_info_error: None,
            });
        }

        for file in &request.secret_files {
            let path = self.config.project_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::Validation(e.to_string()))?;
            }
            tokio::fs::write(&path, &file.contents)
                .await
                .map_err(|e| CoreError::Validation(e.to_string()))?;
        }

        let setup = ProjectSetup::new(&self.config.project_dir);
        let outcome = setup
            .initialize(
                &request.setup,
                &request.branch_name,
                &request.git_user_name,
                &request.git_user_email,
            )
            .await?;

        let github_token = match &request.setup {
            SetupMode::GitClone { token, .. } => Some(token.clone()),
            _ => None,
        };

        if let Some(env_contents) = &request.env_contents {
            self.engine.set_base_env(parse_dotenv(env_contents)).await;
        }
        self.engine.install(request.automations.clone()).await;

        if request.dont_send_initial_message {
            match self.load_conversation_state().await {
                Ok(Some(snapshot)) => {
                    info!(
                        messages = snapshot.messages.len(),
                        "restored conversation state"
                    );
                    self.session.restore_state(snapshot).await;
                }
                Ok(None) => warn!("no conversation state found to restore"),
                Err(error) => warn!(%error, "conversation state unreadable"),
            }
        }

        let state = StartedState {
            branch_name: request.branch_name.clone(),
            github_repo: outcome.github_repo.clone(),
            start_commit_sha: outcome.start_commit_sha.clone(),
            github_token,
        };
        let start_commit_sha = state.start_commit_sha.clone();
        *self.started.lock().await = Some(state);

        self.spawn_loops();

        Ok(StartResponse {
            status: "ok".to_string(),
            git_info_status: "ok".to_string(),
            start_commit_sha,
            git_history_last_pushed_commit_sha: self.git.head_sha().await,
            git_info_error: None,
        })
    }

    /// Established start state, when `/start` already ran.
    pub async fn started_state(&self) -> Option<StartedState> {
        self.started.lock().await.clone()
    }

    //─────────────────────────────
    //  Conversation state persistence
    //─────────────────────────────

    async fn persist_conversation_state(&self) -> Result<()> {
        let snapshot = self.session.export_state().await;
        let path = self.config.conversation_state_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    async fn load_conversation_state(&self) -> Result<Option<SessionSnapshot>> {
        let path = self.config.conversation_state_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    //─────────────────────────────
    //  Interrupt & snapshot restore
    //─────────────────────────────

    /// Cancel the active prompt and every running blocking automation,
    /// preserving the conversation for the next prompt.
    pub async fn interrupt(&self) {
        self.session.interrupt().await;
        self.engine.kill_all().await;
    }

    /// Reinstall the filesystem from presigned snapshot URLs.
    pub async fn restore_snapshot(&self, chunk_urls: Vec<String>) -> Result<(), CoreError> {
        if chunk_urls.is_empty() {
            return Err(CoreError::Validation(
                "restore-snapshot requires at least one URL".to_string(),
            ));
        }
        self.installer
            .install(chunk_urls)
            .await
            .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))
    }

    //─────────────────────────────
    //  Automations
    //─────────────────────────────

    /// Run every automation matching the event, with full variable injection.
    pub async fn execute_automations(
        self: &Arc<Self>,
        event: &AutomationEvent,
    ) -> Vec<ariana_types::AutomationId> {
        let variables = self.build_variables(event).await;
        self.engine.dispatch(event, variables).await
    }

    /// Dispatch a blocking trigger and wait for every blocking run to exit.
    pub async fn execute_blocking_and_wait(self: &Arc<Self>, event: &AutomationEvent) {
        let started = self.execute_automations(event).await;
        if started.is_empty() {
            return;
        }
        while self.engine.has_blocking().await {
            tokio::time::sleep(BLOCKING_POLL_INTERVAL).await;
        }
    }

    /// The predeclared script variables for an event.
    async fn build_variables(&self, event: &AutomationEvent) -> ScriptVariables {
        let mut vars = ScriptVariables::new();

        match event {
            AutomationEvent::AfterEditFiles { file_path }
            | AutomationEvent::AfterReadFiles { file_path } => {
                vars.set("INPUT_FILE_PATH", file_path.clone());
            }
            AutomationEvent::AfterRunCommand { command } => {
                vars.set("INPUT_COMMAND", command.clone());
            }
            _ => {}
        }

        if let Some(sha) = self.git.head_sha().await {
            vars.set("CURRENT_COMMIT_SHA", sha.clone());
            if let Some(changes) = self.git.try_run(&["show", "--format=", "HEAD"]).await {
                vars.set("CURRENT_COMMIT_CHANGES", changes);
            }
            let started = self.started.lock().await.clone();
            if let Some(start_sha) = started.as_ref().and_then(|s| s.start_commit_sha.as_deref()) {
                if let Ok(diff) = self.git.diff_since(start_sha).await {
                    vars.set("ENTIRE_AGENT_DIFF", diff);
                }
            }
            if let Some(token) = started.and_then(|s| s.github_token) {
                vars.set("GITHUB_TOKEN", token);
            }
        }
        if let Ok(pending) = self.git.pending_diff().await {
            vars.set("CURRENT_PENDING_CHANGES", pending);
        }

        {
            let prompts = self.last_prompts.lock().await;
            if let Some(last) = prompts.last() {
                vars.set("LAST_PROMPT", last.clone());
            }
            if !prompts.is_empty() {
                vars.set("ALL_LAST_PROMPTS", prompts.join("\n---\n"));
            }
        }

        let messages = self.session.get_messages().await;
        if !messages.is_empty() {
            let transcript: Vec<serde_json::Value> = messages
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "role": m.role,
                        "content": m.content,
                    })
                })
                .collect();
            if let Ok(json) = serde_json::to_string(&transcript) {
                use base64::Engine as _;
                vars.set(
                    "CONVERSATION_TRANSCRIPT_BASE64",
                    base64::engine::general_purpose::STANDARD.encode(&json),
                );
                vars.set("CONVERSATION_TRANSCRIPT", json);
            }
        }

        vars
    }

    //─────────────────────────────
    //  LLM helpers
    //─────────────────────────────

    /// Name a commit from its diff, with retries and a static fallback.
    pub async fn generate_commit_name(&self, diff: &str) -> String {
        let prompt = format!(
            "Write a single-line conventional commit name for this diff. \
             Reply with the name only.\n\n{diff}"
        );
        for attempt in 1..=HELPER_RETRIES {
            match self
                .assistant
                .oneshot(prompt.clone(), HELPER_MODEL.to_string())
                .await
            {
                Ok(name) if !name.trim().is_empty() => {
                    return name.trim().lines().next().unwrap_or("Update project files").to_string()
                }
                Ok(_) => warn!(attempt, "commit-name helper returned empty"),
                Err(error) => warn!(attempt, %error, "commit-name helper failed"),
            }
        }
        "Update project files".to_string()
    }

    /// Summarize the agent's task, with retries and a static fallback.
    pub async fn generate_task_summary(&self, transcript: &str) -> String {
        let prompt = format!(
            "Summarize in one short sentence what this coding session is \
             doing. Reply with the sentence only.\n\n{transcript}"
        );
        for attempt in 1..=HELPER_RETRIES {
            match self
                .assistant
                .oneshot(prompt.clone(), HELPER_MODEL.to_string())
                .await
            {
                Ok(summary) if !summary.trim().is_empty() => return summary.trim().to_string(),
                Ok(_) => warn!(attempt, "task-summary helper returned empty"),
                Err(error) => warn!(attempt, %error, "task-summary helper failed"),
            }
        }
        "Working on the project".to_string()
    }

    /// Conversation messages shaped for the poller.
    pub async fn wire_messages(&self) -> Vec<WireMessage> {
        self.session
            .get_messages()
            .await
            .into_iter()
            .map(|m| WireMessage {
                api_message_id: m.api_message_id,
                role: m.role,
                content: m.content,
                is_streaming: m.is_streaming,
                created_at: m.created_at,
            })
            .collect()
    }
}

/// Parse dotenv-style text into key/value pairs; malformed lines are skipped.
pub fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim().trim_matches('"').trim_matches('\'');
            env.insert(key.to_string(), value.to_string());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_parsing_handles_comments_and_quotes() {
        let env = parse_dotenv("# comment\nFOO=bar\nQUOTED=\"a b\"\n\nBAD LINE\n=nokey\n");
        assert_eq!(env.get("FOO").unwrap(), "bar");
        assert_eq!(env.get("QUOTED").unwrap(), "a b");
        assert_eq!(env.len(), 2);
    }
}
