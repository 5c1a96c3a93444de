//! Request/response shapes of every worker endpoint.
//!
//! The controller seals these into [`Envelope`](crate::Envelope)s before
//! posting; the worker opens, handles, and seals the reply. `GET /health` is
//! the one plaintext endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ariana_types::{Automation, AutomationId, MessageRole, PromptId, SecretFile, SshKeyPair};

//─────────────────────────────
//  Endpoint paths
//─────────────────────────────

/// One-time worker initialization.
pub const EP_START: &str = "/start";
/// Enqueue a user prompt.
pub const EP_PROMPT: &str = "/prompt";
/// Synchronous cancel of the active prompt and blocking automations.
pub const EP_INTERRUPT: &str = "/interrupt";
/// Prompt admission state consulted by the controller.
pub const EP_CLAUDE_STATE: &str = "/claudeState";
/// Create a commit in the project dir.
pub const EP_GIT_COMMIT: &str = "/git-commit";
/// Push the agent branch.
pub const EP_GIT_PUSH: &str = "/git-push";
/// Latest commit metadata.
pub const EP_GIT_LAST_COMMIT: &str = "/git-last-commit";
/// Commit history of the agent branch.
pub const EP_GIT_HISTORY: &str = "/git-history";
/// LLM helper: name a commit from its diff.
pub const EP_GENERATE_COMMIT_NAME: &str = "/generate-commit-name";
/// LLM helper: summarize the agent's task.
pub const EP_GENERATE_TASK_SUMMARY: &str = "/generate-task-summary";
/// Run automations matching an observed event.
pub const EP_EXECUTE_AUTOMATIONS: &str = "/execute-automations";
/// Kill one running automation.
pub const EP_STOP_AUTOMATION: &str = "/stop-automation";
/// Legacy manual trigger endpoint.
pub const EP_TRIGGER_MANUAL_AUTOMATION: &str = "/trigger-manual-automation";
/// Reinstall the filesystem from presigned snapshot URLs.
pub const EP_RESTORE_SNAPSHOT: &str = "/restore-snapshot";
/// Ordered conversation messages for the poller.
pub const EP_MESSAGES: &str = "/messages";
/// Automation run events since a cursor, for the poller.
pub const EP_AUTOMATION_EVENTS: &str = "/automation-events";
/// Plaintext liveness probe.
pub const EP_HEALTH: &str = "/health";

//─────────────────────────────
//  Start
//─────────────────────────────

/// How the working tree is initialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SetupMode {
    /// Use a caller-provided path as-is.
    Local {
        /// Existing directory to adopt.
        path: String,
    },
    /// Clone a remote over HTTPS with a user token.
    GitClone {
        /// HTTPS remote.
        remote_url: String,
        /// Forge access token.
        token: String,
    },
    /// Clone a public remote without credentials.
    GitClonePublic {
        /// HTTPS remote.
        remote_url: String,
    },
    /// Reconstitute the tree from an on-host bundle file plus patch.
    ZipLocal {
        /// Path to the bundle file on the VM.
        bundle_path: String,
        /// Optional patch applied on top of the bundle.
        patch_path: Option<String>,
    },
    /// The tree already exists from a snapshot restore.
    Existing,
}

/// `POST /start` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Working-tree initialization mode.
    pub setup: SetupMode,
    /// Branch the agent works on.
    pub branch_name: String,
    /// Git author identity.
    pub git_user_name: String,
    /// Git author email.
    pub git_user_email: String,
    /// Dotenv text merged into the script environment.
    pub env_contents: Option<String>,
    /// Secret files written into the tree before any script runs.
    #[serde(default)]
    pub secret_files: Vec<SecretFile>,
    /// Optional SSH identity installed on the VM.
    pub ssh_key_pair: Option<SshKeyPair>,
    /// Automations from the agent's environment bundle.
    #[serde(default)]
    pub automations: Vec<Automation>,
    /// When true the worker restores its saved conversation state instead of
    /// priming a new session with an initial message. Set on fork/resume.
    #[serde(default)]
    pub dont_send_initial_message: bool,
}

/// `POST /start` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    /// `"ok"` on success.
    pub status: String,
    /// Outcome of reading the repo's git metadata.
    pub git_info_status: String,
    /// Commit the working tree started from.
    pub start_commit_sha: Option<String>,
    /// Tip of the history mirror last pushed to the forge.
    pub git_history_last_pushed_commit_sha: Option<String>,
    /// Detail when `git_info_status` is not `"ok"`.
    pub git_info_error: Option<String>,
}

//─────────────────────────────
//  Prompting
//─────────────────────────────

/// `POST /prompt` request. Accepted with 202.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Controller-side prompt id, echoed in status updates.
    pub prompt_id: PromptId,
    /// Prompt text.
    pub text: String,
    /// Optional model override.
    pub model: Option<String>,
}

/// `POST /interrupt` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptRequest {}

/// Context consumption reported by the assistant, as percentages of the
/// model's context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    /// Percent of the window consumed.
    pub used_percent: f64,
    /// Percent of the window remaining.
    pub remaining_percent: f64,
    /// Input + cache tokens of the last assistant result.
    pub total_tokens: u64,
    /// The model's context window.
    pub context_window: u64,
}

/// `POST /claudeState` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStateResponse {
    /// True when a new prompt would be admitted immediately.
    pub is_ready: bool,
    /// True while any blocking automation is running.
    pub has_blocking_automation: bool,
    /// Ids of the blocking automations currently running.
    pub blocking_automation_ids: Vec<AutomationId>,
    /// Context usage, absent until the first assistant result.
    pub context_usage: Option<ContextUsage>,
    /// True once a user script asked for the agent to be stopped; the
    /// controller archives the agent when it observes this.
    #[serde(default)]
    pub stop_requested: bool,
}

//─────────────────────────────
//  Git operations
//─────────────────────────────

/// `POST /git-commit` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitRequest {
    /// Commit message; the worker generates one when absent.
    pub message: Option<String>,
}

/// Commit metadata shared by several git replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Commit sha.
    pub sha: String,
    /// Commit message.
    pub message: String,
    /// Author timestamp.
    pub timestamp: DateTime<Utc>,
    /// Added line count.
    pub additions: u64,
    /// Deleted line count.
    pub deletions: u64,
}

/// `POST /git-commit` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitResponse {
    /// The commit that was created, absent when the tree was clean.
    pub commit: Option<CommitInfo>,
}

/// `POST /git-push` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitPushRequest {
    /// Force-push when the remote diverged.
    #[serde(default)]
    pub force: bool,
}

/// `POST /git-push` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitPushResponse {
    /// Branch tip that was pushed.
    pub pushed_sha: String,
}

/// `POST /git-last-commit` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLastCommitResponse {
    /// Latest commit on the agent branch, absent on an empty repo.
    pub commit: Option<CommitInfo>,
}

/// `POST /git-history` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHistoryRequest {
    /// Maximum commits to return.
    pub limit: Option<usize>,
}

/// `POST /git-history` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHistoryResponse {
    /// Newest-first commit list.
    pub commits: Vec<CommitInfo>,
}

//─────────────────────────────
//  LLM helpers
//─────────────────────────────

/// `POST /generate-commit-name` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateCommitNameRequest {
    /// Diff to summarize.
    pub diff: String,
}

/// `POST /generate-commit-name` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateCommitNameResponse {
    /// One-line commit name.
    pub name: String,
}

/// `POST /generate-task-summary` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateTaskSummaryRequest {
    /// Conversation transcript to summarize.
    pub transcript: String,
}

/// `POST /generate-task-summary` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateTaskSummaryResponse {
    /// One-line task summary.
    pub summary: String,
}

//─────────────────────────────
//  Automations
//─────────────────────────────

/// An observed event the engine matches triggers against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationEvent {
    /// The agent reached the ready state.
    AgentReady,
    /// A commit is about to be created.
    BeforeCommit,
    /// A commit was created.
    AfterCommit,
    /// The assistant edited a file.
    AfterEditFiles {
        /// Repo-relative path of the edited file.
        file_path: String,
    },
    /// The assistant read a file.
    AfterReadFiles {
        /// Repo-relative path of the read file.
        file_path: String,
    },
    /// The assistant ran a command.
    AfterRunCommand {
        /// The full command line.
        command: String,
    },
    /// A push / PR creation is about to happen.
    BeforePushPr,
    /// A push / PR creation happened.
    AfterPushPr,
    /// The conversation was reset.
    AfterReset,
    /// Another automation finished a run.
    AutomationFinished {
        /// The automation that finished.
        automation_id: AutomationId,
    },
}

/// `POST /execute-automations` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAutomationsRequest {
    /// The event to match triggers against.
    pub event: AutomationEvent,
}

/// `POST /execute-automations` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAutomationsResponse {
    /// Ids of the automations that started.
    pub started: Vec<AutomationId>,
}

/// `POST /stop-automation` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAutomationRequest {
    /// The automation to kill.
    pub automation_id: AutomationId,
}

/// `POST /trigger-manual-automation` request (legacy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerManualAutomationRequest {
    /// The manual automation to run.
    pub automation_id: AutomationId,
}

/// Lifecycle of one automation run as reported to the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationRunStatus {
    /// Script spawned.
    Started,
    /// Script exited zero.
    Finished,
    /// Script exited non-zero or was killed.
    Failed,
}

/// One automation run event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRunEvent {
    /// Monotonic event sequence number, the poller's cursor.
    pub seq: u64,
    /// The automation that ran.
    pub automation_id: AutomationId,
    /// Its display name.
    pub automation_name: String,
    /// Run status.
    pub status: AutomationRunStatus,
    /// Exit code for finished/failed runs.
    pub exit_code: Option<i32>,
    /// Captured output (bounded; beginning dropped on overflow).
    pub output: String,
    /// True when the capture ring overflowed and the beginning was dropped.
    pub is_start_truncated: bool,
    /// Event time.
    pub at: DateTime<Utc>,
}

/// `POST /automation-events` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationEventsRequest {
    /// Return events with `seq` strictly greater than this.
    pub after_seq: u64,
}

/// `POST /automation-events` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationEventsResponse {
    /// Events in sequence order.
    pub events: Vec<AutomationRunEvent>,
}

//─────────────────────────────
//  Snapshot restore
//─────────────────────────────

/// `POST /restore-snapshot` request. Exactly one of the two fields is set:
/// one URL for a single-object snapshot, a URL list for a chunked one (in
/// restore order).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSnapshotRequest {
    /// Presigned URL of a single-object snapshot.
    pub presigned_download_url: Option<String>,
    /// Presigned URLs of a chunked snapshot, in restore order.
    pub presigned_download_urls: Option<Vec<String>>,
}

/// `POST /restore-snapshot` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSnapshotResponse {
    /// `"ok"` once the image is reinstalled.
    pub status: String,
}

//─────────────────────────────
//  Messages & health
//─────────────────────────────

/// One conversation message as reported to the poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// The assistant API's stable message id.
    pub api_message_id: String,
    /// Author.
    pub role: MessageRole,
    /// Content so far (may still be growing for the streaming tail).
    pub content: String,
    /// True for the synthetic in-flight assistant message.
    #[serde(default)]
    pub is_streaming: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// `POST /messages` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Ordered acknowledged messages plus the streaming tail.
    pub messages: Vec<WireMessage>,
}

/// `GET /health` reply (plaintext).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"healthy"`.
    pub status: String,
    /// Worker build version.
    pub version: String,
    /// Seconds since the worker process started.
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_mode_round_trips_through_tag() {
        let mode = SetupMode::GitClone {
            remote_url: "https://github.com/acme/app".into(),
            token: "tok".into(),
        };
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["mode"], "git-clone");
        let back: SetupMode = serde_json::from_value(json).unwrap();
        assert_eq!(back, mode);
    }

    #[test]
    fn restore_request_accepts_either_field() {
        let single: RestoreSnapshotRequest =
            serde_json::from_str(r#"{"presigned_download_url":"https://r2/x.img","presigned_download_urls":null}"#)
                .unwrap();
        assert!(single.presigned_download_url.is_some());

        let chunked: RestoreSnapshotRequest = serde_json::from_str(
            r#"{"presigned_download_url":null,"presigned_download_urls":["https://r2/000000.part"]}"#,
        )
        .unwrap();
        assert_eq!(chunked.presigned_download_urls.unwrap().len(), 1);
    }

    #[test]
    fn automation_event_tags_match_trigger_vocabulary() {
        let ev = AutomationEvent::AfterRunCommand {
            command: "cargo test".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "after_run_command");
    }
}
