#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-types** – Shared primitive data structures for the Ariana platform.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, cryptography, or storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Size constants
//─────────────────────────────

/// Maximum allowed size for prompt text to prevent memory exhaustion.
pub const MAX_PROMPT_TEXT_LEN: usize = 65_536;

/// Maximum allowed size for automation script bodies.
pub const MAX_SCRIPT_CONTENT_LEN: usize = 262_144;

/// Maximum allowed size for agent display names.
pub const MAX_AGENT_NAME_LEN: usize = 256;

/// Default snapshot retention before the garbage collector may delete it.
pub const SNAPSHOT_RETENTION_DAYS: i64 = 14;

//─────────────────────────────
//  Modules
//─────────────────────────────

/// Automation definitions: trigger union, script language, validation.
pub mod automation;
/// Platform-wide error taxonomy.
pub mod error;

pub use automation::{Automation, AutomationTrigger, ScriptLanguage};
pub use error::{CoreError, CoreResult, LimitType, QuotaDetail};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier of an agent (stable across resume; fresh on fork).
    AgentId
);
string_id!(
    /// Unique identifier of a platform user.
    UserId
);
string_id!(
    /// Unique identifier of a project.
    ProjectId
);
string_id!(
    /// Unique identifier of a VM reservation.
    MachineId
);
string_id!(
    /// Unique identifier of a queued prompt.
    PromptId
);
string_id!(
    /// Unique identifier of an automation.
    AutomationId
);
string_id!(
    /// Unique identifier of an environment bundle.
    EnvironmentId
);
string_id!(
    /// Unique identifier of a machine snapshot row.
    SnapshotId
);

//─────────────────────────────
//  Agent
//─────────────────────────────

/// Lifecycle state of an agent.
///
/// `Provisioning` is the initial state; `Archived` and `Error` are the
/// terminal states eligible for resume. `Ready` and `Idle` are both
/// "not currently running": `Idle` is the steady state entered after the
/// on-agent-ready automations have run once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// Waiting for the machine provider.
    Provisioning,
    /// VM booted, worker service not yet started.
    Provisioned,
    /// Worker is preparing the working tree.
    Cloning,
    /// Worker reachable, tree ready, no prompt active yet.
    Ready,
    /// Post-ready steady state between prompts.
    Idle,
    /// A prompt is actively being processed.
    Running,
    /// Machine released, rows kept, eligible for resume.
    Archived,
    /// Unrecoverable failure; eligible for resume.
    Error,
}

impl AgentState {
    /// States during which a machine must be attached.
    pub fn requires_machine(self) -> bool {
        !matches!(self, AgentState::Archived)
    }

    /// Transitional states during which a concurrent fork/resume caller must
    /// wait instead of starting a duplicate transfer.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            AgentState::Provisioning | AgentState::Provisioned | AgentState::Cloning
        )
    }

    /// States in which the agent counts against the live machine pool.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            AgentState::Provisioning
                | AgentState::Provisioned
                | AgentState::Cloning
                | AgentState::Ready
                | AgentState::Idle
                | AgentState::Running
        )
    }

    /// Whether a resume may be started from this state.
    pub fn is_resumable(self) -> bool {
        matches!(self, AgentState::Archived | AgentState::Error)
    }
}

/// Whether the agent runs on a platform-managed VM or a user-supplied host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// Platform-provisioned VM; forkable and snapshot-backed.
    Managed,
    /// User-supplied host; not forkable.
    Custom,
}

/// Durable record of an agent.
///
/// Invariants: `machine_id` is set iff `state != Archived`; `is_running` and
/// `is_ready` are derived from `state` and never true while the agent is
/// provisioning, errored, or archived; `branch_name` is unique per project
/// per owner once the first commit lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique id, stable across resume.
    pub id: AgentId,
    /// Owning user.
    pub user_id: UserId,
    /// Project the agent works on.
    pub project_id: ProjectId,
    /// Current VM, absent when archived.
    pub machine_id: Option<MachineId>,
    /// VM the agent ran on before it was archived.
    pub last_machine_id: Option<MachineId>,
    /// Branch the agent commits to.
    pub branch_name: String,
    /// Branch the agent branched from.
    pub base_branch: String,
    /// Commit the working tree started from.
    pub start_commit_sha: Option<String>,
    /// Latest non-reverted commit.
    pub last_commit_sha: Option<String>,
    /// Forge URL of the latest commit.
    pub last_commit_url: Option<String>,
    /// Current lifecycle state.
    pub state: AgentState,
    /// Environment bundle applied at start.
    pub environment_id: Option<EnvironmentId>,
    /// Derived: a prompt is actively processing.
    pub is_running: bool,
    /// Derived: the worker accepts prompts.
    pub is_ready: bool,
    /// Soft-deleted by the user.
    pub is_trashed: bool,
    /// Template agents may be forked by non-owners with environment inheritance.
    pub is_template: bool,
    /// Managed or custom host.
    pub machine_type: MachineType,
    /// Human-readable failure detail when `state == Error`.
    pub error_message: Option<String>,
    /// Last time the auto-restore sweep picked this agent up.
    pub last_auto_restored_at: Option<DateTime<Utc>>,
    /// Tip of the git-history mirror last pushed to the forge.
    pub git_history_last_pushed_commit_sha: Option<String>,
    /// Timestamp of the latest commit.
    pub last_commit_at: Option<DateTime<Utc>>,
    /// Whether the latest commit has been pushed.
    pub last_commit_pushed: bool,
    /// Generated name of the latest commit.
    pub last_commit_name: Option<String>,
    /// Text of the most recent prompt.
    pub last_prompt_text: Option<String>,
    /// Timestamp of the most recent prompt.
    pub last_prompt_at: Option<DateTime<Utc>>,
    /// Name of the last tool the assistant invoked.
    pub last_tool_name: Option<String>,
    /// Target (file/command) of the last tool invocation.
    pub last_tool_target: Option<String>,
    /// Timestamp of the last tool invocation.
    pub last_tool_at: Option<DateTime<Utc>>,
    /// LLM-generated one-line summary of the agent's task. Cleared on fork so
    /// the new agent regenerates one on its first prompt.
    pub task_summary: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Apply a state change, keeping the derived flags consistent.
    pub fn set_state(&mut self, state: AgentState) {
        self.state = state;
        self.is_running = matches!(state, AgentState::Running);
        self.is_ready = matches!(
            state,
            AgentState::Ready | AgentState::Idle | AgentState::Running
        );
        if state == AgentState::Archived {
            self.last_machine_id = self.machine_id.take().or(self.last_machine_id.take());
        }
    }

    /// The machine whose snapshot index a fork/resume should consult.
    pub fn snapshot_machine_id(&self) -> Option<&MachineId> {
        self.machine_id.as_ref().or(self.last_machine_id.as_ref())
    }
}

//─────────────────────────────
//  Machine
//─────────────────────────────

/// Reservation status of a VM. The machine pool is the sole mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// Slot claimed, VM being created.
    Reserved,
    /// VM booted and attached to its agent.
    Active,
    /// Destruction started; accounting not yet updated.
    Releasing,
    /// Slot free again.
    Released,
}

/// A VM reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    /// Unique machine id.
    pub id: MachineId,
    /// VM address.
    pub ipv4: String,
    /// Optional public URL routed through the TLS gateway.
    pub url: Option<String>,
    /// Agent currently owning this machine.
    pub owner_agent_id: Option<AgentId>,
    /// Pool status.
    pub status: MachineStatus,
    /// Secret established at provisioning; the per-agent wire key is derived
    /// from it.
    pub agent_secret: String,
}

//─────────────────────────────
//  Snapshot
//─────────────────────────────

/// Where a snapshot row's blob came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotSource {
    /// Image captured from the row's own machine.
    Captured,
    /// Row references a blob uploaded by a different machine.
    CarriedOver,
}

/// Immutable record of a filesystem image in object storage.
///
/// A trailing slash on `r2_key` marks a chunked upload whose parts are listed
/// under the key prefix; otherwise the key names a single object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// Row id.
    pub id: SnapshotId,
    /// Machine this row belongs to.
    pub machine_id: MachineId,
    /// Object-store key (prefix when chunked).
    pub r2_key: String,
    /// Total image size.
    pub size_bytes: u64,
    /// Upload completion time.
    pub created_at: DateTime<Utc>,
    /// Garbage-collection deadline.
    pub expires_at: DateTime<Utc>,
    /// Captured or carried over.
    pub source: SnapshotSource,
}

impl MachineSnapshot {
    /// True when `r2_key` names a chunk prefix rather than a single object.
    pub fn is_chunked(&self) -> bool {
        self.r2_key.ends_with('/')
    }
}

//─────────────────────────────
//  Prompt queue
//─────────────────────────────

/// Status of a queued prompt. At most one prompt per agent is `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    /// Waiting in the FIFO queue.
    Queued,
    /// Currently being processed by the assistant.
    Active,
    /// Completed successfully.
    Done,
    /// Failed or abandoned after a fatal agent error.
    Failed,
}

/// A queued user prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPrompt {
    /// Prompt id.
    pub id: PromptId,
    /// Agent the prompt targets.
    pub agent_id: AgentId,
    /// Prompt text.
    pub text: String,
    /// Queue status.
    pub status: PromptStatus,
    /// Enqueue time; FIFO order follows it.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Message log
//─────────────────────────────

/// Author of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Written by the user.
    User,
    /// Produced by the assistant.
    Assistant,
}

/// One entry of an agent's append-only message log.
///
/// `api_message_id` is the assistant's stable id for the logical message; the
/// streaming assistant re-yields the same id as content grows, and the log is
/// updated in place for a known id rather than appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Log entry id.
    pub id: String,
    /// Agent the message belongs to.
    pub agent_id: AgentId,
    /// Prompt that produced the message, when known.
    pub prompt_id: Option<PromptId>,
    /// The assistant API's stable message id, used for dedup-on-update.
    pub api_message_id: String,
    /// Author.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Commits
//─────────────────────────────

/// A commit created by the worker on the agent's branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommit {
    /// Agent that created the commit.
    pub agent_id: AgentId,
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
    /// Whether the commit has been pushed to the forge.
    pub pushed: bool,
    /// Whether the commit has been reverted.
    pub is_reverted: bool,
}

//─────────────────────────────
//  Environment bundles
//─────────────────────────────

/// A secret file materialized into the working tree at setup time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretFile {
    /// Repo-relative destination path.
    pub path: String,
    /// File contents.
    pub contents: String,
}

/// An SSH key pair installed on the worker VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeyPair {
    /// Public half.
    pub public_key: String,
    /// Private half.
    pub private_key: String,
}

/// Reusable environment definition agents point at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentBundle {
    /// Bundle id.
    pub id: EnvironmentId,
    /// Project the bundle belongs to.
    pub project_id: ProjectId,
    /// Owning user.
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    /// Dotenv text applied to the worker process environment.
    pub env_contents: String,
    /// Secret files written into the tree.
    pub secret_files: Vec<SecretFile>,
    /// Optional SSH identity.
    pub ssh_key_pair: Option<SshKeyPair>,
    /// Automations installed by this bundle, by reference.
    pub automation_ids: Vec<AutomationId>,
}

//─────────────────────────────
//  Usage accounting
//─────────────────────────────

/// Per-user resource counters consulted by the quota guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// User the counters belong to.
    pub user_id: UserId,
    /// Projects ever created.
    pub projects_total: u64,
    /// Agents created since the last monthly reset.
    pub agents_this_month: u64,
    /// When `agents_this_month` last reset.
    pub agents_month_reset_at: DateTime<Utc>,
}
