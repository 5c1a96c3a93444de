#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-store** – Repository abstractions for the Ariana control plane.
//!
//! The controller's database is the single source of truth for cross-request
//! state; every in-process cache is rebuilt from it on startup. This crate
//! defines the repository contracts the orchestrator consumes and ships an
//! in-memory driver used by tests and single-process deployments. Durable
//! drivers implement the same traits in separate crates.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ariana_types::{
    AgentCommit, AgentId, AgentMessage, AgentPrompt, AgentRecord, AgentState, MachineId,
    MachineRecord, MachineSnapshot, MachineStatus, PromptId, PromptStatus, SnapshotId, UserId,
    UsageRecord,
};

pub mod memory;

pub use memory::MemoryStore;

//─────────────────────────────
//  Agents
//─────────────────────────────

/// Filter for multi-row agent queries.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    /// Restrict to one owner.
    pub user_id: Option<UserId>,
    /// Restrict to one state.
    pub state: Option<AgentState>,
    /// Only agents created after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Include soft-deleted agents.
    pub include_trashed: bool,
}

/// Durable agent records.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Look up a single agent.
    async fn find_by_id(&self, id: &AgentId) -> Result<Option<AgentRecord>>;
    /// Query agents by filter.
    async fn find_many(&self, filter: AgentFilter) -> Result<Vec<AgentRecord>>;
    /// Insert a new agent row.
    async fn insert(&self, agent: AgentRecord) -> Result<()>;
    /// Overwrite an existing agent row.
    async fn update(&self, agent: &AgentRecord) -> Result<()>;
    /// Remove an agent row permanently.
    async fn delete(&self, id: &AgentId) -> Result<()>;
    /// Stamp `last_auto_restored_at = now` so the sweep skips the agent for
    /// the rest of the calendar day.
    async fn set_auto_restored_now(&self, id: &AgentId) -> Result<()>;
}

//─────────────────────────────
//  Prompts
//─────────────────────────────

/// Per-agent FIFO prompt queue.
#[async_trait]
pub trait PromptRepository: Send + Sync {
    /// Append a prompt to the agent's queue.
    async fn insert(&self, prompt: AgentPrompt) -> Result<()>;
    /// Move a prompt to a new status.
    async fn update_status(&self, id: &PromptId, status: PromptStatus) -> Result<()>;
    /// Mark every active and queued prompt of the agent as failed. Called on
    /// every fatal agent error so the auto-restore sweep cannot loop.
    async fn fail_pending_for_agent(&self, agent_id: &AgentId) -> Result<usize>;
    /// All prompts of an agent in enqueue order.
    async fn list(&self, agent_id: &AgentId) -> Result<Vec<AgentPrompt>>;
}

//─────────────────────────────
//  Messages
//─────────────────────────────

/// Append-only (modulo dedup-in-place) message log.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Append a batch of messages.
    async fn bulk_insert(&self, messages: Vec<AgentMessage>) -> Result<()>;
    /// Insert, or update in place when a row with the same `api_message_id`
    /// already exists for the agent.
    async fn upsert_by_api_id(&self, message: AgentMessage) -> Result<()>;
    /// All messages of an agent in insertion order.
    async fn list(&self, agent_id: &AgentId) -> Result<Vec<AgentMessage>>;
    /// Copy the source agent's log onto the target, rewriting prompt
    /// references through the given id mapping. Used by the fresh-agent fork
    /// path only.
    async fn copy_with_mapping(
        &self,
        source: &AgentId,
        target: &AgentId,
        prompt_id_map: &HashMap<PromptId, PromptId>,
    ) -> Result<usize>;
}

//─────────────────────────────
//  Commits
//─────────────────────────────

/// Commit metadata per agent.
#[async_trait]
pub trait CommitRepository: Send + Sync {
    /// Record a commit created by the worker.
    async fn insert(&self, commit: AgentCommit) -> Result<()>;
    /// Overwrite a commit row (push state, revert flag).
    async fn update(&self, commit: &AgentCommit) -> Result<()>;
    /// All commits of an agent in creation order.
    async fn list(&self, agent_id: &AgentId) -> Result<Vec<AgentCommit>>;
}

//─────────────────────────────
//  Machines
//─────────────────────────────

/// VM reservation rows. The machine pool is the sole mutator.
#[async_trait]
pub trait MachineRepository: Send + Sync {
    /// Insert a freshly reserved machine.
    async fn insert(&self, machine: MachineRecord) -> Result<()>;
    /// Look up a machine.
    async fn find_by_id(&self, id: &MachineId) -> Result<Option<MachineRecord>>;
    /// Overwrite a machine row.
    async fn update(&self, machine: &MachineRecord) -> Result<()>;
    /// All machines not yet released.
    async fn list_unreleased(&self) -> Result<Vec<MachineRecord>>;
    /// Count of machines in `Reserved` or `Active` status.
    async fn active_count(&self) -> Result<usize>;
}

//─────────────────────────────
//  Snapshots
//─────────────────────────────

/// Immutable snapshot rows.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Record a snapshot captured by the machine's own worker.
    async fn insert_captured(&self, snapshot: MachineSnapshot) -> Result<()>;
    /// Record a carryover row referencing another machine's blob.
    async fn insert_carryover(&self, snapshot: MachineSnapshot) -> Result<()>;
    /// Most recent snapshot row for a machine.
    async fn find_latest_for_machine(&self, machine_id: &MachineId)
        -> Result<Option<MachineSnapshot>>;
    /// Rows whose `expires_at` is in the past.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<MachineSnapshot>>;
    /// Number of live rows referencing an object key. Blob deletion must wait
    /// until this reaches zero.
    async fn count_rows_for_key(&self, r2_key: &str) -> Result<usize>;
    /// Delete one snapshot row.
    async fn delete(&self, id: &SnapshotId) -> Result<()>;
}

//─────────────────────────────
//  Usage
//─────────────────────────────

/// Per-user and per-IP usage accounting consumed by the quota guard.
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// The user's counters, created on first access.
    async fn get_or_create(&self, user_id: &UserId) -> Result<UsageRecord>;
    /// Overwrite a usage row (monthly reset, increments).
    async fn update(&self, record: &UsageRecord) -> Result<()>;
    /// Record one agent creation event for sliding-window accounting.
    async fn record_creation(&self, user_id: &UserId, ip: IpAddr, at: DateTime<Utc>)
        -> Result<()>;
    /// Creations by the user since the given instant.
    async fn count_creations_since(&self, user_id: &UserId, since: DateTime<Utc>)
        -> Result<u64>;
    /// Creations from the IP since the given instant, across all users.
    async fn count_ip_creations_since(&self, ip: IpAddr, since: DateTime<Utc>) -> Result<u64>;
}

//─────────────────────────────
//  Aggregate handle
//─────────────────────────────

/// The bag of repository handles the orchestrator is wired with.
#[derive(Clone)]
pub struct Repositories {
    /// Agent rows.
    pub agents: Arc<dyn AgentRepository>,
    /// Prompt queues.
    pub prompts: Arc<dyn PromptRepository>,
    /// Message logs.
    pub messages: Arc<dyn MessageRepository>,
    /// Commit metadata.
    pub commits: Arc<dyn CommitRepository>,
    /// Machine reservations.
    pub machines: Arc<dyn MachineRepository>,
    /// Snapshot index.
    pub snapshots: Arc<dyn SnapshotRepository>,
    /// Usage counters.
    pub usage: Arc<dyn UsageRepository>,
}

impl Repositories {
    /// Wire every repository to a shared in-memory store.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            agents: store.clone(),
            prompts: store.clone(),
            messages: store.clone(),
            commits: store.clone(),
            machines: store.clone(),
            snapshots: store.clone(),
            usage: store,
        }
    }
}

/// Helper shared by drivers: true while a machine row occupies pool capacity.
pub fn occupies_capacity(status: MachineStatus) -> bool {
    matches!(status, MachineStatus::Reserved | MachineStatus::Active)
}
