//! Top-level agent state machine.
//!
//! Admits user requests through the quota guard, walks each agent from
//! provisioning to idle, routes prompts and interrupts to workers, archives
//! with a final snapshot, and sweeps errored agents back to life. Fork and
//! resume live in the transfer module on the same type.
//!
//! ```text
//!         create
//!   ───► PROVISIONING ──provider ok──► PROVISIONED ──setup ok──► CLONING ──clone ok──► READY
//!                                                                                       │
//!                                                         on_agent_ready ran once ──► IDLE ◄──┐
//!                                                                                       │     │
//!                                                                prompt active ──► RUNNING ───┘
//!                                       archive / idle TTL
//!                                                │
//!                                                ▼
//!                                            ARCHIVED ── resume / fork ──► PROVISIONING
//!   any state ── unrecoverable error ──► ERROR
//! ```

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use ariana_store::{AgentFilter, Repositories};
use ariana_types::{
    AgentId, AgentPrompt, AgentRecord, AgentState, CoreError, EnvironmentId, MachineRecord,
    MachineType, PromptId, PromptStatus, ProjectId, UserId,
};
use ariana_wire::{
    AutomationEvent, CommitInfo, ExecuteAutomationsRequest, ExecuteAutomationsResponse,
    GitCommitRequest, GitCommitResponse, GitPushRequest, GitPushResponse, InterruptRequest,
    PromptRequest, SetupMode, StartRequest, StartResponse, EP_EXECUTE_AUTOMATIONS,
    EP_GIT_COMMIT, EP_GIT_PUSH, EP_INTERRUPT, EP_PROMPT, EP_START,
};

use crate::environment::EnvironmentRegistry;
use crate::events::{ControllerEvent, EventBus, InMemoryBus};
use crate::gateway::PortDomainRegistry;
use crate::pool::MachinePool;
use crate::quota::QuotaGuard;
use crate::snapshot::SnapshotService;
use crate::transport::{WorkerClient, WorkerTransport};

/// Tunables of the orchestration loops.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long `create` may wait in the reservation queue.
    pub reserve_timeout: Duration,
    /// Health probes after a snapshot restore.
    pub health_probe_attempts: usize,
    /// Delay between health probes.
    pub health_probe_interval: Duration,
    /// `/start` attempts after a restore (the worker's service restarts
    /// right after an image is restored).
    pub start_attempts: usize,
    /// Back-off between `/start` attempts.
    pub start_backoff: Duration,
    /// Deadline of the final snapshot taken by `archive`.
    pub archive_snapshot_deadline: Duration,
    /// Deadline of the `/restore-snapshot` call.
    pub restore_deadline: Duration,
    /// Git author identity configured on every working tree.
    pub git_user_name: String,
    /// Git author email.
    pub git_user_email: String,
    /// Only agents errored within this window are auto-restored.
    pub auto_restore_window: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reserve_timeout: Duration::from_secs(60),
            health_probe_attempts: 15,
            health_probe_interval: Duration::from_secs(2),
            start_attempts: 10,
            start_backoff: Duration::from_secs(3),
            archive_snapshot_deadline: Duration::from_secs(10 * 60),
            restore_deadline: Duration::from_secs(10 * 60),
            git_user_name: "Ariana Agent".to_string(),
            git_user_email: "agent@ariana.dev".to_string(),
            auto_restore_window: chrono::Duration::hours(48),
        }
    }
}

/// Outcome broadcast to callers waiting on an in-flight transfer.
pub(crate) type TransferOutcome = Option<Result<AgentId, String>>;

/// Request to create a fresh agent.
#[derive(Debug, Clone)]
pub struct CreateAgentRequest {
    /// Project the agent works on.
    pub project_id: ProjectId,
    /// Owner.
    pub user_id: UserId,
    /// Caller address for per-IP quotas.
    pub ip: IpAddr,
    /// Optional display name (defaults to the generated id).
    pub name: Option<String>,
    /// Environment bundle applied at start.
    pub environment_id: Option<EnvironmentId>,
    /// How the worker initializes the tree.
    pub setup: SetupMode,
    /// Branch to base the agent branch on.
    pub base_branch: String,
}

/// Top-level agent orchestrator.
pub struct Orchestrator {
    pub(crate) repos: Repositories,
    /// Underlying machine pool backing this orchestrator.
    pub pool: Arc<MachinePool>,
    pub(crate) quota: Arc<QuotaGuard>,
    pub(crate) snapshots: Arc<SnapshotService>,
    pub(crate) transport: Arc<dyn WorkerTransport>,
    pub(crate) environments: Arc<EnvironmentRegistry>,
    pub(crate) gateway: Arc<PortDomainRegistry>,
    pub(crate) bus: InMemoryBus,
    pub(crate) config: OrchestratorConfig,
    /// Single-flight registry of in-progress transfers, keyed by source
    /// agent. Later callers wait on the watch instead of forking twice.
    pub(crate) inflight: Mutex<HashMap<AgentId, watch::Receiver<TransferOutcome>>>,
}

impl Orchestrator {
    /// Wire an orchestrator from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        pool: Arc<MachinePool>,
        quota: Arc<QuotaGuard>,
        snapshots: Arc<SnapshotService>,
        transport: Arc<dyn WorkerTransport>,
        environments: Arc<EnvironmentRegistry>,
        gateway: Arc<PortDomainRegistry>,
        bus: InMemoryBus,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            repos,
            pool,
            quota,
            snapshots,
            transport,
            environments,
            gateway,
            bus,
            config,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to the controller event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ControllerEvent> {
        self.bus.subscribe()
    }

    //─────────────────────────────
    //  Create
    //─────────────────────────────

    /// Admit and provision a brand-new agent.
    #[instrument(skip(self, request), fields(user = %request.user_id, project = %request.project_id))]
    pub async fn create(&self, request: CreateAgentRequest) -> Result<AgentId, CoreError> {
        self.quota
            .check_agent_creation(&request.user_id, request.ip)
            .await?;

        let machine = self
            .pool
            .reserve(&request.user_id, Some(self.config.reserve_timeout))
            .await?;

        let agent_id = AgentId(Uuid::new_v4().to_string());
        let branch_slug = request
            .name
            .as_deref()
            .map(slugify)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| agent_id.to_string());
        let mut agent = AgentRecord {
            id: agent_id.clone(),
            user_id: request.user_id.clone(),
            project_id: request.project_id.clone(),
            machine_id: Some(machine.id.clone()),
            last_machine_id: None,
            branch_name: format!("ariana/{branch_slug}"),
            base_branch: request.base_branch.clone(),
            start_commit_sha: None,
            last_commit_sha: None,
            last_commit_url: None,
            state: AgentState::Provisioning,
            environment_id: request.environment_id.clone(),
            is_running: false,
            is_ready: false,
            is_trashed: false,
            is_template: false,
            machine_type: MachineType::Managed,
            error_message: None,
            last_auto_restored_at: None,
            git_history_last_pushed_commit_sha: None,
            last_commit_at: None,
            last_commit_pushed: false,
            last_commit_name: None,
            last_prompt_text: None,
            last_prompt_at: None,
            last_tool_name: None,
            last_tool_target: None,
            last_tool_at: None,
            task_summary: None,
            created_at: Utc::now(),
        };

        self.repos
            .agents
            .insert(agent.clone())
            .await
            .map_err(|e| CoreError::ProvisioningFailed(e.to_string()))?;
        self.pool
            .activate(&machine.id, &agent.id)
            .await
            .map_err(|e| CoreError::ProvisioningFailed(e.to_string()))?;
        if let Err(error) = self
            .quota
            .record_agent_creation(&request.user_id, request.ip)
            .await
        {
            warn!(%error, "usage recording failed");
        }

        info!(agent = %agent.id, machine = %machine.id, "agent admitted");

        match self
            .drive_to_ready(&mut agent, &machine, request.setup.clone(), false)
            .await
        {
            Ok(()) => {
                self.finish_ready(&mut agent, &machine).await;
                Ok(agent.id)
            }
            Err(error) => {
                self.fail_agent(&mut agent, &error).await;
                Err(error)
            }
        }
    }

    /// Walk an agent with a fresh machine through PROVISIONED → CLONING →
    /// READY. `restored` selects the post-restore retry budget for `/start`.
    pub(crate) async fn drive_to_ready(
        &self,
        agent: &mut AgentRecord,
        machine: &MachineRecord,
        setup: SetupMode,
        restored: bool,
    ) -> Result<(), CoreError> {
        self.set_state(agent, AgentState::Provisioned).await;
        self.set_state(agent, AgentState::Cloning).await;

        let response = self.post_start(agent, machine, setup, restored).await?;

        if agent.start_commit_sha.is_none() {
            agent.start_commit_sha = response.start_commit_sha.clone();
        }
        if response.git_history_last_pushed_commit_sha.is_some() {
            agent.git_history_last_pushed_commit_sha =
                response.git_history_last_pushed_commit_sha.clone();
        }
        self.set_state(agent, AgentState::Ready).await;
        Ok(())
    }

    /// POST `/start`, retrying with back-off. Each attempt after a restore
    /// first re-probes health because the worker's service restarts right
    /// after an image is restored.
    pub(crate) async fn post_start(
        &self,
        agent: &AgentRecord,
        machine: &MachineRecord,
        setup: SetupMode,
        restored: bool,
    ) -> Result<StartResponse, CoreError> {
        let client = self.worker_client(machine);
        let (env_contents, secret_files, ssh_key_pair, automations) = match &agent.environment_id {
            Some(env_id) => {
                let bundle = self.environments.get(env_id);
                (
                    bundle.as_ref().map(|b| b.env_contents.clone()),
                    bundle
                        .as_ref()
                        .map(|b| b.secret_files.clone())
                        .unwrap_or_default(),
                    bundle.and_then(|b| b.ssh_key_pair),
                    self.environments.automations(env_id),
                )
            }
            None => (None, Vec::new(), None, Vec::new()),
        };

        let request = StartRequest {
            setup,
            branch_name: agent.branch_name.clone(),
            git_user_name: self.config.git_user_name.clone(),
            git_user_email: self.config.git_user_email.clone(),
            env_contents,
            secret_files,
            ssh_key_pair,
            automations,
            dont_send_initial_message: restored,
        };

        let attempts = if restored { self.config.start_attempts } else { 1 };
        let mut last_error = CoreError::StartFailed("no start attempt made".to_string());
        for attempt in 1..=attempts {
            if restored && !client.is_healthy().await {
                last_error =
                    CoreError::StartFailed(format!("worker unhealthy before attempt {attempt}"));
                tokio::time::sleep(self.config.start_backoff).await;
                continue;
            }
            match client
                .post::<_, StartResponse>(EP_START, &request)
                .await
            {
                Ok(response) if response.status == "ok" => return Ok(response),
                Ok(response) => {
                    last_error = CoreError::StartFailed(format!(
                        "worker start reported {}: {}",
                        response.status,
                        response.git_info_error.unwrap_or_default()
                    ));
                }
                Err(error) => {
                    warn!(agent = %agent.id, attempt, %error, "start attempt failed");
                    last_error = error;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.start_backoff).await;
            }
        }
        Err(last_error)
    }

    /// READY → IDLE: run the on-agent-ready automations exactly once, then
    /// settle. This is the only place those automations are triggered.
    pub(crate) async fn finish_ready(&self, agent: &mut AgentRecord, machine: &MachineRecord) {
        let client = self.worker_client(machine);
        match client
            .post::<_, ExecuteAutomationsResponse>(
                EP_EXECUTE_AUTOMATIONS,
                &ExecuteAutomationsRequest {
                    event: AutomationEvent::AgentReady,
                },
            )
            .await
        {
            Ok(response) if !response.started.is_empty() => {
                info!(agent = %agent.id, count = response.started.len(), "on-ready automations started");
            }
            Ok(_) => {}
            Err(error) => warn!(agent = %agent.id, %error, "on-ready automation dispatch failed"),
        }
        self.set_state(agent, AgentState::Idle).await;
    }

    //─────────────────────────────
    //  Prompts & interrupt
    //─────────────────────────────

    /// Append a prompt; resumes an archived/errored agent first when the
    /// caller owns it.
    #[instrument(skip(self, text))]
    pub async fn submit_prompt(
        &self,
        agent_id: &AgentId,
        caller: &UserId,
        text: String,
    ) -> Result<PromptId, CoreError> {
        let agent = self.must_find(agent_id).await?;
        let is_owner = &agent.user_id == caller;

        if !is_owner && agent.state.is_transitional() {
            return Err(CoreError::Validation("agent not ready".to_string()));
        }

        let prompt = AgentPrompt {
            id: PromptId(Uuid::new_v4().to_string()),
            agent_id: agent_id.clone(),
            text: text.clone(),
            status: PromptStatus::Queued,
            created_at: Utc::now(),
        };
        self.repos
            .prompts
            .insert(prompt.clone())
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        self.bus
            .publish(&ControllerEvent::PromptUpdated {
                agent_id: agent_id.clone(),
                prompt_id: prompt.id.clone(),
                status: PromptStatus::Queued,
            })
            .ok();

        let mut agent = agent;
        if agent.state.is_resumable() {
            if !is_owner {
                return Err(CoreError::Auth(
                    "only the owner can resume an archived agent".to_string(),
                ));
            }
            let resumed = self.fork(agent_id, caller, false).await?;
            agent = self.must_find(&resumed).await?;
        }

        let machine = self.machine_of(&agent).await?;
        let client = self.worker_client(&machine);
        client
            .post::<_, serde_json::Value>(
                EP_PROMPT,
                &PromptRequest {
                    prompt_id: prompt.id.clone(),
                    text,
                    model: None,
                },
            )
            .await?;

        agent.last_prompt_text = Some(prompt.text.clone());
        agent.last_prompt_at = Some(Utc::now());
        self.set_state(&mut agent, AgentState::Running).await;
        Ok(prompt.id)
    }

    /// Cancel the active prompt and all running blocking automations. The
    /// conversation survives; the next prompt resumes the same session.
    pub async fn interrupt(&self, agent_id: &AgentId, caller: &UserId) -> Result<(), CoreError> {
        let mut agent = self.must_find(agent_id).await?;
        if &agent.user_id != caller {
            return Err(CoreError::Auth("not the agent owner".to_string()));
        }
        let machine = self.machine_of(&agent).await?;
        let client = self.worker_client(&machine);
        client
            .post::<_, serde_json::Value>(EP_INTERRUPT, &InterruptRequest {})
            .await?;

        // The active prompt is gone; queued prompts stay queued.
        let prompts = self
            .repos
            .prompts
            .list(agent_id)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        for prompt in prompts.iter().filter(|p| p.status == PromptStatus::Active) {
            self.repos
                .prompts
                .update_status(&prompt.id, PromptStatus::Failed)
                .await
                .ok();
            self.bus
                .publish(&ControllerEvent::PromptUpdated {
                    agent_id: agent_id.clone(),
                    prompt_id: prompt.id.clone(),
                    status: PromptStatus::Failed,
                })
                .ok();
        }

        if agent.state == AgentState::Running {
            self.set_state(&mut agent, AgentState::Idle).await;
        }
        Ok(())
    }

    //─────────────────────────────
    //  Commits & pushes
    //─────────────────────────────

    /// Ask the worker to commit the working tree; record the commit row and
    /// the agent's denormalized commit fields.
    pub async fn commit(
        &self,
        agent_id: &AgentId,
        caller: &UserId,
        message: Option<String>,
    ) -> Result<Option<CommitInfo>, CoreError> {
        let mut agent = self.must_find(agent_id).await?;
        if &agent.user_id != caller {
            return Err(CoreError::Auth("not the agent owner".to_string()));
        }
        let machine = self.machine_of(&agent).await?;
        let client = self.worker_client(&machine);
        let response: GitCommitResponse = client
            .post(EP_GIT_COMMIT, &GitCommitRequest { message })
            .await?;

        if let Some(commit) = &response.commit {
            self.repos
                .commits
                .insert(ariana_types::AgentCommit {
                    agent_id: agent_id.clone(),
                    sha: commit.sha.clone(),
                    message: commit.message.clone(),
                    timestamp: commit.timestamp,
                    additions: commit.additions,
                    deletions: commit.deletions,
                    pushed: false,
                    is_reverted: false,
                })
                .await
                .map_err(|e| CoreError::Validation(e.to_string()))?;

            agent.last_commit_sha = Some(commit.sha.clone());
            agent.last_commit_name = Some(commit.message.clone());
            agent.last_commit_at = Some(commit.timestamp);
            agent.last_commit_pushed = false;
            self.repos.agents.update(&agent).await.ok();
            info!(agent = %agent_id, sha = %commit.sha, "commit recorded");
        }
        Ok(response.commit)
    }

    /// Ask the worker to push the agent branch; mark commit rows pushed.
    pub async fn push(
        &self,
        agent_id: &AgentId,
        caller: &UserId,
        force: bool,
    ) -> Result<String, CoreError> {
        let mut agent = self.must_find(agent_id).await?;
        if &agent.user_id != caller {
            return Err(CoreError::Auth("not the agent owner".to_string()));
        }
        let machine = self.machine_of(&agent).await?;
        let client = self.worker_client(&machine);
        let response: GitPushResponse = client
            .post(EP_GIT_PUSH, &GitPushRequest { force })
            .await?;

        let commits = self
            .repos
            .commits
            .list(agent_id)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        for mut commit in commits.into_iter().filter(|c| !c.pushed && !c.is_reverted) {
            commit.pushed = true;
            self.repos.commits.update(&commit).await.ok();
        }

        agent.last_commit_pushed = true;
        agent.git_history_last_pushed_commit_sha = Some(response.pushed_sha.clone());
        self.repos.agents.update(&agent).await.ok();
        info!(agent = %agent_id, sha = %response.pushed_sha, "branch pushed");
        Ok(response.pushed_sha)
    }

    //─────────────────────────────
    //  Archive
    //─────────────────────────────

    /// Final snapshot, machine release, rows kept.
    #[instrument(skip(self))]
    pub async fn archive(&self, agent_id: &AgentId) -> Result<(), CoreError> {
        let mut agent = self.must_find(agent_id).await?;
        if agent.state == AgentState::Archived {
            return Ok(());
        }
        let Some(machine_id) = agent.machine_id.clone() else {
            return Err(CoreError::Validation("agent has no machine".to_string()));
        };

        match tokio::time::timeout(
            self.config.archive_snapshot_deadline,
            self.snapshots.capture(&machine_id),
        )
        .await
        {
            Ok(Ok(snapshot)) => {
                self.bus
                    .publish(&ControllerEvent::SnapshotRecorded {
                        machine_id: machine_id.clone(),
                        snapshot_id: snapshot.id,
                    })
                    .ok();
            }
            Ok(Err(error)) => {
                // The agent still archives; it just cannot be resumed until a
                // newer snapshot exists.
                warn!(agent = %agent_id, %error, "final snapshot failed");
            }
            Err(_) => {
                warn!(agent = %agent_id, "final snapshot exceeded its deadline");
            }
        }

        self.pool
            .release(&machine_id)
            .await
            .map_err(|e| CoreError::ProvisioningFailed(e.to_string()))?;
        self.gateway.unregister_agent(agent_id);
        self.set_state(&mut agent, AgentState::Archived).await;
        info!(agent = %agent_id, "agent archived");
        Ok(())
    }

    /// Resume an agent onto a fresh VM, keeping its identity.
    pub async fn reboot(&self, agent_id: &AgentId, caller: &UserId) -> Result<AgentId, CoreError> {
        self.fork(agent_id, caller, false).await
    }

    //─────────────────────────────
    //  Auto-restore sweep
    //─────────────────────────────

    /// One pass of the auto-restore sweep: resume at most one recently
    /// errored agent per user per calendar day, without charging quota.
    pub async fn auto_restore_sweep(&self) -> usize {
        let cutoff = Utc::now() - self.config.auto_restore_window;
        let errored = match self
            .repos
            .agents
            .find_many(AgentFilter {
                state: Some(AgentState::Error),
                created_after: Some(cutoff),
                ..AgentFilter::default()
            })
            .await
        {
            Ok(agents) => agents,
            Err(error) => {
                error!(%error, "auto-restore scan failed");
                return 0;
            }
        };

        let today = Utc::now().date_naive();
        let mut restored = 0;
        let mut users_seen: HashSet<UserId> = HashSet::new();
        for agent in errored {
            if agent
                .last_auto_restored_at
                .map(|t| t.date_naive() == today)
                .unwrap_or(false)
            {
                continue;
            }
            if !users_seen.insert(agent.user_id.clone()) {
                continue;
            }

            // Stamp before attempting so a failing agent cannot be retried in
            // a loop within the same day.
            if let Err(error) = self.repos.agents.set_auto_restored_now(&agent.id).await {
                warn!(agent = %agent.id, %error, "auto-restore stamp failed");
                continue;
            }

            info!(agent = %agent.id, "auto-restoring errored agent");
            match self.fork(&agent.id, &agent.user_id.clone(), false).await {
                Ok(_) => restored += 1,
                Err(error) => {
                    warn!(agent = %agent.id, %error, "auto-restore failed");
                    if let Ok(Some(mut current)) = self.repos.agents.find_by_id(&agent.id).await {
                        self.fail_agent(&mut current, &error).await;
                    }
                }
            }
        }
        restored
    }

    /// Probe custom-machine agents and error the unreachable ones.
    pub async fn check_custom_machines(&self) -> usize {
        let agents = match self.repos.agents.find_many(AgentFilter::default()).await {
            Ok(agents) => agents,
            Err(_) => return 0,
        };
        let mut failed = 0;
        for mut agent in agents
            .into_iter()
            .filter(|a| a.machine_type == MachineType::Custom && a.state.is_live())
        {
            let Ok(machine) = self.machine_of(&agent).await else {
                continue;
            };
            let client = self.worker_client(&machine);
            if !client.is_healthy().await {
                warn!(agent = %agent.id, "custom machine unreachable");
                self.bus
                    .publish(&ControllerEvent::WorkerUnreachable {
                        agent_id: agent.id.clone(),
                    })
                    .ok();
                self.fail_agent(
                    &mut agent,
                    &CoreError::ProvisioningFailed("custom machine unreachable".to_string()),
                )
                .await;
                failed += 1;
            }
        }
        failed
    }

    //─────────────────────────────
    //  Shared helpers
    //─────────────────────────────

    pub(crate) async fn must_find(&self, agent_id: &AgentId) -> Result<AgentRecord, CoreError> {
        self.repos
            .agents
            .find_by_id(agent_id)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?
            .ok_or_else(|| CoreError::Validation(format!("unknown agent {agent_id}")))
    }

    pub(crate) async fn machine_of(
        &self,
        agent: &AgentRecord,
    ) -> Result<MachineRecord, CoreError> {
        let machine_id = agent
            .machine_id
            .as_ref()
            .ok_or_else(|| CoreError::Validation("agent has no machine".to_string()))?;
        self.repos
            .machines
            .find_by_id(machine_id)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?
            .ok_or_else(|| CoreError::Validation(format!("unknown machine {machine_id}")))
    }

    pub(crate) fn worker_client(&self, machine: &MachineRecord) -> WorkerClient {
        let base_url = machine
            .url
            .clone()
            .unwrap_or_else(|| format!("http://{}:8420", machine.ipv4));
        WorkerClient::new(self.transport.clone(), base_url, &machine.agent_secret)
    }

    /// Persist and broadcast a state change.
    pub(crate) async fn set_state(&self, agent: &mut AgentRecord, state: AgentState) {
        agent.set_state(state);
        if let Err(error) = self.repos.agents.update(agent).await {
            error!(agent = %agent.id, %error, "agent update failed");
        }
        self.bus
            .publish(&ControllerEvent::AgentStateChanged {
                agent_id: agent.id.clone(),
                state,
                error_message: agent.error_message.clone(),
            })
            .ok();
    }

    /// Terminal failure: ERROR state, queued prompts failed (so the
    /// auto-restore sweep cannot loop), machine released.
    pub(crate) async fn fail_agent(&self, agent: &mut AgentRecord, error: &CoreError) {
        error!(agent = %agent.id, %error, "agent failed");
        agent.error_message = Some(error.to_string());

        if let Ok(failed) = self.repos.prompts.fail_pending_for_agent(&agent.id).await {
            if failed > 0 {
                info!(agent = %agent.id, failed, "pending prompts failed");
            }
        }
        if let Some(machine_id) = agent.machine_id.clone() {
            if let Err(release_error) = self.pool.release(&machine_id).await {
                warn!(agent = %agent.id, %release_error, "machine release failed");
            }
        }
        self.gateway.unregister_agent(&agent.id);
        self.set_state(agent, AgentState::Error).await;
        self.bus
            .publish(&ControllerEvent::TransferFailed {
                agent_id: agent.id.clone(),
                error: error.to_string(),
            })
            .ok();
    }

}

/// Lowercase, dash-separated branch slug from a display name.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}
