//! Fork/resume engine with snapshot transfer.
//!
//! A transfer always ends in one of exactly two shapes: the original agent on
//! a new machine with preserved branch, conversation, commit history, and
//! environment (resume), or a brand-new agent with copied conversation and
//! history at the parent's branch tip (fork). Never in between.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument};
use uuid::Uuid;

use ariana_types::{
    AgentId, AgentPrompt, AgentRecord, AgentState, CoreError, MachineRecord, MachineType,
    PromptId, UserId,
};
use ariana_wire::{
    RestoreSnapshotRequest, RestoreSnapshotResponse, SetupMode, EP_RESTORE_SNAPSHOT,
};

use crate::events::{ControllerEvent, EventBus};
use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Fork or resume an agent from its latest snapshot.
    ///
    /// With `force_new_agent=false` and the caller owning an archived or
    /// errored source, the source itself is resumed (same id). Otherwise a
    /// new agent row is created with copied conversation and history.
    /// Concurrent callers against the same source are collapsed onto one
    /// in-flight transfer and receive the same result.
    #[instrument(skip(self))]
    pub async fn fork(
        &self,
        source_id: &AgentId,
        new_owner: &UserId,
        force_new_agent: bool,
    ) -> Result<AgentId, CoreError> {
        let source = self.must_find(source_id).await?;

        // Eligibility: only managed machines are snapshot-backed.
        if source.machine_type == MachineType::Custom {
            return Err(CoreError::Validation(
                "agents on custom machines cannot be forked".to_string(),
            ));
        }
        let snapshot_machine = source.snapshot_machine_id().cloned().ok_or_else(|| {
            CoreError::SnapshotMissing {
                machine_id: "<none>".to_string(),
            }
        })?;
        let snapshot = self
            .snapshots
            .find_latest(&snapshot_machine)
            .await?
            .ok_or_else(|| CoreError::SnapshotMissing {
                machine_id: snapshot_machine.0.clone(),
            })?;

        let same_owner = &source.user_id == new_owner;
        let resume = !force_new_agent && same_owner && source.state.is_resumable();

        // Race guard: a second resume of the same source waits for the first
        // and returns its result instead of forking twice. Check and register
        // under one lock so two callers can never both become the leader.
        let (tx, _rx) = watch::channel(None);
        if !force_new_agent && same_owner {
            let join = {
                let mut inflight = self.inflight.lock().await;
                match inflight.get(source_id).cloned() {
                    Some(existing) => Some(existing),
                    None => {
                        if resume {
                            inflight.insert(source_id.clone(), tx.subscribe());
                        }
                        None
                    }
                }
            };
            if let Some(mut rx) = join {
                info!(source = %source_id, "joining in-flight transfer");
                return wait_for_outcome(&mut rx).await;
            }
            if source.state.is_transitional() {
                // Transitional without an in-flight entry (e.g. initial
                // provisioning): wait for it to settle, then return as-is.
                return self.wait_out_transition(source_id).await;
            }
        }

        let snapshot_source_machine = snapshot.machine_id.clone();
        let result = self
            .run_transfer(&source, new_owner, resume, &snapshot_source_machine, snapshot)
            .await;

        if resume {
            self.inflight.lock().await.remove(source_id);
        }
        let _ = tx.send(Some(
            result
                .as_ref()
                .map(|id| id.clone())
                .map_err(|e| e.to_string()),
        ));
        result
    }

    /// Poll a transitional agent until it settles, then return it.
    async fn wait_out_transition(&self, agent_id: &AgentId) -> Result<AgentId, CoreError> {
        loop {
            let agent = self.must_find(agent_id).await?;
            if !agent.state.is_transitional() {
                return match agent.state {
                    AgentState::Error => Err(CoreError::ProvisioningFailed(
                        agent.error_message.unwrap_or_else(|| "agent errored".to_string()),
                    )),
                    _ => Ok(agent.id),
                };
            }
            tokio::time::sleep(self.config.health_probe_interval).await;
        }
    }

    async fn run_transfer(
        &self,
        source: &AgentRecord,
        new_owner: &UserId,
        resume: bool,
        snapshot_machine: &ariana_types::MachineId,
        snapshot: ariana_types::MachineSnapshot,
    ) -> Result<AgentId, CoreError> {
        // Choose target: reuse the source row on resume, otherwise a fresh
        // agent inheriting the environment only within the same owner or from
        // a template.
        let mut target = if resume {
            let mut target = source.clone();
            target.error_message = None;
            target
        } else {
            let same_owner = &source.user_id == new_owner;
            let id = AgentId(Uuid::new_v4().to_string());
            AgentRecord {
                id: id.clone(),
                user_id: new_owner.clone(),
                project_id: source.project_id.clone(),
                machine_id: None,
                last_machine_id: None,
                branch_name: source.branch_name.clone(),
                base_branch: source.base_branch.clone(),
                start_commit_sha: source.start_commit_sha.clone(),
                last_commit_sha: source.last_commit_sha.clone(),
                last_commit_url: source.last_commit_url.clone(),
                state: AgentState::Provisioning,
                environment_id: if same_owner || source.is_template {
                    source.environment_id.clone()
                } else {
                    None
                },
                is_running: false,
                is_ready: false,
                is_trashed: false,
                is_template: false,
                machine_type: MachineType::Managed,
                error_message: None,
                last_auto_restored_at: None,
                git_history_last_pushed_commit_sha: source
                    .git_history_last_pushed_commit_sha
                    .clone(),
                last_commit_at: source.last_commit_at,
                last_commit_pushed: source.last_commit_pushed,
                last_commit_name: source.last_commit_name.clone(),
                last_prompt_text: source.last_prompt_text.clone(),
                last_prompt_at: source.last_prompt_at,
                last_tool_name: source.last_tool_name.clone(),
                last_tool_target: source.last_tool_target.clone(),
                last_tool_at: source.last_tool_at,
                // Cleared so the new agent regenerates one on its first
                // prompt.
                task_summary: None,
                created_at: Utc::now(),
            }
        };

        // Provision. No deadline: the pool may legitimately take minutes.
        let machine = self.pool.reserve(new_owner, None).await?;
        target.machine_id = Some(machine.id.clone());

        if resume {
            self.set_state(&mut target, AgentState::Provisioning).await;
        } else {
            self.repos
                .agents
                .insert(target.clone())
                .await
                .map_err(|e| CoreError::ProvisioningFailed(e.to_string()))?;
            self.bus
                .publish(&ControllerEvent::AgentStateChanged {
                    agent_id: target.id.clone(),
                    state: AgentState::Provisioning,
                    error_message: None,
                })
                .ok();
        }
        self.pool
            .activate(&machine.id, &target.id)
            .await
            .map_err(|e| CoreError::ProvisioningFailed(e.to_string()))?;

        match self
            .transfer_onto_machine(source, &mut target, &machine, resume, snapshot_machine, &snapshot)
            .await
        {
            Ok(()) => {
                self.finish_ready(&mut target, &machine).await;
                info!(source = %source.id, target = %target.id, resume, "transfer complete");
                Ok(target.id)
            }
            Err(error) => {
                self.fail_agent(&mut target, &error).await;
                Err(error)
            }
        }
    }

    async fn transfer_onto_machine(
        &self,
        source: &AgentRecord,
        target: &mut AgentRecord,
        machine: &MachineRecord,
        resume: bool,
        snapshot_machine: &ariana_types::MachineId,
        snapshot: &ariana_types::MachineSnapshot,
    ) -> Result<(), CoreError> {
        // The machine is up; the tree is not yet restored.
        self.set_state(target, AgentState::Provisioned).await;

        // Copy DB rows only on the fresh-agent path; resume keeps its own.
        if !resume {
            self.copy_agent_rows(&source.id, &target.id).await?;
        }

        // Restore the snapshot onto the fresh machine.
        let urls = self.snapshots.prepare_restore(snapshot).await?;
        let client = self.worker_client(machine);
        let request = if snapshot.is_chunked() {
            RestoreSnapshotRequest {
                presigned_download_url: None,
                presigned_download_urls: Some(urls),
            }
        } else {
            RestoreSnapshotRequest {
                presigned_download_url: urls.into_iter().next(),
                presigned_download_urls: None,
            }
        };
        let restore = client.post::<_, RestoreSnapshotResponse>(EP_RESTORE_SNAPSHOT, &request);
        match tokio::time::timeout(self.config.restore_deadline, restore).await {
            Ok(Ok(response)) if response.status == "ok" => {}
            Ok(Ok(response)) => {
                return Err(CoreError::SnapshotRestoreFailed(format!(
                    "worker reported {}",
                    response.status
                )))
            }
            Ok(Err(error)) => return Err(CoreError::SnapshotRestoreFailed(error.to_string())),
            Err(_) => {
                return Err(CoreError::SnapshotRestoreFailed(
                    "restore exceeded its deadline".to_string(),
                ))
            }
        }

        // Health-probe the restored worker.
        self.probe_health(&client).await?;

        // Carryover: a blob from another machine makes the target immediately
        // forkable without waiting for its own first snapshot.
        if snapshot_machine != &machine.id {
            self.snapshots
                .create_carried_over_snapshot(&machine.id, &snapshot.r2_key, snapshot.size_bytes)
                .await?;
        }

        // Start the worker against the restored tree. The on-agent-ready
        // automations run later on the normal READY → IDLE path, never here.
        let response = self
            .post_start(target, machine, SetupMode::Existing, true)
            .await?;

        target.start_commit_sha = source.start_commit_sha.clone();
        if response.git_history_last_pushed_commit_sha.is_some() {
            target.git_history_last_pushed_commit_sha =
                response.git_history_last_pushed_commit_sha;
        }
        self.set_state(target, AgentState::Ready).await;
        Ok(())
    }

    /// Poll the worker's health endpoint per the configured budget.
    pub(crate) async fn probe_health(
        &self,
        client: &crate::transport::WorkerClient,
    ) -> Result<(), CoreError> {
        for attempt in 1..=self.config.health_probe_attempts {
            if client.is_healthy().await {
                return Ok(());
            }
            if attempt < self.config.health_probe_attempts {
                tokio::time::sleep(self.config.health_probe_interval).await;
            }
        }
        Err(CoreError::SnapshotRestoreFailed(format!(
            "worker failed {} health probes",
            self.config.health_probe_attempts
        )))
    }

    /// Copy prompts (with fresh ids) and messages (rewritten through the id
    /// mapping) from source to target.
    async fn copy_agent_rows(
        &self,
        source_id: &AgentId,
        target_id: &AgentId,
    ) -> Result<(), CoreError> {
        let prompts = self
            .repos
            .prompts
            .list(source_id)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let mut id_map: HashMap<PromptId, PromptId> = HashMap::new();
        for prompt in prompts {
            let new_id = PromptId(Uuid::new_v4().to_string());
            id_map.insert(prompt.id.clone(), new_id.clone());
            self.repos
                .prompts
                .insert(AgentPrompt {
                    id: new_id,
                    agent_id: target_id.clone(),
                    text: prompt.text,
                    status: prompt.status,
                    created_at: prompt.created_at,
                })
                .await
                .map_err(|e| CoreError::Validation(e.to_string()))?;
        }

        let copied = self
            .repos
            .messages
            .copy_with_mapping(source_id, target_id, &id_map)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        info!(source = %source_id, target = %target_id, prompts = id_map.len(), messages = copied, "rows copied");
        Ok(())
    }
}

async fn wait_for_outcome(
    rx: &mut watch::Receiver<crate::orchestrator::TransferOutcome>,
) -> Result<AgentId, CoreError> {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return outcome.map_err(CoreError::SnapshotRestoreFailed);
        }
        if rx.changed().await.is_err() {
            return Err(CoreError::SnapshotRestoreFailed(
                "in-flight transfer vanished".to_string(),
            ));
        }
    }
}
