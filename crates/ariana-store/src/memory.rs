//! In-memory repository driver.
//!
//! Fast, non-persistent backend suitable for testing and single-process
//! deployments. All data is lost when the process terminates.

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use ariana_types::{
    AgentCommit, AgentId, AgentMessage, AgentPrompt, AgentRecord, MachineId, MachineRecord,
    MachineSnapshot, PromptId, PromptStatus, SnapshotId, UsageRecord, UserId,
};

use crate::{
    occupies_capacity, AgentFilter, AgentRepository, CommitRepository, MachineRepository,
    MessageRepository, PromptRepository, SnapshotRepository, UsageRepository,
};

/// One agent-creation event for sliding-window accounting.
#[derive(Debug, Clone)]
struct CreationEvent {
    user_id: UserId,
    ip: IpAddr,
    at: DateTime<Utc>,
}

/// In-memory implementation of every repository trait.
///
/// Each collection sits behind its own `RwLock`; no method holds two locks at
/// once.
#[derive(Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    prompts: RwLock<Vec<AgentPrompt>>,
    messages: RwLock<Vec<AgentMessage>>,
    commits: RwLock<Vec<AgentCommit>>,
    machines: RwLock<HashMap<MachineId, MachineRecord>>,
    snapshots: RwLock<Vec<MachineSnapshot>>,
    usage: RwLock<HashMap<UserId, UsageRecord>>,
    creations: RwLock<Vec<CreationEvent>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for MemoryStore {
    async fn find_by_id(&self, id: &AgentId) -> Result<Option<AgentRecord>> {
        Ok(self.agents.read().await.get(id).cloned())
    }

    async fn find_many(&self, filter: AgentFilter) -> Result<Vec<AgentRecord>> {
        let agents = self.agents.read().await;
        let mut rows: Vec<AgentRecord> = agents
            .values()
            .filter(|a| filter.user_id.as_ref().map_or(true, |u| &a.user_id == u))
            .filter(|a| filter.state.map_or(true, |s| a.state == s))
            .filter(|a| filter.created_after.map_or(true, |t| a.created_at > t))
            .filter(|a| filter.include_trashed || !a.is_trashed)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn insert(&self, agent: AgentRecord) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.id) {
            return Err(anyhow!("agent {} already exists", agent.id));
        }
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn update(&self, agent: &AgentRecord) -> Result<()> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(&agent.id) {
            Some(row) => {
                *row = agent.clone();
                Ok(())
            }
            None => Err(anyhow!("agent {} not found", agent.id)),
        }
    }

    async fn delete(&self, id: &AgentId) -> Result<()> {
        self.agents.write().await.remove(id);
        Ok(())
    }

    async fn set_auto_restored_now(&self, id: &AgentId) -> Result<()> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(id) {
            Some(row) => {
                row.last_auto_restored_at = Some(Utc::now());
                Ok(())
            }
            None => Err(anyhow!("agent {} not found", id)),
        }
    }
}

#[async_trait]
impl PromptRepository for MemoryStore {
    async fn insert(&self, prompt: AgentPrompt) -> Result<()> {
        self.prompts.write().await.push(prompt);
        Ok(())
    }

    async fn update_status(&self, id: &PromptId, status: PromptStatus) -> Result<()> {
        let mut prompts = self.prompts.write().await;
        match prompts.iter_mut().find(|p| &p.id == id) {
            Some(p) => {
                p.status = status;
                Ok(())
            }
            None => Err(anyhow!("prompt {} not found", id)),
        }
    }

    async fn fail_pending_for_agent(&self, agent_id: &AgentId) -> Result<usize> {
        let mut prompts = self.prompts.write().await;
        let mut failed = 0;
        for p in prompts.iter_mut().filter(|p| &p.agent_id == agent_id) {
            if matches!(p.status, PromptStatus::Queued | PromptStatus::Active) {
                p.status = PromptStatus::Failed;
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn list(&self, agent_id: &AgentId) -> Result<Vec<AgentPrompt>> {
        let prompts = self.prompts.read().await;
        let mut rows: Vec<AgentPrompt> = prompts
            .iter()
            .filter(|p| &p.agent_id == agent_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn bulk_insert(&self, mut batch: Vec<AgentMessage>) -> Result<()> {
        self.messages.write().await.append(&mut batch);
        Ok(())
    }

    async fn upsert_by_api_id(&self, message: AgentMessage) -> Result<()> {
        let mut messages = self.messages.write().await;
        match messages
            .iter_mut()
            .find(|m| m.agent_id == message.agent_id && m.api_message_id == message.api_message_id)
        {
            Some(existing) => {
                existing.content = message.content;
                existing.role = message.role;
            }
            None => messages.push(message),
        }
        Ok(())
    }

    async fn list(&self, agent_id: &AgentId) -> Result<Vec<AgentMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| &m.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn copy_with_mapping(
        &self,
        source: &AgentId,
        target: &AgentId,
        prompt_id_map: &HashMap<PromptId, PromptId>,
    ) -> Result<usize> {
        let copies: Vec<AgentMessage> = {
            let messages = self.messages.read().await;
            messages
                .iter()
                .filter(|m| &m.agent_id == source)
                .map(|m| AgentMessage {
                    id: Uuid::new_v4().to_string(),
                    agent_id: target.clone(),
                    prompt_id: m
                        .prompt_id
                        .as_ref()
                        .and_then(|p| prompt_id_map.get(p).cloned()),
                    ..m.clone()
                })
                .collect()
        };
        let copied = copies.len();
        self.messages.write().await.extend(copies);
        Ok(copied)
    }
}

#[async_trait]
impl CommitRepository for MemoryStore {
    async fn insert(&self, commit: AgentCommit) -> Result<()> {
        self.commits.write().await.push(commit);
        Ok(())
    }

    async fn update(&self, commit: &AgentCommit) -> Result<()> {
        let mut commits = self.commits.write().await;
        match commits
            .iter_mut()
            .find(|c| c.agent_id == commit.agent_id && c.sha == commit.sha)
        {
            Some(row) => {
                *row = commit.clone();
                Ok(())
            }
            None => Err(anyhow!("commit {} not found", commit.sha)),
        }
    }

    async fn list(&self, agent_id: &AgentId) -> Result<Vec<AgentCommit>> {
        let commits = self.commits.read().await;
        let mut rows: Vec<AgentCommit> = commits
            .iter()
            .filter(|c| &c.agent_id == agent_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.timestamp);
        Ok(rows)
    }
}

#[async_trait]
impl MachineRepository for MemoryStore {
    async fn insert(&self, machine: MachineRecord) -> Result<()> {
        let mut machines = self.machines.write().await;
        if machines.contains_key(&machine.id) {
            return Err(anyhow!("machine {} already exists", machine.id));
        }
        machines.insert(machine.id.clone(), machine);
        Ok(())
    }

    async fn find_by_id(&self, id: &MachineId) -> Result<Option<MachineRecord>> {
        Ok(self.machines.read().await.get(id).cloned())
    }

    async fn update(&self, machine: &MachineRecord) -> Result<()> {
        let mut machines = self.machines.write().await;
        match machines.get_mut(&machine.id) {
            Some(row) => {
                *row = machine.clone();
                Ok(())
            }
            None => Err(anyhow!("machine {} not found", machine.id)),
        }
    }

    async fn list_unreleased(&self) -> Result<Vec<MachineRecord>> {
        Ok(self
            .machines
            .read()
            .await
            .values()
            .filter(|m| !matches!(m.status, ariana_types::MachineStatus::Released))
            .cloned()
            .collect())
    }

    async fn active_count(&self) -> Result<usize> {
        Ok(self
            .machines
            .read()
            .await
            .values()
            .filter(|m| occupies_capacity(m.status))
            .count())
    }
}

#[async_trait]
impl SnapshotRepository for MemoryStore {
    async fn insert_captured(&self, snapshot: MachineSnapshot) -> Result<()> {
        self.snapshots.write().await.push(snapshot);
        Ok(())
    }

    async fn insert_carryover(&self, snapshot: MachineSnapshot) -> Result<()> {
        self.snapshots.write().await.push(snapshot);
        Ok(())
    }

    async fn find_latest_for_machine(
        &self,
        machine_id: &MachineId,
    ) -> Result<Option<MachineSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .filter(|s| &s.machine_id == machine_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<MachineSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .filter(|s| s.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn count_rows_for_key(&self, r2_key: &str) -> Result<usize> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .filter(|s| s.r2_key == r2_key)
            .count())
    }

    async fn delete(&self, id: &SnapshotId) -> Result<()> {
        self.snapshots.write().await.retain(|s| &s.id != id);
        Ok(())
    }
}

#[async_trait]
impl UsageRepository for MemoryStore {
    async fn get_or_create(&self, user_id: &UserId) -> Result<UsageRecord> {
        let mut usage = self.usage.write().await;
        Ok(usage
            .entry(user_id.clone())
            .or_insert_with(|| UsageRecord {
                user_id: user_id.clone(),
                projects_total: 0,
                agents_this_month: 0,
                agents_month_reset_at: Utc::now(),
            })
            .clone())
    }

    async fn update(&self, record: &UsageRecord) -> Result<()> {
        self.usage
            .write()
            .await
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn record_creation(
        &self,
        user_id: &UserId,
        ip: IpAddr,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.creations.write().await.push(CreationEvent {
            user_id: user_id.clone(),
            ip,
            at,
        });
        Ok(())
    }

    async fn count_creations_since(
        &self,
        user_id: &UserId,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self
            .creations
            .read()
            .await
            .iter()
            .filter(|e| &e.user_id == user_id && e.at >= since)
            .count() as u64)
    }

    async fn count_ip_creations_since(&self, ip: IpAddr, since: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .creations
            .read()
            .await
            .iter()
            .filter(|e| e.ip == ip && e.at >= since)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariana_types::{AgentState, MachineType, MessageRole, SnapshotSource};

    fn agent(id: &str, user: &str) -> AgentRecord {
        AgentRecord {
            id: AgentId(id.into()),
            user_id: UserId(user.into()),
            project_id: ariana_types::ProjectId("p1".into()),
            machine_id: None,
            last_machine_id: None,
            branch_name: format!("ariana/{id}"),
            base_branch: "main".into(),
            start_commit_sha: None,
            last_commit_sha: None,
            last_commit_url: None,
            state: AgentState::Provisioning,
            environment_id: None,
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
        }
    }

    fn prompt(id: &str, agent: &str, status: PromptStatus) -> AgentPrompt {
        AgentPrompt {
            id: PromptId(id.into()),
            agent_id: AgentId(agent.into()),
            text: "do the thing".into(),
            status,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn agent_insert_rejects_duplicates() {
        let store = MemoryStore::new();
        AgentRepository::insert(&store, agent("a1", "u1")).await.unwrap();
        assert!(AgentRepository::insert(&store, agent("a1", "u1")).await.is_err());
    }

    #[tokio::test]
    async fn fail_pending_marks_queued_and_active() {
        let store = MemoryStore::new();
        PromptRepository::insert(&store, prompt("p1", "a1", PromptStatus::Active)).await.unwrap();
        PromptRepository::insert(&store, prompt("p2", "a1", PromptStatus::Queued)).await.unwrap();
        PromptRepository::insert(&store, prompt("p3", "a1", PromptStatus::Done)).await.unwrap();
        PromptRepository::insert(&store, prompt("p4", "a2", PromptStatus::Queued)).await.unwrap();

        let failed = store.fail_pending_for_agent(&AgentId("a1".into())).await.unwrap();
        assert_eq!(failed, 2);

        let rows = PromptRepository::list(&store, &AgentId("a1".into())).await.unwrap();
        assert!(rows
            .iter()
            .filter(|p| p.id.0 != "p3")
            .all(|p| p.status == PromptStatus::Failed));

        let other = PromptRepository::list(&store, &AgentId("a2".into())).await.unwrap();
        assert_eq!(other[0].status, PromptStatus::Queued);
    }

    #[tokio::test]
    async fn upsert_by_api_id_updates_in_place() {
        let store = MemoryStore::new();
        let msg = AgentMessage {
            id: "m1".into(),
            agent_id: AgentId("a1".into()),
            prompt_id: None,
            api_message_id: "api-1".into(),
            role: MessageRole::Assistant,
            content: "partial".into(),
            created_at: Utc::now(),
        };
        store.upsert_by_api_id(msg.clone()).await.unwrap();
        store
            .upsert_by_api_id(AgentMessage {
                content: "partial plus more".into(),
                ..msg
            })
            .await
            .unwrap();

        let rows = MessageRepository::list(&store, &AgentId("a1".into())).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "partial plus more");
    }

    #[tokio::test]
    async fn copy_with_mapping_rewrites_prompt_ids() {
        let store = MemoryStore::new();
        store
            .bulk_insert(vec![AgentMessage {
                id: "m1".into(),
                agent_id: AgentId("a1".into()),
                prompt_id: Some(PromptId("old".into())),
                api_message_id: "api-1".into(),
                role: MessageRole::User,
                content: "hi".into(),
                created_at: Utc::now(),
            }])
            .await
            .unwrap();

        let mut map = HashMap::new();
        map.insert(PromptId("old".into()), PromptId("new".into()));
        let copied = store
            .copy_with_mapping(&AgentId("a1".into()), &AgentId("a2".into()), &map)
            .await
            .unwrap();
        assert_eq!(copied, 1);

        let rows = MessageRepository::list(&store, &AgentId("a2".into())).await.unwrap();
        assert_eq!(rows[0].prompt_id, Some(PromptId("new".into())));
        assert_eq!(rows[0].api_message_id, "api-1");
    }

    #[tokio::test]
    async fn snapshot_ref_counting_by_key() {
        let store = MemoryStore::new();
        let snap = MachineSnapshot {
            id: SnapshotId("s1".into()),
            machine_id: MachineId("m1".into()),
            r2_key: "snapshots/m1/s1.img".into(),
            size_bytes: 10,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(14),
            source: SnapshotSource::Captured,
        };
        store.insert_captured(snap.clone()).await.unwrap();
        store
            .insert_carryover(MachineSnapshot {
                id: SnapshotId("s2".into()),
                machine_id: MachineId("m2".into()),
                source: SnapshotSource::CarriedOver,
                ..snap
            })
            .await
            .unwrap();

        assert_eq!(store.count_rows_for_key("snapshots/m1/s1.img").await.unwrap(), 2);
        SnapshotRepository::delete(&store, &SnapshotId("s1".into())).await.unwrap();
        assert_eq!(store.count_rows_for_key("snapshots/m1/s1.img").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sliding_window_counts_are_scoped() {
        let store = MemoryStore::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        let now = Utc::now();

        store.record_creation(&UserId("u1".into()), ip, now).await.unwrap();
        store.record_creation(&UserId("u2".into()), ip, now).await.unwrap();
        store.record_creation(&UserId("u1".into()), other, now).await.unwrap();

        let window = now - chrono::Duration::minutes(1);
        assert_eq!(
            store.count_creations_since(&UserId("u1".into()), window).await.unwrap(),
            2
        );
        assert_eq!(store.count_ip_creations_since(ip, window).await.unwrap(), 2);
    }
}
