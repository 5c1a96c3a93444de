//! End-to-end control-plane scenarios against an in-process worker fleet.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use ariana_controller::{
    providers::fakes::{FakeBlobStore, FakeMachineProvider},
    CreateAgentRequest, EnvironmentRegistry, InMemoryBus, MachinePool, Orchestrator,
    OrchestratorConfig, QuotaGuard, QuotaLimits, SnapshotService, WorkerTransport,
};
use ariana_store::{AgentFilter, Repositories};
use ariana_types::{
    AgentId, AgentMessage, AgentState, CoreError, LimitType, MessageRole, ProjectId,
    SnapshotSource, UserId,
};
use ariana_wire::{
    AgentCipher, Envelope, HealthResponse, RestoreSnapshotRequest, SessionStateResponse,
    StartRequest, StartResponse, EP_CLAUDE_STATE, EP_MESSAGES, EP_RESTORE_SNAPSHOT, EP_START,
};

//─────────────────────────────
//  Fake worker fleet
//─────────────────────────────

/// State of one fake worker, keyed by its base URL.
#[derive(Default)]
struct FakeWorkerState {
    started: bool,
    restored: bool,
    restore_urls: Vec<String>,
    start_requests: Vec<StartRequest>,
}

/// In-process transport that simulates every worker in the fleet.
///
/// The fake provider issues machine N with url `http://10.0.0.N:8420` and
/// secret `secret-N`, so the fleet can derive each worker's cipher from its
/// base URL alone.
#[derive(Default)]
struct FakeFleet {
    workers: DashMap<String, FakeWorkerState>,
    /// When set, every `/start` is refused.
    fail_start: std::sync::atomic::AtomicBool,
}

impl FakeFleet {
    fn cipher_for(base_url: &str) -> AgentCipher {
        let n = base_url
            .trim_start_matches("http://10.0.0.")
            .trim_end_matches(":8420");
        AgentCipher::from_secret(&format!("secret-{n}"))
    }

    fn with_worker<R>(&self, base_url: &str, f: impl FnOnce(&mut FakeWorkerState) -> R) -> R {
        let mut entry = self.workers.entry(base_url.to_string()).or_default();
        f(entry.value_mut())
    }
}

#[async_trait]
impl WorkerTransport for FakeFleet {
    async fn post(
        &self,
        base_url: &str,
        endpoint: &str,
        body: Envelope,
    ) -> Result<Envelope, CoreError> {
        let cipher = Self::cipher_for(base_url);
        let reply = match endpoint {
            EP_START => {
                if self.fail_start.load(std::sync::atomic::Ordering::Relaxed) {
                    return Err(CoreError::StartFailed("worker start refused".to_string()));
                }
                let request: StartRequest = cipher
                    .open(&body)
                    .map_err(|e| CoreError::StartFailed(e.to_string()))?;
                self.with_worker(base_url, |w| {
                    w.started = true;
                    w.start_requests.push(request);
                });
                serde_json::to_value(StartResponse {
                    status: "ok".to_string(),
                    git_info_status: "ok".to_string(),
                    start_commit_sha: Some("c0ffee".to_string()),
                    git_history_last_pushed_commit_sha: Some("c0ffee".to_string()),
                    git_info_error: None,
                })
                .unwrap()
            }
            EP_RESTORE_SNAPSHOT => {
                let request: RestoreSnapshotRequest = cipher
                    .open(&body)
                    .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?;
                let urls = request
                    .presigned_download_url
                    .map(|u| vec![u])
                    .or(request.presigned_download_urls)
                    .unwrap_or_default();
                self.with_worker(base_url, |w| {
                    w.restored = true;
                    w.restore_urls = urls;
                });
                serde_json::json!({ "status": "ok" })
            }
            EP_CLAUDE_STATE => serde_json::to_value(SessionStateResponse {
                is_ready: true,
                has_blocking_automation: false,
                blocking_automation_ids: vec![],
                context_usage: None,
                stop_requested: false,
            })
            .unwrap(),
            EP_MESSAGES => serde_json::json!({ "messages": [] }),
            "/git-commit" => serde_json::json!({
                "commit": {
                    "sha": "fee1dead",
                    "message": "update widget page",
                    "timestamp": chrono::Utc::now(),
                    "additions": 12,
                    "deletions": 3,
                }
            }),
            "/git-push" => serde_json::json!({ "pushed_sha": "fee1dead" }),
            // Prompt, interrupt, automations: acknowledge.
            _ => serde_json::json!({ "status": "ok", "started": [] }),
        };
        cipher
            .seal(&reply)
            .map_err(|e| CoreError::StartFailed(e.to_string()))
    }

    async fn get_health(&self, _base_url: &str) -> Result<HealthResponse, CoreError> {
        Ok(HealthResponse {
            status: "healthy".to_string(),
            version: "test".to_string(),
            uptime_seconds: 1,
        })
    }
}

//─────────────────────────────
//  Harness
//─────────────────────────────

struct Harness {
    orchestrator: Arc<Orchestrator>,
    repos: Repositories,
    fleet: Arc<FakeFleet>,
    blobs: Arc<FakeBlobStore>,
}

fn harness(capacity: usize, limits: QuotaLimits) -> Harness {
    let repos = Repositories::in_memory();
    let provider = Arc::new(FakeMachineProvider::new());
    let blobs = Arc::new(FakeBlobStore::new());
    let fleet = Arc::new(FakeFleet::default());

    let pool = Arc::new(MachinePool::new(repos.clone(), provider.clone(), capacity));
    let quota = Arc::new(QuotaGuard::new(repos.usage.clone(), limits));
    let snapshots = Arc::new(SnapshotService::new(
        repos.snapshots.clone(),
        blobs.clone(),
        provider,
    ));

    let config = OrchestratorConfig {
        reserve_timeout: Duration::from_millis(200),
        health_probe_interval: Duration::from_millis(20),
        start_backoff: Duration::from_millis(20),
        ..OrchestratorConfig::default()
    };

    let orchestrator = Orchestrator::new(
        repos.clone(),
        pool,
        quota,
        snapshots,
        fleet.clone(),
        Arc::new(EnvironmentRegistry::new()),
        Arc::new(ariana_controller::PortDomainRegistry::new("apps.test")),
        InMemoryBus::default(),
        config,
    );

    Harness {
        orchestrator,
        repos,
        fleet,
        blobs,
    }
}

fn ip() -> IpAddr {
    "198.51.100.7".parse().unwrap()
}

fn create_request(user: &str) -> CreateAgentRequest {
    CreateAgentRequest {
        project_id: ProjectId("proj-1".into()),
        user_id: UserId(user.into()),
        ip: ip(),
        name: None,
        environment_id: None,
        setup: ariana_wire::SetupMode::GitClonePublic {
            remote_url: "https://github.com/acme/widgets".into(),
        },
        base_branch: "main".into(),
    }
}

async fn create_idle_agent(h: &Harness, user: &str) -> AgentId {
    let id = h.orchestrator.create(create_request(user)).await.unwrap();
    let agent = h.repos.agents.find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(agent.state, AgentState::Idle);
    id
}

//─────────────────────────────
//  Scenarios
//─────────────────────────────

/// S1: fork of an archived agent by its owner resumes the same agent id and
/// preserves the message log.
#[tokio::test]
async fn fork_archived_owner_resumes_same_agent() {
    let h = harness(4, QuotaLimits::default());
    let agent_id = create_idle_agent(&h, "user-u").await;

    h.repos
        .messages
        .bulk_insert(vec![AgentMessage {
            id: "m1".into(),
            agent_id: agent_id.clone(),
            prompt_id: None,
            api_message_id: "api-1".into(),
            role: MessageRole::Assistant,
            content: "first answer".into(),
            created_at: chrono::Utc::now(),
        }])
        .await
        .unwrap();
    let before = h.repos.messages.list(&agent_id).await.unwrap();

    h.orchestrator.archive(&agent_id).await.unwrap();
    let archived = h.repos.agents.find_by_id(&agent_id).await.unwrap().unwrap();
    assert_eq!(archived.state, AgentState::Archived);
    assert!(archived.machine_id.is_none());
    assert!(archived.last_machine_id.is_some());

    let target = h
        .orchestrator
        .fork(&agent_id, &UserId("user-u".into()), false)
        .await
        .unwrap();
    assert_eq!(target, agent_id);

    let resumed = h.repos.agents.find_by_id(&agent_id).await.unwrap().unwrap();
    assert_eq!(resumed.state, AgentState::Idle);
    assert!(resumed.is_ready);
    assert!(resumed.machine_id.is_some());

    let after = h.repos.messages.list(&agent_id).await.unwrap();
    assert_eq!(before, after);
}

/// S2: fork to a different owner creates a new agent without environment
/// inheritance, with copied commit state and a cleared task summary.
#[tokio::test]
async fn fork_to_new_owner_copies_without_environment() {
    let h = harness(4, QuotaLimits::default());
    let source_id = create_idle_agent(&h, "user-u").await;

    {
        let mut source = h.repos.agents.find_by_id(&source_id).await.unwrap().unwrap();
        source.environment_id = Some(ariana_types::EnvironmentId("env-1".into()));
        source.last_commit_sha = Some("abc123".into());
        source.task_summary = Some("building the widget page".into());
        h.repos.agents.update(&source).await.unwrap();
    }
    h.orchestrator.archive(&source_id).await.unwrap();

    let target_id = h
        .orchestrator
        .fork(&source_id, &UserId("user-v".into()), false)
        .await
        .unwrap();
    assert_ne!(target_id, source_id);

    let target = h.repos.agents.find_by_id(&target_id).await.unwrap().unwrap();
    assert_eq!(target.user_id, UserId("user-v".into()));
    assert_eq!(target.environment_id, None);
    assert_eq!(target.last_commit_sha, Some("abc123".into()));
    assert_eq!(target.task_summary, None);
    assert_eq!(target.state, AgentState::Idle);
}

/// S3: a full pool rejects creation with structured counts and no agent row.
#[tokio::test]
async fn pool_exhaustion_rejects_without_side_effects() {
    let h = harness(1, QuotaLimits::default());
    create_idle_agent(&h, "user-u").await;

    let before = h
        .repos
        .agents
        .find_many(AgentFilter::default())
        .await
        .unwrap()
        .len();

    match h.orchestrator.create(create_request("user-w")).await {
        Err(CoreError::PoolExhausted {
            current_machines,
            max_machines,
        }) => {
            assert_eq!(current_machines, 1);
            assert_eq!(max_machines, 1);
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }

    let after = h
        .repos
        .agents
        .find_many(AgentFilter::default())
        .await
        .unwrap()
        .len();
    assert_eq!(before, after);
}

/// S4: the monthly agent limit rejects with full structured detail.
#[tokio::test]
async fn monthly_quota_rejects_with_detail() {
    let limits = QuotaLimits {
        per_minute: 1000,
        per_hour: 1000,
        per_day: 1000,
        per_month: 2,
        per_ip_per_hour: 1000,
    };
    let h = harness(8, limits);

    create_idle_agent(&h, "user-u").await;
    create_idle_agent(&h, "user-u").await;

    match h.orchestrator.create(create_request("user-u")).await {
        Err(CoreError::Quota(detail)) => {
            assert_eq!(detail.limit_type, LimitType::Month);
            assert_eq!(detail.resource_type, "agent");
            assert!(detail.is_monthly_limit);
            assert_eq!(detail.current, 2);
            assert_eq!(detail.max, 2);
        }
        other => panic!("expected Quota, got {other:?}"),
    }
}

/// S6: a forked agent carries a snapshot row pointing at its parent's blob
/// and is immediately forkable in turn.
#[tokio::test]
async fn carryover_makes_fork_target_immediately_forkable() {
    let h = harness(8, QuotaLimits::default());
    let a1 = create_idle_agent(&h, "user-u").await;
    h.orchestrator.archive(&a1).await.unwrap();

    let a1_row = h.repos.agents.find_by_id(&a1).await.unwrap().unwrap();
    let source_machine = a1_row.last_machine_id.clone().unwrap();
    let parent_snapshot = h
        .repos
        .snapshots
        .find_latest_for_machine(&source_machine)
        .await
        .unwrap()
        .unwrap();

    let a2 = h
        .orchestrator
        .fork(&a1, &UserId("user-v".into()), false)
        .await
        .unwrap();

    let a2_row = h.repos.agents.find_by_id(&a2).await.unwrap().unwrap();
    let a2_machine = a2_row.machine_id.clone().unwrap();
    let carryover = h
        .repos
        .snapshots
        .find_latest_for_machine(&a2_machine)
        .await
        .unwrap()
        .expect("carryover row must exist");
    assert_eq!(carryover.source, SnapshotSource::CarriedOver);
    assert_eq!(carryover.r2_key, parent_snapshot.r2_key);
    assert!(h.blobs.contains(&parent_snapshot.r2_key));

    // The immediate second-generation fork finds A2's carryover row.
    let a3 = h
        .orchestrator
        .fork(&a2, &UserId("user-v".into()), true)
        .await
        .unwrap();
    assert_ne!(a3, a2);
}

/// Race guard: two concurrent resumes of the same archived agent produce one
/// resumed agent, not two.
#[tokio::test]
async fn concurrent_resume_is_single_flight() {
    let h = harness(8, QuotaLimits::default());
    let agent_id = create_idle_agent(&h, "user-u").await;
    h.orchestrator.archive(&agent_id).await.unwrap();

    let machines_before = h.repos.machines.active_count().await.unwrap();
    assert_eq!(machines_before, 0);

    let user = UserId("user-u".into());
    let first = {
        let orchestrator = h.orchestrator.clone();
        let id = agent_id.clone();
        let user = user.clone();
        tokio::spawn(async move { orchestrator.fork(&id, &user, false).await })
    };
    let second = {
        let orchestrator = h.orchestrator.clone();
        let id = agent_id.clone();
        let user = user.clone();
        tokio::spawn(async move { orchestrator.fork(&id, &user, false).await })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a, agent_id);
    assert_eq!(b, agent_id);

    // One new machine, not two.
    assert_eq!(h.repos.machines.active_count().await.unwrap(), 1);
}

/// Fork of a source without any snapshot fails with SNAPSHOT_MISSING.
#[tokio::test]
async fn fork_without_snapshot_is_rejected() {
    let h = harness(4, QuotaLimits::default());
    let agent_id = create_idle_agent(&h, "user-u").await;

    // Live agent whose machine never captured a snapshot.
    match h
        .orchestrator
        .fork(&agent_id, &UserId("user-v".into()), true)
        .await
    {
        Err(CoreError::SnapshotMissing { .. }) => {}
        other => panic!("expected SnapshotMissing, got {other:?}"),
    }
}

/// A resume whose /start exhausts its retry budget flips the agent to ERROR
/// and fails its queued prompts so the auto-restore sweep cannot loop.
#[tokio::test]
async fn failed_resume_marks_error_and_fails_prompts() {
    let h = harness(4, QuotaLimits::default());
    let agent_id = create_idle_agent(&h, "user-u").await;
    h.orchestrator.archive(&agent_id).await.unwrap();

    h.repos
        .prompts
        .insert(ariana_types::AgentPrompt {
            id: ariana_types::PromptId("p1".into()),
            agent_id: agent_id.clone(),
            text: "hello".into(),
            status: ariana_types::PromptStatus::Queued,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    h.fleet
        .fail_start
        .store(true, std::sync::atomic::Ordering::Relaxed);

    match h
        .orchestrator
        .fork(&agent_id, &UserId("user-u".into()), false)
        .await
    {
        Err(CoreError::StartFailed(_)) => {}
        other => panic!("expected StartFailed, got {other:?}"),
    }

    let errored = h.repos.agents.find_by_id(&agent_id).await.unwrap().unwrap();
    assert_eq!(errored.state, AgentState::Error);
    assert!(errored.error_message.is_some());

    let prompts = h.repos.prompts.list(&agent_id).await.unwrap();
    assert!(prompts
        .iter()
        .all(|p| p.status == ariana_types::PromptStatus::Failed));
}

/// Commit and push flow through the worker and land in the commit records.
#[tokio::test]
async fn commit_then_push_updates_records() {
    let h = harness(4, QuotaLimits::default());
    let agent_id = create_idle_agent(&h, "user-u").await;
    let user = UserId("user-u".into());

    let commit = h
        .orchestrator
        .commit(&agent_id, &user, Some("update widget page".into()))
        .await
        .unwrap()
        .expect("worker reported a commit");
    assert_eq!(commit.sha, "fee1dead");

    let rows = h.repos.commits.list(&agent_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].pushed);

    let agent = h.repos.agents.find_by_id(&agent_id).await.unwrap().unwrap();
    assert_eq!(agent.last_commit_sha, Some("fee1dead".into()));
    assert!(!agent.last_commit_pushed);

    let pushed = h.orchestrator.push(&agent_id, &user, false).await.unwrap();
    assert_eq!(pushed, "fee1dead");

    let rows = h.repos.commits.list(&agent_id).await.unwrap();
    assert!(rows[0].pushed);
    let agent = h.repos.agents.find_by_id(&agent_id).await.unwrap().unwrap();
    assert!(agent.last_commit_pushed);
    assert_eq!(
        agent.git_history_last_pushed_commit_sha,
        Some("fee1dead".into())
    );
}

/// The poller scrapes every live, settled agent without disturbing state.
#[tokio::test]
async fn poller_scrapes_live_agents() {
    let h = harness(4, QuotaLimits::default());
    let a1 = create_idle_agent(&h, "user-u").await;
    let a2 = create_idle_agent(&h, "user-u").await;
    h.orchestrator.archive(&a2).await.unwrap();

    let poller = ariana_controller::EventPoller::with_interval(
        h.orchestrator.clone(),
        Duration::from_millis(50),
    );
    // Only the live agent is polled; the archived one is skipped.
    assert_eq!(poller.poll_once().await, 1);

    let agent = h.repos.agents.find_by_id(&a1).await.unwrap().unwrap();
    assert_eq!(agent.state, AgentState::Idle);
}

/// The worker's /start on a resume carries setup mode `existing` and the
/// dont-send-initial-message flag.
#[tokio::test]
async fn resume_start_request_uses_existing_setup() {
    let h = harness(4, QuotaLimits::default());
    let agent_id = create_idle_agent(&h, "user-u").await;
    h.orchestrator.archive(&agent_id).await.unwrap();
    h.orchestrator
        .fork(&agent_id, &UserId("user-u".into()), false)
        .await
        .unwrap();

    let resumed = h.repos.agents.find_by_id(&agent_id).await.unwrap().unwrap();
    let machine = h
        .repos
        .machines
        .find_by_id(&resumed.machine_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let base_url = machine.url.unwrap();

    h.fleet.with_worker(&base_url, |w| {
        assert!(w.restored, "snapshot restore must precede start");
        assert!(!w.restore_urls.is_empty());
        let start = w.start_requests.last().expect("start must have been posted");
        assert!(matches!(start.setup, ariana_wire::SetupMode::Existing));
        assert!(start.dont_send_initial_message);
    });
}
