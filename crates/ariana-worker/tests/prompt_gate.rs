//! Worker pipeline scenarios: blocking automations gating prompt admission,
//! and script actions feeding back into the prompt queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ariana_types::{
    Automation, AutomationId, AutomationTrigger, CoreError, ProjectId, PromptId, PromptStatus,
    ScriptLanguage, UserId,
};
use ariana_wire::{AutomationEvent, SetupMode, StartRequest};
use ariana_worker::{
    AssistantEvent, AssistantQuery, AssistantStream, GitContext, ImageInstaller, ModelUsage,
    Worker, WorkerConfig,
};

/// Assistant that settles every query instantly.
struct InstantAssistant;

#[async_trait]
impl AssistantQuery for InstantAssistant {
    async fn query(
        &self,
        session_id: Option<String>,
        _prompt: String,
        _model: Option<String>,
        _cancel: CancellationToken,
    ) -> Result<AssistantStream, CoreError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx
                .send(AssistantEvent::Result {
                    usage: ModelUsage {
                        model: "test".into(),
                        context_window: Some(100_000),
                        input_tokens: 10,
                        cache_creation_input_tokens: 0,
                        cache_read_input_tokens: 0,
                    },
                })
                .await;
        });
        Ok(AssistantStream {
            session_id: session_id.unwrap_or_else(|| "session-1".into()),
            events: rx,
        })
    }

    async fn interrupt(&self) {}

    async fn oneshot(&self, _prompt: String, _model: String) -> Result<String, CoreError> {
        Ok("update files".into())
    }
}

/// Installer that records nothing.
struct NoopInstaller;

#[async_trait]
impl ImageInstaller for NoopInstaller {
    async fn install(&self, _chunk_urls: Vec<String>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Fixture {
    worker: Arc<Worker>,
    _project: tempfile::TempDir,
    _state: tempfile::TempDir,
    _home: tempfile::TempDir,
}

async fn started_worker(automations: Vec<Automation>) -> Fixture {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();

    let git = GitContext::new(project.path());
    git.run(&["init", "-b", "main"]).await.unwrap();
    git.configure_identity("Seed", "seed@example.com").await.unwrap();
    tokio::fs::write(project.path().join("README.md"), "seed")
        .await
        .unwrap();
    git.commit_all("seed").await.unwrap();

    let worker = Worker::new(
        WorkerConfig {
            project_dir: project.path().to_path_buf(),
            automations_dir: state.path().to_path_buf(),
            home_dir: home.path().to_path_buf(),
            agent_secret: "test-secret".into(),
        },
        Arc::new(InstantAssistant),
        Arc::new(NoopInstaller),
    );

    let response = worker
        .start(StartRequest {
            setup: SetupMode::Local {
                path: project.path().display().to_string(),
            },
            branch_name: "work".into(),
            git_user_name: "Agent".into(),
            git_user_email: "agent@example.com".into(),
            env_contents: None,
            secret_files: vec![],
            ssh_key_pair: None,
            automations,
            dont_send_initial_message: false,
        })
        .await
        .unwrap();
    assert_eq!(response.status, "ok");

    Fixture {
        worker,
        _project: project,
        _state: state,
        _home: home,
    }
}

fn blocking_sleeper(id: &str, seconds: u32) -> Automation {
    Automation::new(
        AutomationId(id.into()),
        UserId("u1".into()),
        ProjectId("p1".into()),
        format!("gate-{id}"),
        AutomationTrigger::OnBeforeCommit,
        ScriptLanguage::Bash,
        format!("sleep {seconds}"),
        true,
        false,
    )
    .unwrap()
}

/// A prompt submitted while a blocking automation runs stays queued until
/// the automation exits, then becomes active and completes.
#[tokio::test]
async fn blocking_automation_defers_prompt_admission() {
    let f = started_worker(vec![blocking_sleeper("gate", 2)]).await;

    let started = f
        .worker
        .execute_automations(&AutomationEvent::BeforeCommit)
        .await;
    assert_eq!(started.len(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(f.worker.engine.has_blocking().await);
    assert!(!f.worker.is_ready().await);

    let prompt_id = PromptId("p1".into());
    f.worker
        .enqueue_prompt(prompt_id.clone(), "do the thing".into(), None)
        .await;

    // Still gated: the prompt must not go active inside the blocking window.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        f.worker.prompt_status(&prompt_id).await,
        Some(PromptStatus::Queued)
    );

    // After the automation exits the pump admits and completes the prompt.
    for _ in 0..100 {
        if f.worker.prompt_status(&prompt_id).await == Some(PromptStatus::Done) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("prompt never completed after the blocking automation exited");
}

/// Prompts flow strictly in order once admitted.
#[tokio::test]
async fn prompts_complete_in_fifo_order() {
    let f = started_worker(vec![]).await;

    for n in 1..=3 {
        f.worker
            .enqueue_prompt(PromptId(format!("p{n}")), format!("prompt {n}"), None)
            .await;
    }

    for n in 1..=3 {
        let id = PromptId(format!("p{n}"));
        let mut done = false;
        for _ in 0..100 {
            if f.worker.prompt_status(&id).await == Some(PromptStatus::Done) {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(done, "prompt {n} never completed");
    }
}

/// A queue_prompt action dropped into the spool becomes a real prompt.
#[tokio::test]
async fn spool_action_queues_prompt() {
    let f = started_worker(vec![]).await;

    let actions_dir = f.worker.config.actions_dir();
    tokio::fs::create_dir_all(&actions_dir).await.unwrap();
    tokio::fs::write(
        actions_dir.join("action.json"),
        r#"{"type":"queue_prompt","automationId":"a1","automationName":"followup","payload":{"promptText":"run the tests"}}"#,
    )
    .await
    .unwrap();

    // The spool polls every 500ms; wait for the file to be consumed and the
    // prompt to complete.
    for _ in 0..100 {
        let consumed = tokio::fs::metadata(actions_dir.join("action.json"))
            .await
            .is_err();
        if consumed {
            let messages = f.worker.wire_messages().await;
            if messages.iter().any(|m| m.content == "run the tests") {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("spool action never became a prompt");
}

/// A stop_agent action surfaces through the worker's stop flag.
#[tokio::test]
async fn spool_stop_action_sets_stop_requested() {
    let f = started_worker(vec![]).await;
    assert!(!f.worker.stop_requested().await);

    let actions_dir = f.worker.config.actions_dir();
    tokio::fs::create_dir_all(&actions_dir).await.unwrap();
    tokio::fs::write(
        actions_dir.join("stop.json"),
        r#"{"type":"stop_agent","automationId":"a1","automationName":"done"}"#,
    )
    .await
    .unwrap();

    for _ in 0..100 {
        if f.worker.stop_requested().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("stop request never observed");
}
