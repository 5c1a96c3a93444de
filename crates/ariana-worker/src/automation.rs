//! Automation execution engine.
//!
//! On each observed event the engine matches the installed automations'
//! triggers, synthesizes a script per run, executes it under a login shell in
//! the project directory, captures output into a bounded ring, and tracks
//! lifecycle so the controller can observe and cancel runs.
//!
//! Locking discipline: one mutex per map, never two held at once; readers of
//! derived state take snapshots under the lock and return copies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use glob::Pattern;
use nix::sys::signal::{kill as send_signal, Signal};
use nix::unistd::Pid;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ariana_types::{Automation, AutomationId, AutomationTrigger};
use ariana_wire::{AutomationEvent, AutomationRunEvent, AutomationRunStatus};

use crate::script::{self, ScriptVariables};

/// Captured output lines retained per run; the beginning is dropped on
/// overflow.
pub const OUTPUT_RING_CAPACITY: usize = 1000;

/// Exit code reported for runs stopped by the user.
const KILLED_EXIT_CODE: i32 = 137;

//─────────────────────────────
//  Output ring
//─────────────────────────────

/// Line-buffered capture ring for one run.
#[derive(Debug, Default)]
pub struct OutputRing {
    lines: VecDeque<String>,
    is_start_truncated: bool,
}

impl OutputRing {
    /// Append a line, dropping the oldest once the ring is full.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == OUTPUT_RING_CAPACITY {
            self.lines.pop_front();
            self.is_start_truncated = true;
        }
        self.lines.push_back(line);
    }

    /// The retained output joined with newlines.
    pub fn text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// True once the beginning has been dropped.
    pub fn is_start_truncated(&self) -> bool {
        self.is_start_truncated
    }

    /// Retained line count.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when nothing was captured yet.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

//─────────────────────────────
//  Trigger matching
//─────────────────────────────

/// Match a trigger against an observed event, applying the trigger's glob /
/// regex / id filter when present. An unset filter matches any event of the
/// trigger's type. Invalid patterns never match.
pub fn trigger_matches(trigger: &AutomationTrigger, event: &AutomationEvent) -> bool {
    match (trigger, event) {
        (AutomationTrigger::OnAgentReady, AutomationEvent::AgentReady) => true,
        (AutomationTrigger::OnBeforeCommit, AutomationEvent::BeforeCommit) => true,
        (AutomationTrigger::OnAfterCommit, AutomationEvent::AfterCommit) => true,
        (AutomationTrigger::OnBeforePushPr, AutomationEvent::BeforePushPr) => true,
        (AutomationTrigger::OnAfterPushPr, AutomationEvent::AfterPushPr) => true,
        (AutomationTrigger::OnAfterReset, AutomationEvent::AfterReset) => true,
        (
            AutomationTrigger::OnAfterEditFiles { glob },
            AutomationEvent::AfterEditFiles { file_path },
        )
        | (
            AutomationTrigger::OnAfterReadFiles { glob },
            AutomationEvent::AfterReadFiles { file_path },
        ) => match glob {
            None => true,
            Some(pattern) => match Pattern::new(pattern) {
                Ok(pattern) => pattern.matches(file_path),
                Err(error) => {
                    warn!(%pattern, %error, "invalid trigger glob");
                    false
                }
            },
        },
        (
            AutomationTrigger::OnAfterRunCommand { regex },
            AutomationEvent::AfterRunCommand { command },
        ) => match regex {
            None => true,
            Some(pattern) => match Regex::new(pattern) {
                Ok(regex) => regex.is_match(command),
                Err(error) => {
                    warn!(%pattern, %error, "invalid trigger regex");
                    false
                }
            },
        },
        (
            AutomationTrigger::OnAutomationFinishes { automation_id },
            AutomationEvent::AutomationFinished { automation_id: finished },
        ) => automation_id == finished,
        _ => false,
    }
}

//─────────────────────────────
//  Engine
//─────────────────────────────

struct RunningAutomation {
    automation: Automation,
    pid: u32,
    output: Arc<Mutex<OutputRing>>,
}

struct EventLog {
    next_seq: u64,
    events: Vec<AutomationRunEvent>,
}

/// Executes triggered user scripts with lifecycle tracking.
pub struct AutomationEngine {
    project_dir: PathBuf,
    scripts_dir: PathBuf,
    vars_dir: PathBuf,
    /// Extra environment from the agent's bundle, merged into every run.
    base_env: Mutex<HashMap<String, String>>,
    installed: Mutex<Vec<Automation>>,
    running: Mutex<HashMap<AutomationId, RunningAutomation>>,
    running_blocking: Mutex<HashSet<AutomationId>>,
    /// Pids killed through [`AutomationEngine::kill`]; the reaper skips its
    /// normal close event for them.
    killed_pids: Mutex<HashSet<u32>>,
    last_outputs: Mutex<HashMap<AutomationId, String>>,
    events: Mutex<EventLog>,
}

impl AutomationEngine {
    /// Create an engine rooted at the project directory.
    pub fn new(project_dir: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            project_dir,
            scripts_dir: state_dir.join("scripts"),
            vars_dir: state_dir.join("vars"),
            base_env: Mutex::new(HashMap::new()),
            installed: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            running_blocking: Mutex::new(HashSet::new()),
            killed_pids: Mutex::new(HashSet::new()),
            last_outputs: Mutex::new(HashMap::new()),
            events: Mutex::new(EventLog {
                next_seq: 1,
                events: Vec::new(),
            }),
        }
    }

    /// Merge bundle environment variables into every future run.
    pub async fn set_base_env(&self, env: HashMap<String, String>) {
        *self.base_env.lock().await = env;
    }

    /// Replace the installed automation set.
    pub async fn install(&self, automations: Vec<Automation>) {
        info!(count = automations.len(), "installing automations");
        *self.installed.lock().await = automations;
    }

    /// Run every installed automation whose trigger matches the event.
    /// Returns the ids that started.
    ///
    /// Boxed because `spawn_run`'s reaper task calls back into `dispatch` to
    /// chain finish-triggered automations; without erasing the future type
    /// here the mutually recursive `async fn` pair defeats rustc's auto-trait
    /// (`Send`) cycle detection.
    pub fn dispatch<'a>(
        self: &'a Arc<Self>,
        event: &'a AutomationEvent,
        variables: ScriptVariables,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<AutomationId>> + Send + 'a>> {
        Box::pin(async move {
            let matched: Vec<Automation> = {
                let installed = self.installed.lock().await;
                installed
                    .iter()
                    .filter(|a| trigger_matches(&a.trigger, event))
                    .cloned()
                    .collect()
            };

            let mut started = Vec::new();
            for automation in matched {
                match self.spawn_run(automation.clone(), variables.clone()).await {
                    Ok(()) => started.push(automation.id),
                    Err(error) => {
                        warn!(automation = %automation.id, %error, "failed to start automation");
                    }
                }
            }
            started
        })
    }

    /// Run one automation by id regardless of its trigger (manual path).
    pub async fn run_manual(
        self: &Arc<Self>,
        automation_id: &AutomationId,
        variables: ScriptVariables,
    ) -> Result<()> {
        let automation = {
            let installed = self.installed.lock().await;
            installed
                .iter()
                .find(|a| &a.id == automation_id)
                .cloned()
                .context("automation not installed")?
        };
        self.spawn_run(automation, variables).await
    }

    async fn spawn_run(
        self: &Arc<Self>,
        automation: Automation,
        mut variables: ScriptVariables,
    ) -> Result<()> {
        {
            let running = self.running.lock().await;
            if running.contains_key(&automation.id) {
                anyhow::bail!("automation {} is already running", automation.id);
            }
        }

        if let Some(previous) = self.last_outputs.lock().await.get(&automation.id) {
            variables.set("LAST_SCRIPT_OUTPUT", previous.clone());
        }

        let prepared = script::prepare(
            &automation.id,
            automation.script_language,
            &automation.script_content,
            &variables,
            &self.scripts_dir,
            &self.vars_dir,
        )?;

        let (program, args) = script::interpreter(automation.script_language);
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());

        let base_env = self.base_env.lock().await.clone();
        let mut command = Command::new(program);
        command
            .args(args)
            .arg(&prepared.script_path)
            .current_dir(&self.project_dir)
            .envs(std::env::vars())
            .envs(&base_env)
            .envs(&prepared.env)
            .env("HOME", &home)
            .env("USER", &user)
            .env("LOGNAME", &user)
            .env("SHELL", "/bin/bash")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {program} for {}", automation.id))?;
        let pid = child.id().context("spawned automation has no pid")?;

        debug!(automation = %automation.id, pid, "automation started");

        let output = Arc::new(Mutex::new(OutputRing::default()));

        if let Some(stdout) = child.stdout.take() {
            let ring = output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ring.lock().await.push(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let ring = output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ring.lock().await.push(line);
                }
            });
        }

        self.record_event(
            &automation,
            AutomationRunStatus::Started,
            None,
            String::new(),
            false,
        )
        .await;

        {
            let mut running = self.running.lock().await;
            running.insert(
                automation.id.clone(),
                RunningAutomation {
                    automation: automation.clone(),
                    pid,
                    output: output.clone(),
                },
            );
        }
        if automation.blocking {
            self.running_blocking.lock().await.insert(automation.id.clone());
        }

        // Reaper: wait for exit, emit the close event unless the run was
        // killed (the kill path emits its own), then chain finish triggers.
        let engine = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;

            engine.running.lock().await.remove(&automation.id);
            engine.running_blocking.lock().await.remove(&automation.id);

            let (text, truncated) = {
                let ring = output.lock().await;
                (ring.text(), ring.is_start_truncated())
            };
            engine
                .last_outputs
                .lock()
                .await
                .insert(automation.id.clone(), text.clone());

            let suppressed = engine.killed_pids.lock().await.remove(&pid);
            if !suppressed {
                let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                let status = if exit_code == 0 {
                    AutomationRunStatus::Finished
                } else {
                    AutomationRunStatus::Failed
                };
                engine
                    .record_event(&automation, status, Some(exit_code), text, truncated)
                    .await;

                // Chain automations listening for this one's completion.
                let finished_event = AutomationEvent::AutomationFinished {
                    automation_id: automation.id.clone(),
                };
                let chained = engine
                    .dispatch(&finished_event, ScriptVariables::new())
                    .await;
                if !chained.is_empty() {
                    debug!(
                        finished = %automation.id,
                        chained = chained.len(),
                        "chained automations started"
                    );
                }
            }

            for file in prepared.spilled_files {
                let _ = tokio::fs::remove_file(file).await;
            }
            let _ = tokio::fs::remove_file(prepared.script_path).await;
        });

        Ok(())
    }

    /// SIGTERM the run's root process and emit the cancellation close event.
    ///
    /// The pid enters the suppress set first so the reaper does not emit a
    /// second, spurious failure event.
    pub async fn kill(&self, automation_id: &AutomationId) -> bool {
        let entry = {
            let running = self.running.lock().await;
            running
                .get(automation_id)
                .map(|r| (r.pid, r.automation.clone(), r.output.clone()))
        };
        let Some((pid, automation, output)) = entry else {
            return false;
        };

        self.killed_pids.lock().await.insert(pid);
        if let Err(error) = send_signal(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(%automation_id, pid, %error, "SIGTERM failed");
        }

        let (text, truncated) = {
            let mut ring = output.lock().await;
            ring.push("[Stopped by user]".to_string());
            (ring.text(), ring.is_start_truncated())
        };

        self.running.lock().await.remove(automation_id);
        self.running_blocking.lock().await.remove(automation_id);
        self.record_event(
            &automation,
            AutomationRunStatus::Failed,
            Some(KILLED_EXIT_CODE),
            text,
            truncated,
        )
        .await;
        info!(%automation_id, pid, "automation stopped by user");
        true
    }

    /// Kill every running automation. Invoked on user interrupt.
    pub async fn kill_all(&self) {
        let ids: Vec<AutomationId> = {
            let running = self.running.lock().await;
            running.keys().cloned().collect()
        };
        for id in ids {
            self.kill(&id).await;
        }
    }

    /// True while any blocking automation is running.
    pub async fn has_blocking(&self) -> bool {
        !self.running_blocking.lock().await.is_empty()
    }

    /// Snapshot of the blocking run ids.
    pub async fn blocking_ids(&self) -> Vec<AutomationId> {
        self.running_blocking.lock().await.iter().cloned().collect()
    }

    /// Snapshot of every running automation's output so far.
    pub async fn get_all_running_output(&self) -> HashMap<AutomationId, String> {
        let entries: Vec<(AutomationId, Arc<Mutex<OutputRing>>)> = {
            let running = self.running.lock().await;
            running
                .iter()
                .map(|(id, run)| (id.clone(), run.output.clone()))
                .collect()
        };
        let mut outputs = HashMap::new();
        for (id, ring) in entries {
            outputs.insert(id, ring.lock().await.text());
        }
        outputs
    }

    /// Run events with sequence numbers strictly greater than the cursor.
    pub async fn events_after(&self, after_seq: u64) -> Vec<AutomationRunEvent> {
        let log = self.events.lock().await;
        log.events
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect()
    }

    async fn record_event(
        &self,
        automation: &Automation,
        status: AutomationRunStatus,
        exit_code: Option<i32>,
        output: String,
        is_start_truncated: bool,
    ) {
        let mut log = self.events.lock().await;
        let seq = log.next_seq;
        log.next_seq += 1;
        log.events.push(AutomationRunEvent {
            seq,
            automation_id: automation.id.clone(),
            automation_name: automation.name.clone(),
            status,
            exit_code,
            output,
            is_start_truncated,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariana_types::{ProjectId, ScriptLanguage, UserId};
    use std::time::Duration;
    use tempfile::tempdir;

    fn automation(id: &str, trigger: AutomationTrigger, script: &str, blocking: bool) -> Automation {
        Automation::new(
            AutomationId(id.into()),
            UserId("u1".into()),
            ProjectId("p1".into()),
            format!("auto-{id}"),
            trigger,
            ScriptLanguage::Bash,
            script.into(),
            blocking,
            false,
        )
        .unwrap()
    }

    async fn wait_until_done(engine: &Arc<AutomationEngine>, id: &AutomationId) {
        for _ in 0..100 {
            if !engine.running.lock().await.contains_key(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("automation {id} never finished");
    }

    #[test]
    fn glob_filter_scopes_edit_triggers() {
        let trigger = AutomationTrigger::OnAfterEditFiles {
            glob: Some("src/**/*.rs".into()),
        };
        assert!(trigger_matches(
            &trigger,
            &AutomationEvent::AfterEditFiles {
                file_path: "src/api/mod.rs".into()
            }
        ));
        assert!(!trigger_matches(
            &trigger,
            &AutomationEvent::AfterEditFiles {
                file_path: "docs/readme.md".into()
            }
        ));
        // No filter matches any edit.
        assert!(trigger_matches(
            &AutomationTrigger::OnAfterEditFiles { glob: None },
            &AutomationEvent::AfterEditFiles {
                file_path: "docs/readme.md".into()
            }
        ));
    }

    #[test]
    fn regex_filter_scopes_command_triggers() {
        let trigger = AutomationTrigger::OnAfterRunCommand {
            regex: Some(r"^cargo (test|check)".into()),
        };
        assert!(trigger_matches(
            &trigger,
            &AutomationEvent::AfterRunCommand {
                command: "cargo test --workspace".into()
            }
        ));
        assert!(!trigger_matches(
            &trigger,
            &AutomationEvent::AfterRunCommand {
                command: "npm test".into()
            }
        ));
    }

    #[test]
    fn finish_trigger_requires_matching_id() {
        let trigger = AutomationTrigger::OnAutomationFinishes {
            automation_id: AutomationId("lint".into()),
        };
        assert!(trigger_matches(
            &trigger,
            &AutomationEvent::AutomationFinished {
                automation_id: AutomationId("lint".into())
            }
        ));
        assert!(!trigger_matches(
            &trigger,
            &AutomationEvent::AutomationFinished {
                automation_id: AutomationId("other".into())
            }
        ));
    }

    #[test]
    fn output_ring_drops_the_beginning() {
        let mut ring = OutputRing::default();
        for i in 0..2000 {
            ring.push(format!("line-{i}"));
        }
        assert_eq!(ring.len(), OUTPUT_RING_CAPACITY);
        assert!(ring.is_start_truncated());
        let text = ring.text();
        assert!(text.starts_with("line-1000"));
        assert!(text.ends_with("line-1999"));
    }

    #[tokio::test]
    async fn dispatch_runs_matching_script_and_records_events() {
        let project = tempdir().unwrap();
        let state = tempdir().unwrap();
        let engine = Arc::new(AutomationEngine::new(
            project.path().to_path_buf(),
            state.path().to_path_buf(),
        ));
        engine
            .install(vec![automation(
                "echo",
                AutomationTrigger::OnAfterCommit,
                "echo \"sha=$CURRENT_COMMIT_SHA\"",
                false,
            )])
            .await;

        let mut vars = ScriptVariables::new();
        vars.set("CURRENT_COMMIT_SHA", "abc123");
        let started = engine.dispatch(&AutomationEvent::AfterCommit, vars).await;
        assert_eq!(started.len(), 1);

        wait_until_done(&engine, &AutomationId("echo".into())).await;
        // Reaper emits the close event after removing the run.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = engine.events_after(0).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, AutomationRunStatus::Started);
        assert_eq!(events[1].status, AutomationRunStatus::Finished);
        assert!(events[1].output.contains("sha=abc123"));
    }

    #[tokio::test]
    async fn oversized_variable_is_visible_to_the_script() {
        let project = tempdir().unwrap();
        let state = tempdir().unwrap();
        let engine = Arc::new(AutomationEngine::new(
            project.path().to_path_buf(),
            state.path().to_path_buf(),
        ));
        engine
            .install(vec![automation(
                "measure",
                AutomationTrigger::OnAfterCommit,
                "echo \"len=${#ENTIRE_AGENT_DIFF}\"",
                false,
            )])
            .await;

        // 20 KiB exceeds the per-variable threshold; the value is file-backed
        // yet still visible as a shell variable.
        let mut vars = ScriptVariables::new();
        vars.set("ENTIRE_AGENT_DIFF", "d".repeat(20 * 1024));
        engine.dispatch(&AutomationEvent::AfterCommit, vars).await;

        for _ in 0..100 {
            let events = engine.events_after(0).await;
            if let Some(done) = events
                .iter()
                .find(|e| e.status == AutomationRunStatus::Finished)
            {
                assert!(done.output.contains(&format!("len={}", 20 * 1024)));
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("automation never finished");
    }

    #[tokio::test]
    async fn blocking_set_tracks_running_blocking_automations() {
        let project = tempdir().unwrap();
        let state = tempdir().unwrap();
        let engine = Arc::new(AutomationEngine::new(
            project.path().to_path_buf(),
            state.path().to_path_buf(),
        ));
        engine
            .install(vec![automation(
                "gate",
                AutomationTrigger::OnBeforeCommit,
                "sleep 2",
                true,
            )])
            .await;

        let started = engine
            .dispatch(&AutomationEvent::BeforeCommit, ScriptVariables::new())
            .await;
        assert_eq!(started.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(engine.has_blocking().await);
        assert_eq!(engine.blocking_ids().await, vec![AutomationId("gate".into())]);

        wait_until_done(&engine, &AutomationId("gate".into())).await;
        assert!(!engine.has_blocking().await);
    }

    #[tokio::test]
    async fn kill_emits_single_cancellation_event() {
        let project = tempdir().unwrap();
        let state = tempdir().unwrap();
        let engine = Arc::new(AutomationEngine::new(
            project.path().to_path_buf(),
            state.path().to_path_buf(),
        ));
        engine
            .install(vec![automation(
                "sleeper",
                AutomationTrigger::OnAfterCommit,
                "echo begun; sleep 60",
                false,
            )])
            .await;

        engine
            .dispatch(&AutomationEvent::AfterCommit, ScriptVariables::new())
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(engine.kill(&AutomationId("sleeper".into())).await);
        // Give the reaper time to observe the exit and (correctly) stay
        // silent.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let events = engine.events_after(0).await;
        let closes: Vec<_> = events
            .iter()
            .filter(|e| e.status != AutomationRunStatus::Started)
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].exit_code, Some(KILLED_EXIT_CODE));
        assert!(closes[0].output.ends_with("[Stopped by user]"));
    }

    #[tokio::test]
    async fn finish_chains_dependent_automation() {
        let project = tempdir().unwrap();
        let state = tempdir().unwrap();
        let engine = Arc::new(AutomationEngine::new(
            project.path().to_path_buf(),
            state.path().to_path_buf(),
        ));
        engine
            .install(vec![
                automation("first", AutomationTrigger::OnAfterCommit, "echo first", false),
                automation(
                    "second",
                    AutomationTrigger::OnAutomationFinishes {
                        automation_id: AutomationId("first".into()),
                    },
                    "echo second",
                    false,
                ),
            ])
            .await;

        engine
            .dispatch(&AutomationEvent::AfterCommit, ScriptVariables::new())
            .await;

        for _ in 0..100 {
            let events = engine.events_after(0).await;
            let finished = events
                .iter()
                .filter(|e| e.status == AutomationRunStatus::Finished)
                .count();
            if finished == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("chained automation never ran");
    }
}
