//! Filesystem action spool.
//!
//! User scripts control the agent through helper commands (`stopAgent`,
//! `queuePrompt`) that write JSON files into a spool directory. The worker
//! polls the directory every tick, validates each file, forwards the action
//! to its in-process queue, and deletes the file. Malformed files are deleted
//! with a warning.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Poll interval of the spool directory.
pub const SPOOL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Payload of a `queue_prompt` action file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePromptPayload {
    /// Text to enqueue as a user prompt.
    #[serde(rename = "promptText")]
    pub prompt_text: String,
}

/// One action file as written by the script helpers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolFile {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "automationId")]
    automation_id: String,
    #[serde(rename = "automationName")]
    automation_name: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

/// A validated control action forwarded to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    /// Archive the agent.
    StopAgent {
        /// The automation that requested the stop.
        automation_name: String,
    },
    /// Enqueue a prompt as if the user had submitted it.
    QueuePrompt {
        /// The automation that queued the prompt.
        automation_name: String,
        /// Prompt text.
        prompt_text: String,
    },
}

/// Polls the spool directory and forwards validated actions.
pub struct ActionSpool {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<ControlAction>,
}

impl ActionSpool {
    /// Create a spool over the given directory; actions flow into `tx`.
    pub fn new(dir: PathBuf, tx: mpsc::UnboundedSender<ControlAction>) -> Self {
        Self { dir, tx }
    }

    /// Run the poll loop until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SPOOL_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.drain_once().await;
                }
            }
        }
    }

    /// One poll pass: validate, forward, and delete every file present.
    pub async fn drain_once(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // Directory appears once the first helper runs.
            Err(_) => return 0,
        };

        let mut forwarded = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            match self.parse_action(&path).await {
                Ok(action) => {
                    debug!(?path, "forwarding spool action");
                    if self.tx.send(action).is_ok() {
                        forwarded += 1;
                    }
                }
                Err(error) => {
                    warn!(?path, %error, "deleting malformed spool file");
                }
            }
            let _ = tokio::fs::remove_file(&path).await;
        }
        forwarded
    }

    async fn parse_action(&self, path: &std::path::Path) -> anyhow::Result<ControlAction> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: SpoolFile = serde_json::from_str(&raw)?;
        match file.kind.as_str() {
            "stop_agent" => Ok(ControlAction::StopAgent {
                automation_name: file.automation_name,
            }),
            "queue_prompt" => {
                let payload = file
                    .payload
                    .ok_or_else(|| anyhow::anyhow!("queue_prompt requires a payload"))?;
                let payload: QueuePromptPayload = serde_json::from_value(payload)?;
                Ok(ControlAction::QueuePrompt {
                    automation_name: file.automation_name,
                    prompt_text: payload.prompt_text,
                })
            }
            other => Err(anyhow::anyhow!("unknown action type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn spool_with_file(name: &str, contents: &str) -> (mpsc::UnboundedReceiver<ControlAction>, usize, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join(name), contents).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let spool = ActionSpool::new(dir.path().to_path_buf(), tx);
        let forwarded = spool.drain_once().await;
        (rx, forwarded, dir)
    }

    #[tokio::test]
    async fn queue_prompt_is_forwarded_and_deleted() {
        let (mut rx, forwarded, dir) = spool_with_file(
            "a1.json",
            r#"{"type":"queue_prompt","automationId":"a1","automationName":"lint","payload":{"promptText":"fix lints"}}"#,
        )
        .await;

        assert_eq!(forwarded, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlAction::QueuePrompt {
                automation_name: "lint".into(),
                prompt_text: "fix lints".into(),
            }
        );
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn stop_agent_is_forwarded() {
        let (mut rx, forwarded, _dir) = spool_with_file(
            "a2.json",
            r#"{"type":"stop_agent","automationId":"a2","automationName":"done"}"#,
        )
        .await;

        assert_eq!(forwarded, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlAction::StopAgent {
                automation_name: "done".into(),
            }
        );
    }

    #[tokio::test]
    async fn malformed_file_is_deleted_without_forwarding() {
        let (mut rx, forwarded, dir) = spool_with_file("bad.json", "not json at all").await;
        assert_eq!(forwarded, 0);
        assert!(rx.try_recv().is_err());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn unknown_action_type_is_rejected() {
        let (mut rx, forwarded, _dir) = spool_with_file(
            "odd.json",
            r#"{"type":"reboot_vm","automationId":"x","automationName":"x"}"#,
        )
        .await;
        assert_eq!(forwarded, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spool = ActionSpool::new(PathBuf::from("/nonexistent/spool"), tx);
        assert_eq!(spool.drain_once().await, 0);
    }
}
