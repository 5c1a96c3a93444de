//! User automation definitions.
//!
//! An automation is a user-owned script bound to a trigger. The worker's
//! engine matches observed events against the trigger (including its optional
//! glob / regex / id filter) and synthesizes a runnable script per language.

use serde::{Deserialize, Serialize};

use crate::{AutomationId, ProjectId, UserId, MAX_SCRIPT_CONTENT_LEN};

/// Script language an automation is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    /// Executed under a login shell (`bash -l`).
    Bash,
    /// Executed with `node`.
    JavaScript,
    /// Executed with `python3`.
    Python,
}

/// Trigger condition for an automation.
///
/// `OnBefore*` variants interpose on the operation they name and therefore
/// must be blocking (enforced by [`Automation::new`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationTrigger {
    /// Only runs when the user explicitly requests it.
    Manual,
    /// Fires once when the agent first reaches the ready state.
    OnAgentReady,
    /// Fires before a commit is created.
    OnBeforeCommit,
    /// Fires after a commit is created.
    OnAfterCommit,
    /// Fires after the assistant edits files matching the glob (any file when
    /// no glob is set).
    OnAfterEditFiles {
        /// Optional Unix-style glob over repo-relative paths.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        glob: Option<String>,
    },
    /// Fires after the assistant reads files matching the glob.
    OnAfterReadFiles {
        /// Optional Unix-style glob over repo-relative paths.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        glob: Option<String>,
    },
    /// Fires after the assistant runs a command matching the regex.
    OnAfterRunCommand {
        /// Optional regex matched against the full command line.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex: Option<String>,
    },
    /// Fires before a branch push / PR creation.
    OnBeforePushPr,
    /// Fires after a branch push / PR creation.
    OnAfterPushPr,
    /// Fires after the conversation is reset.
    OnAfterReset,
    /// Fires when the named automation finishes a run.
    OnAutomationFinishes {
        /// The automation whose completion triggers this one.
        automation_id: AutomationId,
    },
}

impl AutomationTrigger {
    /// True for triggers that interpose on the operation they name.
    pub fn is_before_trigger(&self) -> bool {
        matches!(
            self,
            AutomationTrigger::OnBeforeCommit | AutomationTrigger::OnBeforePushPr
        )
    }
}

/// A user-owned script attached to a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    /// Unique automation id.
    pub id: AutomationId,
    /// Owning user.
    pub user_id: UserId,
    /// Project this automation belongs to.
    pub project_id: ProjectId,
    /// Display name, unique per user+project.
    pub name: String,
    /// When the script runs.
    pub trigger: AutomationTrigger,
    /// Language of `script_content`.
    pub script_language: ScriptLanguage,
    /// The script body.
    pub script_content: String,
    /// Whether prompt admission must wait while this automation runs.
    pub blocking: bool,
    /// Whether captured output is fed back into the conversation.
    pub feed_output: bool,
}

impl Automation {
    /// Create a new automation with validation.
    pub fn new(
        id: AutomationId,
        user_id: UserId,
        project_id: ProjectId,
        name: String,
        trigger: AutomationTrigger,
        script_language: ScriptLanguage,
        script_content: String,
        blocking: bool,
        feed_output: bool,
    ) -> Result<Self, String> {
        if name.trim().is_empty() {
            return Err("Automation name cannot be empty".to_string());
        }
        if script_content.len() > MAX_SCRIPT_CONTENT_LEN {
            return Err(format!(
                "Script content too long: {} > {}",
                script_content.len(),
                MAX_SCRIPT_CONTENT_LEN
            ));
        }
        if trigger.is_before_trigger() && !blocking {
            return Err(format!(
                "Trigger {:?} interposes on the operation and requires blocking=true",
                trigger
            ));
        }
        Ok(Self {
            id,
            user_id,
            project_id,
            name,
            trigger,
            script_language,
            script_content,
            blocking,
            feed_output,
        })
    }
}
