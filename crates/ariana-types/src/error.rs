//! Platform-wide error taxonomy.
//!
//! Every subsystem maps its private failures onto these kinds before they
//! cross a crate boundary, so the HTTP layer and the event bus only ever see
//! one error vocabulary.

use serde::{Deserialize, Serialize};

/// Which sliding window or counter rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// Per-minute sliding window.
    Minute,
    /// Per-hour sliding window.
    Hour,
    /// Per-day sliding window.
    Day,
    /// Calendar-month counter.
    Month,
    /// Per-IP sliding window.
    Ip,
}

/// Structured detail attached to quota rejections so the caller can explain
/// exactly which limit was hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaDetail {
    /// The window or counter that rejected the request.
    pub limit_type: LimitType,
    /// Usage observed inside the window.
    pub current: u64,
    /// Configured maximum for the window.
    pub max: u64,
    /// The resource being counted (e.g. `"agent"`, `"project"`).
    pub resource_type: String,
    /// True when the monthly counter (not a sliding window) rejected.
    pub is_monthly_limit: bool,
}

/// Canonical error kinds for the orchestration core.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum CoreError {
    /// Bad request shape, unknown trigger, name conflict.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing/invalid user credential or wrong agent ownership.
    #[error("not authorized: {0}")]
    Auth(String),

    /// A per-user or per-IP limit was exceeded.
    #[error("quota exceeded: {} ({:?} limit, {}/{})", .0.resource_type, .0.limit_type, .0.current, .0.max)]
    Quota(QuotaDetail),

    /// No machine available and the reservation queue rejected the request.
    #[error("machine pool exhausted ({current_machines}/{max_machines})")]
    PoolExhausted {
        /// Machines currently reserved or active.
        current_machines: usize,
        /// Pool capacity.
        max_machines: usize,
    },

    /// The machine provider refused or the VM never booted.
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// Fork/resume requested but no snapshot exists for the source.
    #[error("no snapshot found for machine {machine_id}")]
    SnapshotMissing {
        /// The machine whose snapshot index came up empty.
        machine_id: String,
    },

    /// The snapshot was restored but the worker never passed its health probe.
    #[error("snapshot restore failed: {0}")]
    SnapshotRestoreFailed(String),

    /// The worker's `/start` endpoint failed its whole retry budget.
    #[error("worker start failed: {0}")]
    StartFailed(String),

    /// A git operation failed; stderr is attached verbatim.
    #[error("git operation failed: {operation}: {stderr}")]
    GitFailure {
        /// The git subcommand that failed.
        operation: String,
        /// Captured stderr of the failed command.
        stderr: String,
    },

    /// A user automation script exited non-zero. Reported as an event, never
    /// fatal for the agent.
    #[error("automation {automation_id} failed with exit code {exit_code}")]
    AutomationFailure {
        /// The automation whose script failed.
        automation_id: String,
        /// Process exit code.
        exit_code: i32,
    },

    /// The streaming assistant returned an error or timed out.
    #[error("assistant failure: {0}")]
    AssistantFailure(String),

    /// User-initiated interrupt.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// True when the error should flip an agent that has not yet reached
    /// READY into the terminal ERROR state.
    pub fn is_fatal_before_ready(&self) -> bool {
        !matches!(
            self,
            CoreError::AutomationFailure { .. } | CoreError::Cancelled
        )
    }
}

/// Convenience alias used by every crate in the workspace.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_error_carries_structured_detail() {
        let err = CoreError::Quota(QuotaDetail {
            limit_type: LimitType::Month,
            current: 30,
            max: 30,
            resource_type: "agent".to_string(),
            is_monthly_limit: true,
        });

        let json = serde_json::to_value(&err).unwrap();
        let detail = &json["Quota"];
        assert_eq!(detail["limit_type"], "month");
        assert_eq!(detail["current"], 30);
        assert_eq!(detail["is_monthly_limit"], true);
    }

    #[test]
    fn pool_exhausted_displays_counts() {
        let err = CoreError::PoolExhausted {
            current_machines: 1,
            max_machines: 1,
        };
        assert_eq!(err.to_string(), "machine pool exhausted (1/1)");
    }

    #[test]
    fn cancellation_is_not_fatal() {
        assert!(!CoreError::Cancelled.is_fatal_before_ready());
        assert!(CoreError::ProvisioningFailed("boom".into()).is_fatal_before_ready());
    }
}
