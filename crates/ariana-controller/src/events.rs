//! Controller event bus.
//!
//! Typed broadcast of everything the control loops observe: state changes,
//! prompt/commit updates, automation runs, transfer failures. Subscribers
//! that fall behind miss events; the database remains the source of truth.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use ariana_types::{AgentId, AgentState, MachineId, PromptId, PromptStatus, SnapshotId};
use ariana_wire::AutomationRunEvent;

/// Default ring capacity of the in-memory bus.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Events published by the controller's loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ControllerEvent {
    /// An agent moved to a new lifecycle state.
    AgentStateChanged {
        /// The agent.
        agent_id: AgentId,
        /// New state.
        state: AgentState,
        /// Failure detail when the new state is `Error`.
        error_message: Option<String>,
    },
    /// A prompt changed status.
    PromptUpdated {
        /// The agent owning the prompt.
        agent_id: AgentId,
        /// The prompt.
        prompt_id: PromptId,
        /// New status.
        status: PromptStatus,
    },
    /// New or updated conversation messages were scraped from a worker.
    MessagesUpdated {
        /// The agent.
        agent_id: AgentId,
        /// Messages currently visible.
        count: usize,
    },
    /// An automation run event arrived from a worker.
    AutomationRun {
        /// The agent whose worker ran it.
        agent_id: AgentId,
        /// The run event verbatim.
        event: AutomationRunEvent,
    },
    /// A snapshot row was written.
    SnapshotRecorded {
        /// Machine the row belongs to.
        machine_id: MachineId,
        /// The row.
        snapshot_id: SnapshotId,
    },
    /// A worker stopped answering its health probe.
    WorkerUnreachable {
        /// The agent whose worker went dark.
        agent_id: AgentId,
    },
    /// A fork/resume attempt failed.
    TransferFailed {
        /// The target agent.
        agent_id: AgentId,
        /// Failure detail.
        error: String,
    },
    /// A user script asked for the agent to be stopped.
    StopRequested {
        /// The agent.
        agent_id: AgentId,
    },
}

/// Publish/subscribe surface of the controller bus.
pub trait EventBus: Send + Sync {
    /// Publish an event to all subscribers. Never blocks.
    fn publish(&self, event: &ControllerEvent) -> Result<()>;
    /// Subscribe to events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent>;
}

/// In-memory broadcast bus.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<ControllerEvent>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl InMemoryBus {
    /// Bus with the given ring capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: &ControllerEvent) -> Result<()> {
        // Send errors only mean nobody is listening right now.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InMemoryBus::default();
        let mut rx = bus.subscribe();
        bus.publish(&ControllerEvent::AgentStateChanged {
            agent_id: AgentId("a1".into()),
            state: AgentState::Ready,
            error_message: None,
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            ControllerEvent::AgentStateChanged { agent_id, state, .. } => {
                assert_eq!(agent_id, AgentId("a1".into()));
                assert_eq!(state, AgentState::Ready);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = InMemoryBus::default();
        assert!(bus
            .publish(&ControllerEvent::WorkerUnreachable {
                agent_id: AgentId("a1".into()),
            })
            .is_ok());
    }
}
