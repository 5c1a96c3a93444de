//! Worker state poller.
//!
//! Scrapes every live agent's worker on a timer: prompt-admission state,
//! conversation messages, and automation run events. Observations are
//! diffed against the last scrape and emitted as deltas on the controller
//! bus; the message log is mirrored into the store with dedup-in-place.
//! Unreachable workers are reported, never fatal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use ariana_store::AgentFilter;
use ariana_types::{AgentId, AgentMessage, AgentState};
use ariana_wire::{
    AutomationEventsRequest, AutomationEventsResponse, MessagesResponse, SessionStateResponse,
    EP_AUTOMATION_EVENTS, EP_CLAUDE_STATE, EP_MESSAGES,
};

use crate::events::{ControllerEvent, EventBus};
use crate::orchestrator::Orchestrator;

/// Default scrape interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default, Clone)]
struct AgentCursor {
    automation_seq: u64,
    was_ready: bool,
    message_count: usize,
}

/// Periodic scraper of worker state.
pub struct EventPoller {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    cursors: Mutex<HashMap<AgentId, AgentCursor>>,
}

impl EventPoller {
    /// Poller over the orchestrator's agents at the default interval.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self::with_interval(orchestrator, POLL_INTERVAL)
    }

    /// Poller with an explicit interval (tests shrink it).
    pub fn with_interval(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// One scrape pass over every live agent.
    pub async fn poll_once(&self) -> usize {
        let agents = match self
            .orchestrator
            .repos
            .agents
            .find_many(AgentFilter::default())
            .await
        {
            Ok(agents) => agents,
            Err(error) => {
                warn!(%error, "poller could not list agents");
                return 0;
            }
        };

        let mut polled = 0;
        for agent in agents
            .into_iter()
            .filter(|a| a.state.is_live() && !a.state.is_transitional())
        {
            self.poll_agent(&agent.id).await;
            polled += 1;
        }
        polled
    }

    async fn poll_agent(&self, agent_id: &AgentId) {
        let Ok(agent) = self.orchestrator.must_find(agent_id).await else {
            return;
        };
        let Ok(machine) = self.orchestrator.machine_of(&agent).await else {
            return;
        };
        let client = self.orchestrator.worker_client(&machine);

        let state: SessionStateResponse = match client
            .post(EP_CLAUDE_STATE, &serde_json::json!({}))
            .await
        {
            Ok(state) => state,
            Err(error) => {
                debug!(agent = %agent_id, %error, "worker scrape failed");
                self.orchestrator
                    .bus
                    .publish(&ControllerEvent::WorkerUnreachable {
                        agent_id: agent_id.clone(),
                    })
                    .ok();
                return;
            }
        };

        let mut cursor = {
            let cursors = self.cursors.lock().await;
            cursors.get(agent_id).cloned().unwrap_or_default()
        };

        // Running ⇄ Idle follows the worker's admission state.
        if state.is_ready != cursor.was_ready {
            let mut agent = agent.clone();
            if state.is_ready && agent.state == AgentState::Running {
                self.orchestrator.set_state(&mut agent, AgentState::Idle).await;
            } else if !state.is_ready && agent.state == AgentState::Idle {
                self.orchestrator
                    .set_state(&mut agent, AgentState::Running)
                    .await;
            }
            cursor.was_ready = state.is_ready;
        }

        if state.stop_requested {
            self.orchestrator
                .bus
                .publish(&ControllerEvent::StopRequested {
                    agent_id: agent_id.clone(),
                })
                .ok();
            if let Err(error) = self.orchestrator.archive(agent_id).await {
                warn!(agent = %agent_id, %error, "stop-requested archive failed");
            }
        }

        // Mirror the conversation with dedup-in-place on the api message id.
        if let Ok(messages) = client
            .post::<_, MessagesResponse>(EP_MESSAGES, &serde_json::json!({}))
            .await
        {
            let count = messages.messages.len();
            if count != cursor.message_count {
                for message in messages.messages.into_iter().filter(|m| !m.is_streaming) {
                    let row = AgentMessage {
                        id: Uuid::new_v4().to_string(),
                        agent_id: agent_id.clone(),
                        prompt_id: None,
                        api_message_id: message.api_message_id,
                        role: message.role,
                        content: message.content,
                        created_at: message.created_at,
                    };
                    if let Err(error) =
                        self.orchestrator.repos.messages.upsert_by_api_id(row).await
                    {
                        warn!(agent = %agent_id, %error, "message mirror failed");
                        break;
                    }
                }
                cursor.message_count = count;
                self.orchestrator
                    .bus
                    .publish(&ControllerEvent::MessagesUpdated {
                        agent_id: agent_id.clone(),
                        count,
                    })
                    .ok();
            }
        }

        // Forward new automation run events.
        if let Ok(events) = client
            .post::<_, AutomationEventsResponse>(
                EP_AUTOMATION_EVENTS,
                &AutomationEventsRequest {
                    after_seq: cursor.automation_seq,
                },
            )
            .await
        {
            for event in events.events {
                cursor.automation_seq = cursor.automation_seq.max(event.seq);
                self.orchestrator
                    .bus
                    .publish(&ControllerEvent::AutomationRun {
                        agent_id: agent_id.clone(),
                        event,
                    })
                    .ok();
            }
        }

        let mut cursors = self.cursors.lock().await;
        cursors.insert(agent_id.clone(), cursor);
    }
}
