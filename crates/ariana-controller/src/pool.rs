//! Bounded machine reservation pool.
//!
//! The pool is the sole mutator of machine rows. `try_reserve` fast-fails
//! with `PoolExhausted`; the separate reservation queue holds waiters
//! (bounded per user to avoid starvation) and is drained on every release.
//! A reconciler releases machines whose owning agent no longer needs one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use ariana_store::{AgentFilter, Repositories};
use ariana_types::{AgentId, CoreError, MachineId, MachineRecord, MachineStatus, UserId};

use crate::providers::MachineProvider;

/// Pending reservation requests a single user may hold in the queue.
pub const MAX_QUEUED_PER_USER: usize = 3;

struct QueuedReservation {
    user_id: UserId,
    reply: oneshot::Sender<Result<MachineRecord, CoreError>>,
}

struct QueueState {
    waiters: VecDeque<QueuedReservation>,
    per_user: HashMap<UserId, usize>,
}

/// Bounded reservation of active VMs.
pub struct MachinePool {
    repos: Repositories,
    provider: Arc<dyn MachineProvider>,
    capacity: usize,
    /// Serializes the capacity check against the insert.
    admission: Mutex<()>,
    queue: Mutex<QueueState>,
}

impl MachinePool {
    /// Pool with capacity `max_active_machines`.
    pub fn new(
        repos: Repositories,
        provider: Arc<dyn MachineProvider>,
        max_active_machines: usize,
    ) -> Self {
        Self {
            repos,
            provider,
            capacity: max_active_machines,
            admission: Mutex::new(()),
            queue: Mutex::new(QueueState {
                waiters: VecDeque::new(),
                per_user: HashMap::new(),
            }),
        }
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Machines currently counting against capacity.
    pub async fn active_count(&self) -> Result<usize> {
        self.repos.machines.active_count().await
    }

    /// Reserve immediately or fail with `PoolExhausted`. Never waits.
    pub async fn try_reserve(&self, user_id: &UserId) -> Result<MachineRecord, CoreError> {
        let _admission = self.admission.lock().await;
        let current = self
            .repos
            .machines
            .active_count()
            .await
            .map_err(|e| CoreError::ProvisioningFailed(e.to_string()))?;
        if current >= self.capacity {
            debug!(%user_id, current, capacity = self.capacity, "pool exhausted");
            return Err(CoreError::PoolExhausted {
                current_machines: current,
                max_machines: self.capacity,
            });
        }

        let provisioned = self.provider.create_machine().await?;
        let record = MachineRecord {
            id: provisioned.id,
            ipv4: provisioned.ipv4,
            url: Some(provisioned.url),
            owner_agent_id: None,
            status: MachineStatus::Reserved,
            agent_secret: provisioned.agent_secret,
        };
        self.repos
            .machines
            .insert(record.clone())
            .await
            .map_err(|e| CoreError::ProvisioningFailed(e.to_string()))?;
        info!(machine = %record.id, %user_id, "machine reserved");
        Ok(record)
    }

    /// Reserve, waiting in the FIFO queue when the pool is full.
    ///
    /// `wait` bounds the time in the queue; `None` waits indefinitely (the
    /// fork path, where the pool may legitimately take minutes). A full
    /// per-user queue rejects immediately with `PoolExhausted`.
    pub async fn reserve(
        &self,
        user_id: &UserId,
        wait: Option<Duration>,
    ) -> Result<MachineRecord, CoreError> {
        match self.try_reserve(user_id).await {
            Ok(machine) => return Ok(machine),
            Err(CoreError::PoolExhausted { .. }) => {}
            Err(other) => return Err(other),
        }

        let rx = {
            let mut queue = self.queue.lock().await;
            let queued = queue.per_user.get(user_id).copied().unwrap_or(0);
            if queued >= MAX_QUEUED_PER_USER {
                let current = self.active_count().await.unwrap_or(self.capacity);
                return Err(CoreError::PoolExhausted {
                    current_machines: current,
                    max_machines: self.capacity,
                });
            }
            let (tx, rx) = oneshot::channel();
            queue.waiters.push_back(QueuedReservation {
                user_id: user_id.clone(),
                reply: tx,
            });
            *queue.per_user.entry(user_id.clone()).or_insert(0) += 1;
            rx
        };

        let outcome = match wait {
            Some(wait) => match tokio::time::timeout(wait, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.abandon_waiter(user_id).await;
                    let current = self.active_count().await.unwrap_or(self.capacity);
                    return Err(CoreError::PoolExhausted {
                        current_machines: current,
                        max_machines: self.capacity,
                    });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(CoreError::ProvisioningFailed(
                "reservation queue dropped the request".to_string(),
            )),
        }
    }

    async fn abandon_waiter(&self, user_id: &UserId) {
        let mut queue = self.queue.lock().await;
        if let Some(count) = queue.per_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
        }
        // The oneshot receiver is gone; the drain pass skips closed senders.
    }

    /// Attach a reserved machine to its owning agent.
    pub async fn activate(&self, machine_id: &MachineId, owner: &AgentId) -> Result<()> {
        if let Some(mut machine) = self.repos.machines.find_by_id(machine_id).await? {
            machine.status = MachineStatus::Active;
            machine.owner_agent_id = Some(owner.clone());
            self.repos.machines.update(&machine).await?;
        }
        Ok(())
    }

    /// Release a machine and start destroying its VM. Idempotent; drains the
    /// reservation queue once accounting updates.
    pub async fn release(&self, machine_id: &MachineId) -> Result<()> {
        let Some(mut machine) = self.repos.machines.find_by_id(machine_id).await? else {
            return Ok(());
        };
        if matches!(machine.status, MachineStatus::Releasing | MachineStatus::Released) {
            return Ok(());
        }

        machine.status = MachineStatus::Releasing;
        machine.owner_agent_id = None;
        self.repos.machines.update(&machine).await?;

        if let Err(error) = self.provider.destroy_machine(machine_id).await {
            warn!(%machine_id, %error, "machine destruction failed; marking released anyway");
        }

        machine.status = MachineStatus::Released;
        self.repos.machines.update(&machine).await?;
        info!(%machine_id, "machine released");

        self.drain_queue().await;
        Ok(())
    }

    /// Hand freed capacity to the longest-waiting queued reservation.
    async fn drain_queue(&self) {
        loop {
            let waiter = {
                let mut queue = self.queue.lock().await;
                let Some(waiter) = queue.waiters.pop_front() else {
                    return;
                };
                if let Some(count) = queue.per_user.get_mut(&waiter.user_id) {
                    *count = count.saturating_sub(1);
                }
                waiter
            };

            if waiter.reply.is_closed() {
                // Abandoned by timeout; try the next waiter.
                continue;
            }

            let result = self.try_reserve(&waiter.user_id).await;
            let exhausted = matches!(result, Err(CoreError::PoolExhausted { .. }));
            if waiter.reply.send(result).is_err() {
                // Receiver vanished between the check and the send; the
                // reserved machine (if any) will be caught by the reconciler.
                warn!("queued reservation abandoned after fulfilment");
            }
            if exhausted {
                return;
            }
            // One release frees one slot; stop after one successful handoff.
            return;
        }
    }

    /// Enforce the pool invariant: no more live agents with machines than
    /// active machines, and no active machine owned by a finished agent.
    pub async fn reconcile(&self) -> Result<usize> {
        let machines = self.repos.machines.list_unreleased().await?;
        let mut released = 0;
        for machine in machines {
            let Some(owner) = &machine.owner_agent_id else {
                continue;
            };
            let agent = self.repos.agents.find_by_id(owner).await?;
            let needs_machine = agent
                .as_ref()
                .map(|a| a.state.is_live() && a.machine_id.as_ref() == Some(&machine.id))
                .unwrap_or(false);
            if !needs_machine {
                warn!(machine = %machine.id, agent = %owner, "reconciler releasing leaked machine");
                self.release(&machine.id).await?;
                released += 1;
            }
        }

        let live = self
            .repos
            .agents
            .find_many(AgentFilter::default())
            .await?
            .into_iter()
            .filter(|a| a.state.is_live() && a.machine_id.is_some())
            .count();
        let active = self.active_count().await?;
        if live > active {
            warn!(live, active, "live agents exceed active machines");
        }
        Ok(released)
    }
}
