#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-controller** – Control plane of the Ariana platform.
//!
//! One controller process per region. Stateful: owns the database (behind the
//! `ariana-store` repositories) and coordinates worker VMs. Serves the
//! user-facing API and runs the control loops.
//!
//! ## Architecture
//!
//! - **Orchestrator**: top-level agent state machine; owns fork/resume
//! - **MachinePool**: bounded reservation of active VMs with a per-user FIFO
//!   retry queue
//! - **QuotaGuard**: sliding-window and monthly admission control
//! - **SnapshotService**: chunked R2-backed image snapshots with carryover
//! - **EventPoller**: scrapes worker state and emits deltas on the bus
//! - **PortDomainRegistry**: per-port subdomains at the TLS gateway
//!
//! Scheduled jobs (snapshot GC, auto-restore sweep, custom-machine health
//! checks, pool reconciliation) run on the instance started with
//! `--instance-index 0` so replicas never duplicate work.

pub mod environment;
pub mod events;
pub mod gateway;
pub mod orchestrator;
pub mod poller;
pub mod pool;
pub mod providers;
pub mod quota;
pub mod routes;
pub mod snapshot;
pub mod transfer;
pub mod transport;

pub use environment::EnvironmentRegistry;
pub use events::{ControllerEvent, EventBus, InMemoryBus};
pub use gateway::PortDomainRegistry;
pub use orchestrator::{CreateAgentRequest, Orchestrator, OrchestratorConfig};
pub use poller::EventPoller;
pub use pool::{MachinePool, MAX_QUEUED_PER_USER};
pub use providers::{BlobStore, MachineProvider, ProvisionedMachine};
pub use quota::{QuotaGuard, QuotaLimits};
pub use snapshot::{SnapshotService, SNAPSHOT_CHUNK_BYTES};
pub use transport::{HttpWorkerTransport, WorkerClient, WorkerTransport};

/// Default capacity of the machine pool.
pub const MAX_ACTIVE_MACHINES: usize = 64;
