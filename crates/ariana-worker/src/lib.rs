#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-worker** – Per-VM worker runtime for the Ariana platform.
//!
//! One worker process runs per VM, one VM per live agent. The worker hosts
//! the LLM conversation, runs triggered user automations under backpressure
//! and cancellation, prepares the working tree, and exposes the encrypted
//! JSON endpoints the controller polls and commands.
//!
//! ## Architecture
//!
//! ```text
//! Controller ──encrypted HTTP──► WorkerAPI ──► Worker
//!                                              ├── AssistantSession (one in-flight query)
//!                                              ├── AutomationEngine (N concurrent scripts)
//!                                              ├── ActionSpool (script → worker actions)
//!                                              ├── ProjectSetup / GitContext
//!                                              └── conversation-state.json persistence
//! ```
//!
//! The worker is stateless across restarts except for the on-disk project
//! files and the conversation snapshot; after a snapshot restore the
//! controller re-drives `/start` with `dont_send_initial_message=true`.

pub mod api;
pub mod automation;
pub mod git;
pub mod script;
pub mod session;
pub mod setup;
pub mod spool;
pub mod worker;

pub use automation::{trigger_matches, AutomationEngine, OutputRing, OUTPUT_RING_CAPACITY};
pub use git::GitContext;
pub use script::{ScriptVariables, MAX_ENV_TOTAL_BYTES, MAX_ENV_VAR_BYTES};
pub use session::{
    AssistantEvent, AssistantQuery, AssistantSession, AssistantStream, ModelUsage,
    SessionSnapshot,
};
pub use setup::{ProjectSetup, BUNDLE_AUTH_CLONE_TIMEOUT, PUBLIC_CLONE_TIMEOUT};
pub use spool::{ActionSpool, ControlAction};
pub use worker::{HttpImageInstaller, ImageInstaller, Worker, WorkerConfig};
