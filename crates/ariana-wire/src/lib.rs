#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-wire** – Encrypted controller↔worker wire format.
//!
//! All endpoints above the transport layer exchange bodies sealed with a
//! per-agent symmetric AEAD key. This crate owns the envelope (seal/open) and
//! the request/response DTOs of every worker endpoint so that both processes
//! agree on one vocabulary.

pub mod envelope;
pub mod messages;

pub use envelope::{AgentCipher, Envelope, EnvelopeError, EnvelopeErrorBody};
pub use messages::*;
