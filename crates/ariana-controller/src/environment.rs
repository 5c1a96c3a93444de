//! Environment bundle registry.
//!
//! Bundles (dotenv text, secret files, SSH identity, installed automations)
//! are authored outside the core; the orchestrator only needs to resolve a
//! bundle id into the material a `/start` request carries. This registry is
//! the in-process adapter over that external source.

use dashmap::DashMap;

use ariana_types::{Automation, EnvironmentBundle, EnvironmentId};

/// Resolves environment ids for `/start` requests.
#[derive(Default)]
pub struct EnvironmentRegistry {
    bundles: DashMap<EnvironmentId, EnvironmentBundle>,
    automations: DashMap<EnvironmentId, Vec<Automation>>,
}

impl EnvironmentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a bundle and its automations.
    pub fn upsert(&self, bundle: EnvironmentBundle, automations: Vec<Automation>) {
        self.automations.insert(bundle.id.clone(), automations);
        self.bundles.insert(bundle.id.clone(), bundle);
    }

    /// Look up a bundle.
    pub fn get(&self, id: &EnvironmentId) -> Option<EnvironmentBundle> {
        self.bundles.get(id).map(|b| b.clone())
    }

    /// The automations installed in a bundle.
    pub fn automations(&self, id: &EnvironmentId) -> Vec<Automation> {
        self.automations
            .get(id)
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}
