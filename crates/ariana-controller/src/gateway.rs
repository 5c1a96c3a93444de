//! Per-port subdomain registration at the TLS gateway.
//!
//! Workers can expose dev servers on arbitrary ports; each exposed port gets
//! a stable subdomain routed through the platform's TLS gateway. The
//! registry is the in-memory index the gateway consults.

use dashmap::DashMap;
use tracing::info;

use ariana_types::AgentId;

/// Registers `agent-<id>-<port>.<zone>` subdomains.
pub struct PortDomainRegistry {
    zone: String,
    routes: DashMap<(AgentId, u16), String>,
}

impl PortDomainRegistry {
    /// Registry for one DNS zone (e.g. `apps.ariana.dev`).
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            routes: DashMap::new(),
        }
    }

    /// Register a subdomain for an agent's port. Idempotent; returns the
    /// hostname.
    pub fn register(&self, agent_id: &AgentId, port: u16, target_ipv4: &str) -> String {
        let host = format!("agent-{}-{}.{}", agent_id, port, self.zone);
        self.routes
            .entry((agent_id.clone(), port))
            .or_insert_with(|| {
                info!(%host, target_ipv4, "registered port subdomain");
                target_ipv4.to_string()
            });
        host
    }

    /// Drop one port registration. Idempotent.
    pub fn unregister(&self, agent_id: &AgentId, port: u16) {
        self.routes.remove(&(agent_id.clone(), port));
    }

    /// Drop every registration of an agent (archive/delete path).
    pub fn unregister_agent(&self, agent_id: &AgentId) {
        self.routes.retain(|(id, _), _| id != agent_id);
    }

    /// Target address of a registered subdomain.
    pub fn resolve(&self, agent_id: &AgentId, port: u16) -> Option<String> {
        self.routes
            .get(&(agent_id.clone(), port))
            .map(|target| target.clone())
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no registration exists.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let registry = PortDomainRegistry::new("apps.ariana.dev");
        let agent = AgentId("a1".into());
        let first = registry.register(&agent, 3000, "10.0.0.5");
        let second = registry.register(&agent, 3000, "10.0.0.6");
        assert_eq!(first, "agent-a1-3000.apps.ariana.dev");
        assert_eq!(first, second);
        // First registration wins.
        assert_eq!(registry.resolve(&agent, 3000).unwrap(), "10.0.0.5");
    }

    #[test]
    fn unregister_agent_drops_all_ports() {
        let registry = PortDomainRegistry::new("apps.ariana.dev");
        let agent = AgentId("a1".into());
        registry.register(&agent, 3000, "10.0.0.5");
        registry.register(&agent, 8080, "10.0.0.5");
        registry.register(&AgentId("a2".into()), 3000, "10.0.0.9");

        registry.unregister_agent(&agent);
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(&agent, 3000).is_none());
    }
}
