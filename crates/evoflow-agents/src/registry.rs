use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::Agent;
use evoflow_core::types::AgentInfo;

/// Registry of available agents, keyed by `agent_type`.
#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own `agent_type`, replacing any previous one.
    pub fn register(&mut self, agent: impl Agent) {
        self.register_arc(Arc::new(agent));
    }

    /// Register a shared agent instance.
    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) {
        let key = agent.agent_type().to_string();
        debug!(agent_type = %key, "Agent registered");
        self.agents.insert(key, agent);
    }

    /// Unregister an agent by type.
    pub fn unregister(&mut self, agent_type: &str) -> bool {
        self.agents.remove(agent_type).is_some()
    }

    /// Get an agent by type.
    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_type).cloned()
    }

    /// Get an agent by type, failing with `UnknownAgentType`.
    pub fn resolve(&self, agent_type: &str) -> Result<Arc<dyn Agent>> {
        self.get(agent_type)
            .ok_or_else(|| EvoflowError::UnknownAgentType(agent_type.to_string()))
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.agents.contains_key(agent_type)
    }

    /// List all registered agent types, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.agents.keys().map(|s| s.as_str()).collect()
    }

    /// Describe every registered agent.
    pub fn describe(&self) -> Vec<AgentInfo> {
        self.agents
            .values()
            .map(|a| AgentInfo {
                agent_type: a.agent_type().to_string(),
                description: a.description().to_string(),
                capabilities: a.capabilities(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Create a registry with all built-in agents registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::EchoAgent);
        registry.register(crate::builtin::MergeAgent);
        registry.register(crate::builtin::DelayAgent);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = AgentRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["delay", "echo", "merge"]);
        assert!(registry.contains("echo"));
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = AgentRegistry::new();
        match registry.resolve("web_search") {
            Err(EvoflowError::UnknownAgentType(t)) => assert_eq!(t, "web_search"),
            _ => panic!("expected UnknownAgentType"),
        }
    }

    #[test]
    fn test_unregister() {
        let mut registry = AgentRegistry::with_builtins();
        assert!(registry.unregister("delay"));
        assert!(!registry.unregister("delay"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_describe() {
        let registry = AgentRegistry::with_builtins();
        let infos = registry.describe();
        let echo = infos.iter().find(|i| i.agent_type == "echo").unwrap();
        assert!(!echo.description.is_empty());
    }
}
