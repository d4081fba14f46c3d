//! Layered authorizer

use std::sync::Arc;

use super::{Access, Authorizer, EnforcementDecision, Resource};

/// Ordered sequence of layers; the first conclusive decision wins and a
/// chain where every layer defers denies.
#[derive(Debug, Clone)]
pub struct ChainedAuthorizer {
    chain: Vec<Arc<dyn Authorizer>>,
}

impl ChainedAuthorizer {
    pub fn new(chain: Vec<Arc<dyn Authorizer>>) -> Self {
        Self { chain }
    }

    fn first_conclusive<F>(&self, decide: F) -> EnforcementDecision
    where
        F: Fn(&dyn Authorizer) -> EnforcementDecision,
    {
        self.chain
            .iter()
            .map(|layer| decide(layer.as_ref()))
            .find(|decision| *decision != EnforcementDecision::Default)
            .unwrap_or(EnforcementDecision::Deny)
    }
}

impl Authorizer for ChainedAuthorizer {
    fn enforce(&self, resource: Resource, segment: &str, access: Access) -> EnforcementDecision {
        self.first_conclusive(|layer| layer.enforce(resource, segment, access))
    }

    fn key_write_prefix(&self, prefix: &str) -> EnforcementDecision {
        self.first_conclusive(|layer| layer.key_write_prefix(prefix))
    }

    fn intention_default_allow(&self) -> EnforcementDecision {
        self.first_conclusive(|layer| layer.intention_default_allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::{allow_all, deny_all, PolicyAuthorizer, PolicyRules};

    fn rules(json: &str) -> Arc<dyn Authorizer> {
        let parsed = PolicyRules::parse(json).unwrap();
        Arc::new(PolicyAuthorizer::compile(&[Arc::new(parsed)]))
    }

    #[test]
    fn test_first_conclusive_layer_wins() {
        let chain = ChainedAuthorizer::new(vec![
            rules(r#"{"service": {"web": {"policy": "deny"}}}"#),
            allow_all(),
        ]);
        assert_eq!(chain.service_read("web"), EnforcementDecision::Deny);
        assert_eq!(chain.service_read("db"), EnforcementDecision::Allow);
    }

    #[test]
    fn test_all_default_denies() {
        let chain = ChainedAuthorizer::new(vec![rules(r#"{"node": {"n1": {"policy": "read"}}}"#)]);
        assert_eq!(chain.node_read("n1"), EnforcementDecision::Allow);
        assert_eq!(chain.node_read("n2"), EnforcementDecision::Deny);
        assert_eq!(chain.intention_default_allow(), EnforcementDecision::Deny);

        let empty = ChainedAuthorizer::new(Vec::new());
        assert_eq!(empty.acl_read(), EnforcementDecision::Deny);
    }

    #[test]
    fn test_default_layer_answers_intention_default() {
        let chain = ChainedAuthorizer::new(vec![
            rules(r#"{"service": {"web": {"policy": "write"}}}"#),
            allow_all(),
        ]);
        assert_eq!(chain.intention_default_allow(), EnforcementDecision::Allow);

        let chain = ChainedAuthorizer::new(vec![deny_all(), allow_all()]);
        assert_eq!(chain.intention_default_allow(), EnforcementDecision::Deny);
    }
}
