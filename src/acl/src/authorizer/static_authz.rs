//! Fixed-answer authorizers

use std::sync::Arc;

use super::{Access, Authorizer, EnforcementDecision, PolicyAuthorizer, PolicyRules, Resource};
use super::{AccessLevel, ChainedAuthorizer, SegmentRule};

/// Names that can never be used as a token secret
pub const ROOT_AUTHORIZER_NAMES: [&str; 3] = ["allow", "deny", "manage"];

/// Authorizer that answers every check the same way
///
/// ACL management is governed separately so that `allow` can fail open for
/// the cluster without handing out control over tokens and policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticAuthorizer {
    default_allow: bool,
    allow_manage: bool,
}

impl StaticAuthorizer {
    fn decide(allowed: bool) -> EnforcementDecision {
        if allowed {
            EnforcementDecision::Allow
        } else {
            EnforcementDecision::Deny
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn enforce(&self, resource: Resource, _segment: &str, _access: Access) -> EnforcementDecision {
        match resource {
            Resource::Acl => Self::decide(self.allow_manage),
            _ => Self::decide(self.default_allow),
        }
    }

    fn key_write_prefix(&self, _prefix: &str) -> EnforcementDecision {
        Self::decide(self.default_allow)
    }

    fn intention_default_allow(&self) -> EnforcementDecision {
        Self::decide(self.default_allow)
    }
}

/// Allows everything except ACL management
pub fn allow_all() -> Arc<dyn Authorizer> {
    Arc::new(StaticAuthorizer {
        default_allow: true,
        allow_manage: false,
    })
}

/// Denies everything
pub fn deny_all() -> Arc<dyn Authorizer> {
    Arc::new(StaticAuthorizer {
        default_allow: false,
        allow_manage: false,
    })
}

/// Allows everything, ACL management included
pub fn manage_all() -> Arc<dyn Authorizer> {
    Arc::new(StaticAuthorizer {
        default_allow: true,
        allow_manage: true,
    })
}

/// Map a reserved name to its root authorizer.
pub fn root_authorizer(name: &str) -> Option<Arc<dyn Authorizer>> {
    match name {
        "allow" => Some(allow_all()),
        "deny" => Some(deny_all()),
        "manage" => Some(manage_all()),
        _ => None,
    }
}

/// Authorizer for the agent recovery token: write on the local agent, read
/// on every node, deny otherwise.
pub fn agent_recovery_authorizer(node_name: &str) -> Arc<dyn Authorizer> {
    let mut rules = PolicyRules::default();
    rules.agent.insert(
        node_name.to_string(),
        SegmentRule {
            policy: AccessLevel::Write,
        },
    );
    rules.node_prefix.insert(
        String::new(),
        SegmentRule {
            policy: AccessLevel::Read,
        },
    );

    let compiled: Arc<dyn Authorizer> = Arc::new(PolicyAuthorizer::compile(&[Arc::new(rules)]));
    Arc::new(ChainedAuthorizer::new(vec![compiled, deny_all()]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all_withholds_acl_management() {
        let authz = allow_all();
        assert_eq!(authz.service_write("web"), EnforcementDecision::Allow);
        assert_eq!(authz.key_write_prefix(""), EnforcementDecision::Allow);
        assert_eq!(authz.acl_read(), EnforcementDecision::Deny);
        assert_eq!(authz.acl_write(), EnforcementDecision::Deny);
    }

    #[test]
    fn test_root_names() {
        assert_eq!(
            root_authorizer("manage").unwrap().acl_write(),
            EnforcementDecision::Allow
        );
        assert_eq!(
            root_authorizer("deny").unwrap().node_read("n1"),
            EnforcementDecision::Deny
        );
        assert!(root_authorizer("anonymous").is_none());
        for name in ROOT_AUTHORIZER_NAMES {
            assert!(root_authorizer(name).is_some());
        }
    }

    #[test]
    fn test_agent_recovery_authorizer() {
        let authz = agent_recovery_authorizer("agent-1");
        assert_eq!(authz.agent_write("agent-1"), EnforcementDecision::Allow);
        assert_eq!(authz.agent_write("agent-2"), EnforcementDecision::Deny);
        assert_eq!(authz.node_read("anything"), EnforcementDecision::Allow);
        assert_eq!(authz.node_write("agent-1"), EnforcementDecision::Deny);
        assert_eq!(authz.service_read("web"), EnforcementDecision::Deny);
    }
}
