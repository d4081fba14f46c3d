//! Authorizer compiled from merged policy rules

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use super::rules::{AccessLevel, PolicyRules, SegmentRule, ServiceRule};
use super::{Access, Authorizer, EnforcementDecision, Resource};

/// Exact and prefix rules of one resource family
#[derive(Debug, Clone, Default)]
struct RuleTree {
    exact: HashMap<String, AccessLevel>,
    prefix: BTreeMap<String, AccessLevel>,
}

impl RuleTree {
    fn from_segments(
        exact: &BTreeMap<String, SegmentRule>,
        prefix: &BTreeMap<String, SegmentRule>,
    ) -> Self {
        Self {
            exact: exact.iter().map(|(k, r)| (k.clone(), r.policy)).collect(),
            prefix: prefix.iter().map(|(k, r)| (k.clone(), r.policy)).collect(),
        }
    }

    fn from_services<F>(
        exact: &BTreeMap<String, ServiceRule>,
        prefix: &BTreeMap<String, ServiceRule>,
        pick: F,
    ) -> Self
    where
        F: Fn(&ServiceRule) -> Option<AccessLevel>,
    {
        Self {
            exact: exact.iter().filter_map(|(k, r)| pick(r).map(|a| (k.clone(), a))).collect(),
            prefix: prefix.iter().filter_map(|(k, r)| pick(r).map(|a| (k.clone(), a))).collect(),
        }
    }

    /// Longest prefix rule that applies to `segment`.
    fn longest_prefix(&self, segment: &str) -> Option<AccessLevel> {
        // prefixes of `segment` sort at or before it, longer ones later
        self.prefix
            .range::<str, _>((Bound::Unbounded, Bound::Included(segment)))
            .rev()
            .find(|(prefix, _)| segment.starts_with(prefix.as_str()))
            .map(|(_, access)| *access)
    }

    /// Exact match first, then the longest matching prefix.
    fn lookup(&self, segment: &str) -> Option<AccessLevel> {
        self.exact
            .get(segment)
            .copied()
            .or_else(|| self.longest_prefix(segment))
    }

    fn rules(&self) -> impl Iterator<Item = AccessLevel> + '_ {
        self.exact.values().chain(self.prefix.values()).copied()
    }

    fn any_allowed(&self, required: Access) -> EnforcementDecision {
        let base = self
            .prefix
            .get("")
            .map(|rule| enforce(*rule, required))
            .unwrap_or(EnforcementDecision::Default);

        if self.rules().any(|rule| enforce(rule, required) == EnforcementDecision::Allow) {
            EnforcementDecision::Allow
        } else {
            base
        }
    }

    fn all_allowed(&self, required: Access) -> EnforcementDecision {
        let base = self
            .prefix
            .get("")
            .map(|rule| enforce(*rule, required))
            .unwrap_or(EnforcementDecision::Default);

        if base == EnforcementDecision::Deny
            || self.rules().any(|rule| enforce(rule, required) != EnforcementDecision::Allow)
        {
            EnforcementDecision::Deny
        } else {
            base
        }
    }
}

fn enforce(rule: AccessLevel, required: Access) -> EnforcementDecision {
    match (rule, required) {
        (AccessLevel::Write, _) => EnforcementDecision::Allow,
        (AccessLevel::List, Access::Read | Access::List) => EnforcementDecision::Allow,
        (AccessLevel::Read, Access::Read) => EnforcementDecision::Allow,
        _ => EnforcementDecision::Deny,
    }
}

fn enforce_scalar(rule: Option<AccessLevel>, required: Access) -> EnforcementDecision {
    rule.map(|r| enforce(r, required))
        .unwrap_or(EnforcementDecision::Default)
}

/// Compiled decision layer for a set of policies
#[derive(Debug, Clone, Default)]
pub struct PolicyAuthorizer {
    agents: RuleTree,
    events: RuleTree,
    keys: RuleTree,
    nodes: RuleTree,
    queries: RuleTree,
    services: RuleTree,
    intentions: RuleTree,
    sessions: RuleTree,
    acl: Option<AccessLevel>,
    operator: Option<AccessLevel>,
    keyring: Option<AccessLevel>,
    mesh: Option<AccessLevel>,
}

impl PolicyAuthorizer {
    /// Merge the parsed rule sets and build lookup trees.
    pub fn compile(policies: &[Arc<PolicyRules>]) -> Self {
        let mut merged = PolicyRules::default();
        for rules in policies {
            merged.merge(rules);
        }

        Self {
            agents: RuleTree::from_segments(&merged.agent, &merged.agent_prefix),
            events: RuleTree::from_segments(&merged.event, &merged.event_prefix),
            keys: RuleTree::from_segments(&merged.key, &merged.key_prefix),
            nodes: RuleTree::from_segments(&merged.node, &merged.node_prefix),
            queries: RuleTree::from_segments(&merged.query, &merged.query_prefix),
            services: RuleTree::from_services(&merged.service, &merged.service_prefix, |r| {
                Some(r.policy)
            }),
            intentions: RuleTree::from_services(&merged.service, &merged.service_prefix, |r| {
                r.intentions
            }),
            sessions: RuleTree::from_segments(&merged.session, &merged.session_prefix),
            acl: merged.acl,
            operator: merged.operator,
            keyring: merged.keyring,
            mesh: merged.mesh,
        }
    }

    fn tree(&self, resource: Resource) -> Option<&RuleTree> {
        match resource {
            Resource::Agent => Some(&self.agents),
            Resource::Event => Some(&self.events),
            Resource::Intention => Some(&self.intentions),
            Resource::Key => Some(&self.keys),
            Resource::Node => Some(&self.nodes),
            Resource::Query => Some(&self.queries),
            Resource::Service => Some(&self.services),
            Resource::Session => Some(&self.sessions),
            Resource::Acl | Resource::Keyring | Resource::Mesh | Resource::Operator => None,
        }
    }
}

impl Authorizer for PolicyAuthorizer {
    fn enforce(&self, resource: Resource, segment: &str, access: Access) -> EnforcementDecision {
        match resource {
            Resource::Acl => enforce_scalar(self.acl, access),
            Resource::Keyring => enforce_scalar(self.keyring, access),
            Resource::Operator => enforce_scalar(self.operator, access),
            // mesh falls back to operator when unset
            Resource::Mesh => match self.mesh {
                Some(rule) => enforce(rule, access),
                None => enforce_scalar(self.operator, access),
            },
            Resource::Intention if segment == "*" => match access {
                Access::Write => self.intentions.all_allowed(access),
                _ => self.intentions.any_allowed(access),
            },
            _ => match self.tree(resource).and_then(|tree| tree.lookup(segment)) {
                Some(rule) => enforce(rule, access),
                None => EnforcementDecision::Default,
            },
        }
    }

    fn key_write_prefix(&self, prefix: &str) -> EnforcementDecision {
        // the prefix rule governing `prefix` itself
        let base = match self.keys.longest_prefix(prefix) {
            Some(AccessLevel::Write) => EnforcementDecision::Allow,
            Some(_) => return EnforcementDecision::Deny,
            None => EnforcementDecision::Default,
        };

        // every rule at or below `prefix` must grant write
        let within_denied = self
            .keys
            .exact
            .iter()
            .chain(self.keys.prefix.iter())
            .any(|(segment, rule)| segment.starts_with(prefix) && *rule != AccessLevel::Write);

        if within_denied {
            EnforcementDecision::Deny
        } else {
            base
        }
    }

    fn intention_default_allow(&self) -> EnforcementDecision {
        EnforcementDecision::Default
    }
}
