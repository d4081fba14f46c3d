//! Policy rule documents
//!
//! Rules are JSON objects with one map per resource section, keyed by
//! segment:
//!
//! ```json
//! {
//!   "key_prefix": { "app/": { "policy": "write" } },
//!   "service": { "web": { "policy": "write", "intentions": "read" } },
//!   "operator": "read"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AclError, Result};

/// Access granted by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Deny,
    Read,
    List,
    Write,
}

impl AccessLevel {
    fn rank(self) -> u8 {
        match self {
            AccessLevel::Read => 1,
            AccessLevel::List => 2,
            AccessLevel::Write => 3,
            AccessLevel::Deny => 4,
        }
    }

    /// Precedence when two policies grant the same segment:
    /// deny > write > list > read.
    pub fn takes_precedence_over(self, other: AccessLevel) -> bool {
        self.rank() >= other.rank()
    }

    fn merge(slot: &mut AccessLevel, incoming: AccessLevel) {
        if incoming.takes_precedence_over(*slot) {
            *slot = incoming;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentRule {
    pub policy: AccessLevel,
}

/// Service rule; `intentions` defaults from `policy` when parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceRule {
    pub policy: AccessLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intentions: Option<AccessLevel>,
}

/// Parsed rule set of one or more policies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRules {
    #[serde(default)]
    pub agent: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub agent_prefix: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub event: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub event_prefix: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub key: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub key_prefix: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub node: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub node_prefix: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub query: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub query_prefix: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub service: BTreeMap<String, ServiceRule>,
    #[serde(default)]
    pub service_prefix: BTreeMap<String, ServiceRule>,
    #[serde(default)]
    pub session: BTreeMap<String, SegmentRule>,
    #[serde(default)]
    pub session_prefix: BTreeMap<String, SegmentRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<AccessLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<AccessLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyring: Option<AccessLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<AccessLevel>,
}

impl PolicyRules {
    /// Parse an anonymous rule document.
    pub fn parse(source: &str) -> Result<Self> {
        Self::parse_policy("inline", source)
    }

    /// Parse the rules of the named policy. Errors name the policy.
    pub fn parse_policy(name: &str, source: &str) -> Result<Self> {
        let compile_err = |reason: String| AclError::Compile {
            policy: name.to_string(),
            reason,
        };

        if source.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut rules: PolicyRules =
            serde_json::from_str(source).map_err(|e| compile_err(e.to_string()))?;
        rules.validate().map_err(compile_err)?;
        rules.default_intentions();
        Ok(rules)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let list_free = [
            ("agent", &self.agent),
            ("agent_prefix", &self.agent_prefix),
            ("event", &self.event),
            ("event_prefix", &self.event_prefix),
            ("node", &self.node),
            ("node_prefix", &self.node_prefix),
            ("query", &self.query),
            ("query_prefix", &self.query_prefix),
            ("session", &self.session),
            ("session_prefix", &self.session_prefix),
        ];
        for (section, rules) in list_free {
            if let Some((segment, _)) = rules.iter().find(|(_, r)| r.policy == AccessLevel::List) {
                return Err(format!("invalid {} policy for {:?}: list", section, segment));
            }
        }

        for (section, rules) in [("service", &self.service), ("service_prefix", &self.service_prefix)] {
            for (segment, rule) in rules {
                if rule.policy == AccessLevel::List {
                    return Err(format!("invalid {} policy for {:?}: list", section, segment));
                }
                if rule.intentions == Some(AccessLevel::List) {
                    return Err(format!("invalid {} intentions for {:?}: list", section, segment));
                }
            }
        }

        for (scalar, level) in [
            ("acl", self.acl),
            ("operator", self.operator),
            ("keyring", self.keyring),
            ("mesh", self.mesh),
        ] {
            if level == Some(AccessLevel::List) {
                return Err(format!("invalid {} policy: list", scalar));
            }
        }

        Ok(())
    }

    // read/write services may read their intentions; denied services may not
    fn default_intentions(&mut self) {
        for rule in self.service.values_mut().chain(self.service_prefix.values_mut()) {
            if rule.intentions.is_none() {
                rule.intentions = Some(match rule.policy {
                    AccessLevel::Read | AccessLevel::Write => AccessLevel::Read,
                    _ => AccessLevel::Deny,
                });
            }
        }
    }

    /// Fold `other` into `self` using rule precedence.
    pub fn merge(&mut self, other: &PolicyRules) {
        fn merge_segments(into: &mut BTreeMap<String, SegmentRule>, from: &BTreeMap<String, SegmentRule>) {
            for (segment, rule) in from {
                into.entry(segment.clone())
                    .and_modify(|existing| AccessLevel::merge(&mut existing.policy, rule.policy))
                    .or_insert(*rule);
            }
        }

        fn merge_services(into: &mut BTreeMap<String, ServiceRule>, from: &BTreeMap<String, ServiceRule>) {
            for (segment, rule) in from {
                into.entry(segment.clone())
                    .and_modify(|existing| {
                        AccessLevel::merge(&mut existing.policy, rule.policy);
                        existing.intentions = match (existing.intentions, rule.intentions) {
                            (Some(mut current), Some(incoming)) => {
                                AccessLevel::merge(&mut current, incoming);
                                Some(current)
                            }
                            (current, incoming) => current.or(incoming),
                        };
                    })
                    .or_insert(*rule);
            }
        }

        fn merge_scalar(into: &mut Option<AccessLevel>, from: Option<AccessLevel>) {
            *into = match (*into, from) {
                (Some(mut current), Some(incoming)) => {
                    AccessLevel::merge(&mut current, incoming);
                    Some(current)
                }
                (current, incoming) => current.or(incoming),
            };
        }

        merge_segments(&mut self.agent, &other.agent);
        merge_segments(&mut self.agent_prefix, &other.agent_prefix);
        merge_segments(&mut self.event, &other.event);
        merge_segments(&mut self.event_prefix, &other.event_prefix);
        merge_segments(&mut self.key, &other.key);
        merge_segments(&mut self.key_prefix, &other.key_prefix);
        merge_segments(&mut self.node, &other.node);
        merge_segments(&mut self.node_prefix, &other.node_prefix);
        merge_segments(&mut self.query, &other.query);
        merge_segments(&mut self.query_prefix, &other.query_prefix);
        merge_services(&mut self.service, &other.service);
        merge_services(&mut self.service_prefix, &other.service_prefix);
        merge_segments(&mut self.session, &other.session);
        merge_segments(&mut self.session_prefix, &other.session_prefix);

        merge_scalar(&mut self.acl, other.acl);
        merge_scalar(&mut self.operator, other.operator);
        merge_scalar(&mut self.keyring, other.keyring);
        merge_scalar(&mut self.mesh, other.mesh);
    }
}
