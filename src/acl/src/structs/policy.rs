//! Policies, roles and the ACL objects returned by listing endpoints

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::identity::{EnterpriseMeta, NodeIdentity, PolicyLink, ServiceIdentity};

/// Hex BLAKE3 digest of policy rule text
pub fn content_hash(rules: &str) -> String {
    blake3::hash(rules.as_bytes()).to_hex().to_string()
}

/// Named rule set, optionally scoped to a list of datacenters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPolicy {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Rule document (see `authorizer::rules`)
    #[serde(default)]
    pub rules: String,

    /// Datacenters the policy applies in (empty = all)
    #[serde(default)]
    pub datacenters: Vec<String>,

    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

impl AclPolicy {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rules: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rules: rules.into(),
            ..Default::default()
        }
    }

    /// Key under which the parsed form of these rules is cached
    pub fn hash(&self) -> String {
        content_hash(&self.rules)
    }

    /// Whether the policy applies in `datacenter`.
    pub fn applies_in(&self, datacenter: &str) -> bool {
        self.datacenters.is_empty() || self.datacenters.iter().any(|dc| dc == datacenter)
    }
}

/// Bundle of policy links and service/node identities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRole {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub policies: Vec<PolicyLink>,

    #[serde(default)]
    pub service_identities: Vec<ServiceIdentity>,

    #[serde(default)]
    pub node_identities: Vec<NodeIdentity>,

    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

impl AclRole {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, id: impl Into<String>) -> Self {
        self.policies.push(PolicyLink {
            id: id.into(),
            name: String::new(),
        });
        self
    }

    pub fn with_service_identity(mut self, identity: ServiceIdentity) -> Self {
        self.service_identities.push(identity);
        self
    }
}

fn synthetic(rules: String, description: String, datacenters: Vec<String>) -> AclPolicy {
    let id = content_hash(&rules);
    AclPolicy {
        name: format!("synthetic-policy-{}", id),
        id,
        description,
        rules,
        datacenters,
        enterprise_meta: EnterpriseMeta::default(),
    }
}

impl ServiceIdentity {
    /// Expand into the policy granting the service's default permissions:
    /// write on the service and its sidecar proxy, read on every service
    /// and node for discovery.
    pub fn synthetic_policy(&self) -> AclPolicy {
        let mut service = serde_json::Map::new();
        service.insert(self.service_name.clone(), json!({ "policy": "write" }));
        service.insert(
            format!("{}-sidecar-proxy", self.service_name),
            json!({ "policy": "write" }),
        );

        let rules = json!({
            "service": service,
            "service_prefix": { "": { "policy": "read" } },
            "node_prefix": { "": { "policy": "read" } },
        });

        synthetic(
            rules.to_string(),
            format!("synthetic policy for service identity \"{}\"", self.service_name),
            self.datacenters.clone(),
        )
    }
}

impl NodeIdentity {
    /// Expand into the policy granting write on the node and read on every
    /// service, scoped to the grant's datacenter.
    pub fn synthetic_policy(&self) -> AclPolicy {
        let mut node = serde_json::Map::new();
        node.insert(self.node_name.clone(), json!({ "policy": "write" }));

        let rules = json!({
            "node": node,
            "service_prefix": { "": { "policy": "read" } },
        });

        synthetic(
            rules.to_string(),
            format!("synthetic policy for node identity \"{}\"", self.node_name),
            vec![self.datacenter.clone()],
        )
    }
}

/// Merge service identities that share a service name.
///
/// Datacenter lists are unioned; a single unscoped grant widens the merged
/// grant to unscoped. Output is ordered by service name.
pub fn dedup_service_identities(identities: Vec<ServiceIdentity>) -> Vec<ServiceIdentity> {
    // None marks an unscoped grant
    let mut merged: BTreeMap<String, Option<BTreeSet<String>>> = BTreeMap::new();

    for identity in identities {
        let unscoped = identity.datacenters.is_empty();
        let entry = merged
            .entry(identity.service_name)
            .or_insert_with(|| Some(BTreeSet::new()));

        if unscoped {
            *entry = None;
        } else if let Some(dcs) = entry {
            dcs.extend(identity.datacenters);
        }
    }

    merged
        .into_iter()
        .map(|(service_name, dcs)| ServiceIdentity {
            service_name,
            datacenters: dcs.map(|set| set.into_iter().collect()).unwrap_or_default(),
        })
        .collect()
}

/// Drop repeated (node, datacenter) pairs, keeping first occurrences.
pub fn dedup_node_identities(identities: Vec<NodeIdentity>) -> Vec<NodeIdentity> {
    let mut seen = HashSet::new();
    identities
        .into_iter()
        .filter(|id| seen.insert((id.node_name.clone(), id.datacenter.clone())))
        .collect()
}

/// Token as returned by list endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclTokenListStub {
    pub accessor_id: String,
    pub secret_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

/// Rule mapping authenticated identities to roles or services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclBindingRule {
    pub id: String,
    pub auth_method: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub bind_name: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

/// External login method
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclAuthMethod {
    pub name: String,
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}
