//! Resolved principals behind a token

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::policy::AclPolicy;

/// Accessor ID of the well-known anonymous token
pub const ANONYMOUS_TOKEN_ID: &str = "00000000-0000-0000-0000-000000000002";

/// Secret substituted when a request carries no token
pub const ANONYMOUS_TOKEN_SECRET: &str = "anonymous";

/// Accessor ID reported for the server management token
pub const SERVER_MANAGEMENT_TOKEN_ID: &str = "server";

/// Accessor ID reported for the agent recovery token
pub const AGENT_RECOVERY_TOKEN_ID: &str = "agent-recovery";

/// Replace the anonymous accessor ID with a readable alias for log output.
pub fn alias_if_anonymous(accessor_id: &str) -> &str {
    if accessor_id == ANONYMOUS_TOKEN_ID {
        "anonymous token"
    } else {
        accessor_id
    }
}

/// Enterprise scoping; empty fields mean the default partition/namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnterpriseMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl EnterpriseMeta {
    pub fn partition_or_default(&self) -> &str {
        if self.partition.is_empty() {
            "default"
        } else {
            &self.partition
        }
    }
}

/// Link from a token or role to a policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLink {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Link from a token to a role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLink {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Grant of the default permissions of a named service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub service_name: String,
    /// Datacenters the grant applies in (empty = all)
    #[serde(default)]
    pub datacenters: Vec<String>,
}

impl ServiceIdentity {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            datacenters: Vec::new(),
        }
    }

    pub fn scoped(service_name: impl Into<String>, datacenters: &[&str]) -> Self {
        Self {
            service_name: service_name.into(),
            datacenters: datacenters.iter().map(|dc| dc.to_string()).collect(),
        }
    }
}

/// Grant of the default permissions of a named node in one datacenter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_name: String,
    pub datacenter: String,
}

/// Capability set shared by every identity a token can resolve to
pub trait AclIdentity: Send + Sync + fmt::Debug {
    /// Accessor ID (or a reason string for synthesized identities)
    fn id(&self) -> &str;

    fn secret_token(&self) -> &str;

    fn policy_ids(&self) -> Vec<String>;

    fn role_ids(&self) -> Vec<String>;

    fn service_identities(&self) -> Vec<ServiceIdentity>;

    fn node_identities(&self) -> Vec<NodeIdentity>;

    /// Inline policy carried by tokens predating policy links
    fn embedded_policy(&self) -> Option<AclPolicy>;

    fn is_expired(&self, now: DateTime<Utc>) -> bool;

    /// Token is valid only in the datacenter that created it
    fn is_local(&self) -> bool;

    fn enterprise_meta(&self) -> &EnterpriseMeta;
}

/// Authoritative token record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AclToken {
    pub accessor_id: String,
    pub secret_id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub policies: Vec<PolicyLink>,

    #[serde(default)]
    pub roles: Vec<RoleLink>,

    #[serde(default)]
    pub service_identities: Vec<ServiceIdentity>,

    #[serde(default)]
    pub node_identities: Vec<NodeIdentity>,

    #[serde(default)]
    pub local: bool,

    /// Legacy inline rules
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rules: String,

    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

impl AclToken {
    pub fn new(accessor_id: impl Into<String>, secret_id: impl Into<String>) -> Self {
        Self {
            accessor_id: accessor_id.into(),
            secret_id: secret_id.into(),
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

    pub fn with_role(mut self, id: impl Into<String>) -> Self {
        self.roles.push(RoleLink {
            id: id.into(),
            name: String::new(),
        });
        self
    }

    pub fn with_service_identity(mut self, identity: ServiceIdentity) -> Self {
        self.service_identities.push(identity);
        self
    }

    pub fn with_node_identity(mut self, node: impl Into<String>, datacenter: impl Into<String>) -> Self {
        self.node_identities.push(NodeIdentity {
            node_name: node.into(),
            datacenter: datacenter.into(),
        });
        self
    }
}

impl AclIdentity for AclToken {
    fn id(&self) -> &str {
        &self.accessor_id
    }

    fn secret_token(&self) -> &str {
        &self.secret_id
    }

    fn policy_ids(&self) -> Vec<String> {
        self.policies.iter().map(|link| link.id.clone()).collect()
    }

    fn role_ids(&self) -> Vec<String> {
        self.roles.iter().map(|link| link.id.clone()).collect()
    }

    fn service_identities(&self) -> Vec<ServiceIdentity> {
        self.service_identities.clone()
    }

    fn node_identities(&self) -> Vec<NodeIdentity> {
        self.node_identities.clone()
    }

    fn embedded_policy(&self) -> Option<AclPolicy> {
        if self.rules.is_empty() {
            return None;
        }

        let id = super::policy::content_hash(&self.rules);
        Some(AclPolicy {
            name: format!("legacy-policy-{}", id),
            id,
            rules: self.rules.clone(),
            ..Default::default()
        })
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.map(|t| t < now).unwrap_or(false)
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn enterprise_meta(&self) -> &EnterpriseMeta {
        &self.enterprise_meta
    }
}

/// Sentinel identity used when resolution fails open or degraded
///
/// The reason doubles as the ID so audit output shows why the token was not
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingIdentity {
    pub reason: String,
    pub token: String,
    meta: EnterpriseMeta,
}

impl MissingIdentity {
    pub fn new(reason: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            token: token.into(),
            meta: EnterpriseMeta::default(),
        }
    }
}

impl AclIdentity for MissingIdentity {
    fn id(&self) -> &str {
        &self.reason
    }

    fn secret_token(&self) -> &str {
        &self.token
    }

    fn policy_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn role_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn service_identities(&self) -> Vec<ServiceIdentity> {
        Vec::new()
    }

    fn node_identities(&self) -> Vec<NodeIdentity> {
        Vec::new()
    }

    fn embedded_policy(&self) -> Option<AclPolicy> {
        None
    }

    fn is_expired(&self, _now: DateTime<Utc>) -> bool {
        false
    }

    fn is_local(&self) -> bool {
        false
    }

    fn enterprise_meta(&self) -> &EnterpriseMeta {
        &self.meta
    }
}

/// Identity of the internal server management token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerIdentity {
    meta: EnterpriseMeta,
}

impl AclIdentity for ServerIdentity {
    fn id(&self) -> &str {
        SERVER_MANAGEMENT_TOKEN_ID
    }

    // never echo the management secret back
    fn secret_token(&self) -> &str {
        ""
    }

    fn policy_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn role_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn service_identities(&self) -> Vec<ServiceIdentity> {
        Vec::new()
    }

    fn node_identities(&self) -> Vec<NodeIdentity> {
        Vec::new()
    }

    fn embedded_policy(&self) -> Option<AclPolicy> {
        None
    }

    fn is_expired(&self, _now: DateTime<Utc>) -> bool {
        false
    }

    fn is_local(&self) -> bool {
        true
    }

    fn enterprise_meta(&self) -> &EnterpriseMeta {
        &self.meta
    }
}

/// Identity of the agent recovery token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRecoveryIdentity {
    meta: EnterpriseMeta,
}

impl AclIdentity for AgentRecoveryIdentity {
    fn id(&self) -> &str {
        AGENT_RECOVERY_TOKEN_ID
    }

    fn secret_token(&self) -> &str {
        ""
    }

    fn policy_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn role_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn service_identities(&self) -> Vec<ServiceIdentity> {
        Vec::new()
    }

    fn node_identities(&self) -> Vec<NodeIdentity> {
        Vec::new()
    }

    fn embedded_policy(&self) -> Option<AclPolicy> {
        None
    }

    fn is_expired(&self, _now: DateTime<Utc>) -> bool {
        false
    }

    fn is_local(&self) -> bool {
        true
    }

    fn enterprise_meta(&self) -> &EnterpriseMeta {
        &self.meta
    }
}
