//! Catalog, session and query shapes consulted by filtering and vetting

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::identity::EnterpriseMeta;

/// Catalog node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub tagged_addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

impl Node {
    pub fn named(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }
}

/// Service instance registered on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeService {
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

impl NodeService {
    pub fn new(id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            ..Default::default()
        }
    }
}

/// Health check; an empty `service_id` marks a node-level check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub node: String,
    pub check_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

impl HealthCheck {
    pub fn node_check(node: impl Into<String>, check_id: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            check_id: check_id.into(),
            ..Default::default()
        }
    }

    pub fn service_check(
        node: impl Into<String>,
        check_id: impl Into<String>,
        service_id: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            check_id: check_id.into(),
            service_id: service_id.into(),
            service_name: service_name.into(),
            ..Default::default()
        }
    }
}

/// Service instance joined with its node name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub node: String,
    #[serde(default)]
    pub address: String,
    pub service_id: String,
    pub service_name: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

/// Node, service and checks of a health query result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: NodeService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

/// Services of one node keyed by service ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeServices {
    pub node: Node,
    #[serde(default)]
    pub services: BTreeMap<String, NodeService>,
}

/// Services of one node as a list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeServiceList {
    pub node: Option<Node>,
    #[serde(default)]
    pub services: Vec<NodeService>,
}

/// Upstreams and downstreams of a service in the mesh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTopology {
    #[serde(default)]
    pub upstreams: Vec<CheckServiceNode>,
    #[serde(default)]
    pub downstreams: Vec<CheckServiceNode>,
    /// Set when filtering removed an upstream or downstream
    #[serde(default)]
    pub filtered_by_acls: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

/// Network coordinate of a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub node: String,
    #[serde(default)]
    pub segment: String,
    #[serde(default)]
    pub vec: Vec<f64>,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

/// Allow/deny rule between a source and destination service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intention {
    pub id: String,
    pub source_name: String,
    pub destination_name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentionMatchEntry {
    pub name: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

/// Intention match request; entries are cleared wholesale when any entry
/// is not readable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentionQueryMatch {
    #[serde(default)]
    pub entries: Vec<IntentionMatchEntry>,
}

/// Node with all of its services and checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub services: Vec<NodeService>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceName {
    pub name: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Service reachable through a gateway
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayService {
    pub gateway: ServiceName,
    pub service: ServiceName,
    /// `ingress-gateway` or `terminating-gateway`
    #[serde(default)]
    pub gateway_kind: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
}

impl GatewayService {
    pub fn new(gateway: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            gateway: ServiceName::new(gateway),
            service: ServiceName::new(service),
            ..Default::default()
        }
    }
}

/// Service dump entry; gateway-only entries carry no node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default)]
    pub service: Option<NodeService>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    pub gateway_service: GatewayService,
}

/// Mesh nodes of a peered service along with the gateways in front of them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesWithGateways {
    #[serde(default)]
    pub nodes: Vec<CheckServiceNode>,
    #[serde(default)]
    pub gateways: Vec<GatewayService>,
    #[serde(default)]
    pub imported_nodes: Vec<CheckServiceNode>,
}

/// Stored query; `token` is captured at creation and must not leak
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedQuery {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub service: String,
}

impl PreparedQuery {
    /// Name used for prefix ACL lookups; unnamed queries have none.
    pub fn acl_prefix(&self) -> Option<&str> {
        if self.name.is_empty() {
            None
        } else {
            Some(&self.name)
        }
    }
}

/// Catalog registration of a node and optionally one service and checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub tagged_addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub node_meta: BTreeMap<String, String>,
    #[serde(default)]
    pub service: Option<NodeService>,
    /// Must be flattened into `checks` before vetting
    #[serde(default)]
    pub check: Option<HealthCheck>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    #[serde(default)]
    pub skip_node_update: bool,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

impl RegisterRequest {
    /// Whether applying this request would modify `node`; a missing node
    /// means the request creates it.
    pub fn changes_node(&self, node: Option<&Node>) -> bool {
        let node = match node {
            Some(node) => node,
            None => return true,
        };

        if self.skip_node_update {
            return false;
        }

        self.id != node.id
            || !self.node.eq_ignore_ascii_case(&node.node)
            || self.enterprise_meta.partition_or_default() != node.enterprise_meta.partition_or_default()
            || self.address != node.address
            || self.datacenter != node.datacenter
            || self.tagged_addresses != node.tagged_addresses
            || self.node_meta != node.meta
    }
}

/// Catalog deregistration of a service, a check, or the whole node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterRequest {
    #[serde(default)]
    pub datacenter: String,
    pub node: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub check_id: String,
    #[serde(default)]
    pub enterprise_meta: EnterpriseMeta,
}

/// Key-value verbs of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KvVerb {
    Set,
    Cas,
    Lock,
    Unlock,
    Delete,
    DeleteCas,
    DeleteTree,
    Get,
    GetTree,
    CheckSession,
    CheckIndex,
    CheckNotExists,
}

/// Node, service and check verbs of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CatalogVerb {
    Set,
    Cas,
    Get,
    Delete,
    DeleteCas,
}

/// One operation of a multi-entity transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnOp {
    Kv { verb: KvVerb, key: String },
    Node { verb: CatalogVerb, node: Node },
    Service { verb: CatalogVerb, node: String, service: NodeService },
    Check { verb: CatalogVerb, check: HealthCheck },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored_node() -> Node {
        let mut node = Node::named("web-1");
        node.id = "b8b2c1a0".into();
        node.address = "10.0.0.1".into();
        node.datacenter = "dc1".into();
        node.meta.insert("rack".into(), "r1".into());
        node
    }

    fn matching_request() -> RegisterRequest {
        let mut meta = BTreeMap::new();
        meta.insert("rack".to_string(), "r1".to_string());
        RegisterRequest {
            datacenter: "dc1".into(),
            id: "b8b2c1a0".into(),
            node: "WEB-1".into(),
            address: "10.0.0.1".into(),
            node_meta: meta,
            ..Default::default()
        }
    }

    #[test]
    fn test_changes_node_detects_field_changes() {
        let node = stored_node();
        let req = matching_request();
        assert!(!req.changes_node(Some(&node)));
        assert!(req.changes_node(None));

        let mut moved = req.clone();
        moved.address = "10.0.0.2".into();
        assert!(moved.changes_node(Some(&node)));

        let mut retagged = req.clone();
        retagged.tagged_addresses.insert("wan".into(), "1.2.3.4".into());
        assert!(retagged.changes_node(Some(&node)));

        let mut skipped = moved;
        skipped.skip_node_update = true;
        assert!(!skipped.changes_node(Some(&node)));
    }

    #[test]
    fn test_prepared_query_prefix() {
        let mut query = PreparedQuery::default();
        assert_eq!(query.acl_prefix(), None);
        query.name = "geo-db".into();
        assert_eq!(query.acl_prefix(), Some("geo-db"));
    }
}
