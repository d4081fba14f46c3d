//! Data model shared by resolution, filtering and vetting

mod catalog;
mod identity;
mod policy;

pub use catalog::{
    CatalogVerb, CheckServiceNode, Coordinate, DeregisterRequest, GatewayService, HealthCheck,
    Intention, IntentionMatchEntry, IntentionQueryMatch, KvVerb, Node, NodeInfo, NodeService,
    NodeServiceList, NodeServices, NodesWithGateways, PreparedQuery, RegisterRequest,
    ServiceInfo, ServiceName, ServiceNode, ServiceTopology, Session, TxnOp,
};
pub use identity::{
    alias_if_anonymous, AclIdentity, AclToken, AgentRecoveryIdentity, EnterpriseMeta,
    MissingIdentity, NodeIdentity, PolicyLink, RoleLink, ServerIdentity, ServiceIdentity,
    AGENT_RECOVERY_TOKEN_ID, ANONYMOUS_TOKEN_ID, ANONYMOUS_TOKEN_SECRET,
    SERVER_MANAGEMENT_TOKEN_ID,
};
pub use policy::{
    content_hash, dedup_node_identities, dedup_service_identities, AclAuthMethod,
    AclBindingRule, AclPolicy, AclRole, AclTokenListStub,
};
