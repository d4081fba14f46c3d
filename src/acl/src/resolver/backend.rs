//! Boundary to the authority that owns tokens, policies and roles

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::authorizer::Authorizer;
use crate::error::{AclError, Result};
use crate::structs::{AclIdentity, AclPolicy, AclRole, AclToken};

/// Outcome of a local lookup
#[derive(Debug, Clone)]
pub enum LocalLookup<T> {
    /// Not served locally; consult the cache and the authority
    Unhandled,
    /// Served locally; `None` means the object does not exist
    Found(Option<T>),
    /// Served locally and failed
    Failed(AclError),
}

/// Reply to a token read
#[derive(Debug, Clone, Default)]
pub struct TokenReadResponse {
    /// `None` when the authority has no such token
    pub token: Option<Arc<AclToken>>,
    /// Datacenter that answered, checked against local tokens
    pub source_datacenter: String,
    /// Cache lifetime suggested by the authority
    pub ttl: Option<Duration>,
}

/// Reply to a batch policy read; IDs absent from `policies` do not exist
#[derive(Debug, Clone, Default)]
pub struct PolicyBatchResponse {
    pub policies: Vec<Arc<AclPolicy>>,
    pub ttl: Option<Duration>,
}

/// Reply to a batch role read; IDs absent from `roles` do not exist
#[derive(Debug, Clone, Default)]
pub struct RoleBatchResponse {
    pub roles: Vec<Arc<AclRole>>,
    pub ttl: Option<Duration>,
}

/// Reply to a legacy policy read
#[derive(Debug, Clone, Default)]
pub struct LegacyPolicyResponse {
    /// Root authorizer name the rules are layered on
    pub parent: String,
    /// Rule document, if the token carries one
    pub rules: Option<String>,
    pub ttl: Option<Duration>,
}

/// Authority client consumed by the resolver
///
/// Batch reads are issued with the secret of the token being resolved; a
/// `NotFound` or `PermissionDenied` from them refers to that token, not to
/// the requested objects.
#[async_trait]
pub trait AclResolverBackend: Send + Sync + 'static {
    /// Datacenter holding the authoritative ACL data
    fn acl_datacenter(&self) -> String;

    /// Whether tokens must be resolved through the legacy path
    fn uses_legacy_acls(&self) -> bool {
        false
    }

    fn is_server_management_token(&self, _token: &str) -> bool {
        false
    }

    fn resolve_identity_locally(&self, token: &str) -> LocalLookup<Arc<dyn AclIdentity>>;

    fn resolve_policy_locally(&self, policy_id: &str) -> LocalLookup<Arc<AclPolicy>>;

    fn resolve_role_locally(&self, role_id: &str) -> LocalLookup<Arc<AclRole>>;

    async fn read_token(&self, token: &str) -> Result<TokenReadResponse>;

    async fn read_policies(&self, token: &str, policy_ids: &[String]) -> Result<PolicyBatchResponse>;

    async fn read_roles(&self, token: &str, role_ids: &[String]) -> Result<RoleBatchResponse>;

    async fn read_legacy_policy(&self, _token: &str) -> Result<LegacyPolicyResponse> {
        Err(AclError::InvalidRequest(
            "legacy ACL resolution is not supported by this backend".to_string(),
        ))
    }
}

/// Hook for enterprise-scoped default authorizers
#[async_trait]
pub trait EnterpriseDelegate: Send + Sync + 'static {
    /// Layer inserted between the compiled policies and the global default
    async fn resolve_defaults_for_identity(
        &self,
        identity: &dyn AclIdentity,
    ) -> Result<Option<Arc<dyn Authorizer>>>;
}

/// Delegate without enterprise defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnterpriseDefaults;

#[async_trait]
impl EnterpriseDelegate for NoEnterpriseDefaults {
    async fn resolve_defaults_for_identity(
        &self,
        _identity: &dyn AclIdentity,
    ) -> Result<Option<Arc<dyn Authorizer>>> {
        Ok(None)
    }
}
