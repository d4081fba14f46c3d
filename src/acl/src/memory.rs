//! In-memory authority
//!
//! Holds tokens, policies and roles in process and implements
//! [`AclResolverBackend`] over them. Used to load fixtures for the CLI and
//! to drive the resolver in tests, with fault injection for the degraded
//! paths.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{AclError, Result};
use crate::resolver::{
    AclResolverBackend, LegacyPolicyResponse, LocalLookup, PolicyBatchResponse,
    RoleBatchResponse, TokenReadResponse,
};
use crate::structs::{AclIdentity, AclPolicy, AclRole, AclToken};

/// Legacy token record: a parent root authorizer plus inline rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyToken {
    pub secret_id: String,
    pub parent: String,
    #[serde(default)]
    pub rules: Option<String>,
}

/// Serializable authority contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorityState {
    #[serde(default)]
    pub tokens: Vec<AclToken>,
    #[serde(default)]
    pub policies: Vec<AclPolicy>,
    #[serde(default)]
    pub roles: Vec<AclRole>,
    #[serde(default)]
    pub legacy_tokens: Vec<LegacyToken>,
}

impl AuthorityState {
    /// Load state from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read state file {}", path.as_ref().display()))?;

        serde_json::from_str(&contents).context("Failed to parse state file")
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    read_token: AtomicUsize,
    read_policies: AtomicUsize,
    read_roles: AtomicUsize,
    read_legacy: AtomicUsize,
}

/// Authority holding ACL objects in memory
#[derive(Debug)]
pub struct InMemoryAuthority {
    datacenter: String,

    tokens: RwLock<HashMap<String, Arc<AclToken>>>,
    policies: RwLock<HashMap<String, Arc<AclPolicy>>>,
    roles: RwLock<HashMap<String, Arc<AclRole>>>,
    legacy_tokens: RwLock<HashMap<String, LegacyToken>>,
    server_token: RwLock<Option<String>>,

    /// Datacenter reported on token reads, defaults to `datacenter`
    source_datacenter: RwLock<Option<String>>,
    response_ttl: RwLock<Option<Duration>>,
    latency: RwLock<Option<Duration>>,

    authoritative: AtomicBool,
    legacy: AtomicBool,
    unreachable: AtomicBool,
    disabled: AtomicBool,
    policy_error: RwLock<Option<AclError>>,
    role_error: RwLock<Option<AclError>>,

    calls: CallCounters,
}

impl InMemoryAuthority {
    pub fn new(datacenter: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            tokens: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            legacy_tokens: RwLock::new(HashMap::new()),
            server_token: RwLock::new(None),
            source_datacenter: RwLock::new(None),
            response_ttl: RwLock::new(None),
            latency: RwLock::new(None),
            authoritative: AtomicBool::new(false),
            legacy: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            policy_error: RwLock::new(None),
            role_error: RwLock::new(None),
            calls: CallCounters::default(),
        }
    }

    /// Authority pre-populated from `state`. Tokens without an accessor ID
    /// are assigned a random one.
    pub fn from_state(datacenter: impl Into<String>, state: AuthorityState) -> Self {
        let authority = Self::new(datacenter);
        for mut token in state.tokens {
            if token.accessor_id.is_empty() {
                token.accessor_id = uuid::Uuid::new_v4().to_string();
            }
            authority.insert_token(token);
        }
        for policy in state.policies {
            authority.insert_policy(policy);
        }
        for role in state.roles {
            authority.insert_role(role);
        }
        for legacy in state.legacy_tokens {
            authority.insert_legacy_token(legacy);
        }
        debug!(
            tokens = authority.tokens.read().len(),
            policies = authority.policies.read().len(),
            roles = authority.roles.read().len(),
            "authority state loaded"
        );
        authority
    }

    pub fn insert_token(&self, token: AclToken) {
        self.tokens
            .write()
            .insert(token.secret_id.clone(), Arc::new(token));
    }

    pub fn remove_token(&self, secret: &str) {
        self.tokens.write().remove(secret);
    }

    pub fn insert_policy(&self, policy: AclPolicy) {
        self.policies
            .write()
            .insert(policy.id.clone(), Arc::new(policy));
    }

    pub fn remove_policy(&self, policy_id: &str) {
        self.policies.write().remove(policy_id);
    }

    pub fn insert_role(&self, role: AclRole) {
        self.roles.write().insert(role.id.clone(), Arc::new(role));
    }

    pub fn remove_role(&self, role_id: &str) {
        self.roles.write().remove(role_id);
    }

    pub fn insert_legacy_token(&self, token: LegacyToken) {
        self.legacy_tokens
            .write()
            .insert(token.secret_id.clone(), token);
    }

    pub fn set_server_token(&self, secret: impl Into<String>) {
        *self.server_token.write() = Some(secret.into());
    }

    pub fn set_source_datacenter(&self, datacenter: impl Into<String>) {
        *self.source_datacenter.write() = Some(datacenter.into());
    }

    /// TTL attached to every response
    pub fn set_response_ttl(&self, ttl: Option<Duration>) {
        *self.response_ttl.write() = ttl;
    }

    /// Delay applied to every remote read
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Serve lookups locally, as an authoritative datacenter does
    pub fn set_authoritative(&self, authoritative: bool) {
        self.authoritative.store(authoritative, Ordering::SeqCst);
    }

    pub fn set_legacy(&self, legacy: bool) {
        self.legacy.store(legacy, Ordering::SeqCst);
    }

    /// Fail every remote read with a transport error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail every remote read with "ACL support disabled"
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn inject_policy_error(&self, err: Option<AclError>) {
        *self.policy_error.write() = err;
    }

    pub fn inject_role_error(&self, err: Option<AclError>) {
        *self.role_error.write() = err;
    }

    pub fn read_token_calls(&self) -> usize {
        self.calls.read_token.load(Ordering::SeqCst)
    }

    pub fn read_policies_calls(&self) -> usize {
        self.calls.read_policies.load(Ordering::SeqCst)
    }

    pub fn read_roles_calls(&self) -> usize {
        self.calls.read_roles.load(Ordering::SeqCst)
    }

    pub fn read_legacy_calls(&self) -> usize {
        self.calls.read_legacy.load(Ordering::SeqCst)
    }

    /// Common prologue of every remote read: count, delay, fail if told to.
    async fn remote_call(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.disabled.load(Ordering::SeqCst) {
            return Err(AclError::Disabled);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AclError::Transport("authority unreachable".to_string()));
        }
        Ok(())
    }

    /// Batch reads are authorized by the token that issued them.
    fn check_requester(&self, token: &str) -> Result<()> {
        if self.tokens.read().contains_key(token) {
            Ok(())
        } else {
            Err(AclError::NotFound)
        }
    }

    fn ttl(&self) -> Option<Duration> {
        *self.response_ttl.read()
    }
}

#[async_trait]
impl AclResolverBackend for InMemoryAuthority {
    fn acl_datacenter(&self) -> String {
        self.datacenter.clone()
    }

    fn uses_legacy_acls(&self) -> bool {
        self.legacy.load(Ordering::SeqCst)
    }

    fn is_server_management_token(&self, token: &str) -> bool {
        self.server_token.read().as_deref() == Some(token)
    }

    fn resolve_identity_locally(&self, token: &str) -> LocalLookup<Arc<dyn AclIdentity>> {
        if !self.authoritative.load(Ordering::SeqCst) {
            return LocalLookup::Unhandled;
        }
        let identity = self
            .tokens
            .read()
            .get(token)
            .map(|token| Arc::clone(token) as Arc<dyn AclIdentity>);
        LocalLookup::Found(identity)
    }

    fn resolve_policy_locally(&self, policy_id: &str) -> LocalLookup<Arc<AclPolicy>> {
        if !self.authoritative.load(Ordering::SeqCst) {
            return LocalLookup::Unhandled;
        }
        LocalLookup::Found(self.policies.read().get(policy_id).cloned())
    }

    fn resolve_role_locally(&self, role_id: &str) -> LocalLookup<Arc<AclRole>> {
        if !self.authoritative.load(Ordering::SeqCst) {
            return LocalLookup::Unhandled;
        }
        LocalLookup::Found(self.roles.read().get(role_id).cloned())
    }

    async fn read_token(&self, token: &str) -> Result<TokenReadResponse> {
        self.remote_call(&self.calls.read_token).await?;

        let found = self.tokens.read().get(token).cloned();
        let Some(found) = found else {
            return Err(AclError::NotFound);
        };

        let source_datacenter = self
            .source_datacenter
            .read()
            .clone()
            .unwrap_or_else(|| self.datacenter.clone());

        Ok(TokenReadResponse {
            token: Some(found),
            source_datacenter,
            ttl: self.ttl(),
        })
    }

    async fn read_policies(&self, token: &str, policy_ids: &[String]) -> Result<PolicyBatchResponse> {
        self.remote_call(&self.calls.read_policies).await?;

        let injected = self.policy_error.read().clone();
        if let Some(err) = injected {
            return Err(err);
        }
        self.check_requester(token)?;

        let policies = self.policies.read();
        Ok(PolicyBatchResponse {
            policies: policy_ids
                .iter()
                .filter_map(|id| policies.get(id).cloned())
                .collect(),
            ttl: self.ttl(),
        })
    }

    async fn read_roles(&self, token: &str, role_ids: &[String]) -> Result<RoleBatchResponse> {
        self.remote_call(&self.calls.read_roles).await?;

        let injected = self.role_error.read().clone();
        if let Some(err) = injected {
            return Err(err);
        }
        self.check_requester(token)?;

        let roles = self.roles.read();
        Ok(RoleBatchResponse {
            roles: role_ids
                .iter()
                .filter_map(|id| roles.get(id).cloned())
                .collect(),
            ttl: self.ttl(),
        })
    }

    async fn read_legacy_policy(&self, token: &str) -> Result<LegacyPolicyResponse> {
        self.remote_call(&self.calls.read_legacy).await?;

        let legacy = self.legacy_tokens.read().get(token).cloned();
        let Some(legacy) = legacy else {
            return Err(AclError::NotFound);
        };

        Ok(LegacyPolicyResponse {
            parent: legacy.parent,
            rules: legacy.rules,
            ttl: self.ttl(),
        })
    }
}
