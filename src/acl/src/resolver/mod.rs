//! Token resolution engine
//!
//! Resolves a token to its identity, the identity to its roles and
//! policies, and the policies to a layered authorizer. Every layer consults
//! its own TTL'd cache, funnels authority reads through a coalescing group
//! and applies the configured down policy when the authority fails.
//!
//! ```text
//! token ─► identity ─► roles ─► policies + synthetic ─► scope filter ─► compile
//!            │           │          │                                     │
//!         [cache]     [cache]    [cache]                        [parsed policies]
//!            └───────────┴──────────┴── coalesced authority reads
//! ```

mod backend;
mod identity;
mod legacy;
mod links;

pub use backend::{
    AclResolverBackend, EnterpriseDelegate, LegacyPolicyResponse, LocalLookup,
    NoEnterpriseDefaults, PolicyBatchResponse, RoleBatchResponse, TokenReadResponse,
};

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::authorizer::{
    agent_recovery_authorizer, allow_all, deny_all, manage_all, root_authorizer, Authorizer,
    ChainedAuthorizer, PolicyAuthorizer, PolicyRules,
};
use crate::cache::AclCaches;
use crate::coalesce::Group;
use crate::config::{AclResolverConfig, DefaultPolicy, DownPolicy};
use crate::error::{AclError, Result};
use crate::filter::{AclFilter, FilterSubject};
use crate::metrics::AclMetrics;
use crate::structs::{
    alias_if_anonymous, AclIdentity, AclPolicy, AclRole, AgentRecoveryIdentity, MissingIdentity,
    ServerIdentity, ANONYMOUS_TOKEN_SECRET,
};

/// Outcome of resolving a token
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub authorizer: Arc<dyn Authorizer>,
    /// Identity behind the token; `None` for cached legacy authorizers
    pub identity: Option<Arc<dyn AclIdentity>>,
}

impl ResolvedToken {
    /// Accessor ID for log output
    pub fn accessor_id(&self) -> &str {
        self.identity
            .as_ref()
            .map(|identity| alias_if_anonymous(identity.id()))
            .unwrap_or("")
    }
}

struct AgentRecovery {
    secret: blake3::Hash,
    authorizer: Arc<dyn Authorizer>,
}

/// State shared with fetch tasks, which outlive the caller that started them
#[derive(Clone)]
struct Fetcher {
    backend: Arc<dyn AclResolverBackend>,
    caches: Arc<AclCaches>,
    config: Arc<AclResolverConfig>,
    metrics: Arc<AclMetrics>,
}

impl Fetcher {
    /// Parse rules, reusing the parsed form of identical rule text.
    fn parse_rules(&self, policy: &AclPolicy) -> Result<Arc<PolicyRules>> {
        let hash = policy.hash();
        if let Some(parsed) = self.caches.get_parsed_policy(&hash) {
            return Ok(parsed);
        }

        let parsed = Arc::new(PolicyRules::parse_policy(&policy.name, &policy.rules)?);
        self.caches.put_parsed_policy(&hash, Arc::clone(&parsed));
        Ok(parsed)
    }

    fn compile(&self, policies: &[Arc<AclPolicy>]) -> Result<Arc<dyn Authorizer>> {
        let parsed = policies
            .iter()
            .map(|policy| self.parse_rules(policy))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(PolicyAuthorizer::compile(&parsed)))
    }

    fn default_authorizer(&self) -> Arc<dyn Authorizer> {
        match self.config.default_policy {
            DefaultPolicy::Allow => allow_all(),
            DefaultPolicy::Deny => deny_all(),
        }
    }
}

/// Resolves tokens to authorizers
///
/// Construct one per server and share it behind an `Arc`; all state
/// (caches, coalescing groups, the auto-disable window) lives here.
pub struct AclResolver {
    config: Arc<AclResolverConfig>,
    backend: Arc<dyn AclResolverBackend>,
    enterprise: Arc<dyn EnterpriseDelegate>,
    caches: Arc<AclCaches>,
    metrics: Arc<AclMetrics>,

    identity_group: Group<Option<Arc<dyn AclIdentity>>>,
    policy_group: Group<HashMap<String, Arc<AclPolicy>>>,
    role_group: Group<HashMap<String, Arc<AclRole>>>,
    legacy_group: Group<Arc<dyn Authorizer>>,

    /// Authorizer handed out when the authority cannot be reached
    down: Arc<dyn Authorizer>,

    /// End of the auto-disable window
    disabled_until: RwLock<Option<Instant>>,

    agent_recovery: Option<AgentRecovery>,
}

impl AclResolver {
    pub fn new(config: AclResolverConfig, backend: Arc<dyn AclResolverBackend>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AclError::InvalidRequest(format!("invalid resolver configuration: {:#}", e)))?;

        let metrics = AclMetrics::new()
            .map_err(|e| AclError::Internal(format!("failed to register metrics: {}", e)))?;

        let down = match config.down_policy {
            DownPolicy::Allow => allow_all(),
            DownPolicy::Deny | DownPolicy::ExtendCache | DownPolicy::AsyncCache => deny_all(),
        };

        let agent_recovery = config.agent_recovery_token.as_deref().map(|secret| AgentRecovery {
            secret: blake3::hash(secret.as_bytes()),
            authorizer: agent_recovery_authorizer(&config.node_name),
        });

        info!(
            datacenter = %config.datacenter,
            down_policy = %config.down_policy,
            default_policy = %config.default_policy,
            "ACL resolver initialized"
        );

        Ok(Self {
            caches: Arc::new(AclCaches::new(config.cache.clone())),
            config: Arc::new(config),
            backend,
            enterprise: Arc::new(NoEnterpriseDefaults),
            metrics: Arc::new(metrics),
            identity_group: Group::new(),
            policy_group: Group::new(),
            role_group: Group::new(),
            legacy_group: Group::new(),
            down,
            disabled_until: RwLock::new(None),
            agent_recovery,
        })
    }

    /// Install a delegate contributing enterprise-scoped defaults.
    pub fn with_enterprise(mut self, enterprise: Arc<dyn EnterpriseDelegate>) -> Self {
        self.enterprise = enterprise;
        self
    }

    pub fn config(&self) -> &AclResolverConfig {
        &self.config
    }

    pub fn caches(&self) -> &AclCaches {
        &self.caches
    }

    pub fn metrics(&self) -> &AclMetrics {
        &self.metrics
    }

    fn fetcher(&self) -> Fetcher {
        Fetcher {
            backend: Arc::clone(&self.backend),
            caches: Arc::clone(&self.caches),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Whether tokens are currently being enforced.
    ///
    /// False when ACLs are off in configuration, or while the auto-disable
    /// window opened by an upstream "ACL support disabled" report is running.
    pub fn acls_enabled(&self) -> bool {
        if !self.config.acls_enabled {
            return false;
        }

        if self.config.disable_duration().is_some() {
            if let Some(until) = *self.disabled_until.read() {
                if Instant::now() <= until {
                    return false;
                }
            }
        }

        true
    }

    fn handle_disabled_error(&self, err: &AclError) {
        let Some(window) = self.config.disable_duration() else {
            return;
        };

        if err.is_disabled() {
            warn!(
                disabled_for_ms = window.as_millis() as u64,
                "remote datacenter reports ACL support disabled, disabling ACLs locally"
            );
            *self.disabled_until.write() = Some(Instant::now() + window);
        }
    }

    /// Resolve a token to its authorizer.
    ///
    /// `Ok(None)` means ACLs are disabled and every operation is allowed.
    pub async fn resolve_token(&self, token: &str) -> Result<Option<Arc<dyn Authorizer>>> {
        Ok(self
            .resolve_token_with_identity(token)
            .await?
            .map(|resolved| resolved.authorizer))
    }

    /// Resolve a token to its authorizer and the identity behind it.
    pub async fn resolve_token_with_identity(&self, token: &str) -> Result<Option<ResolvedToken>> {
        if !self.acls_enabled() {
            return Ok(None);
        }

        if root_authorizer(token).is_some() {
            return Err(AclError::RootDenied);
        }

        let token = if token.is_empty() {
            ANONYMOUS_TOKEN_SECRET
        } else {
            token
        };

        if let Some(resolved) = self.resolve_locally_managed_token(token) {
            return Ok(Some(resolved));
        }

        let started = Instant::now();
        let result = if self.backend.uses_legacy_acls() {
            self.resolve_token_legacy(token).await
        } else {
            self.resolve_token_to_authorizer(token).await
        };
        self.metrics.record_resolve(started.elapsed());

        let resolved = result?;
        debug!(accessor_id = resolved.accessor_id(), "resolved token");
        Ok(Some(resolved))
    }

    /// Tokens answered without cache or authority: the agent recovery token
    /// and the server management token.
    fn resolve_locally_managed_token(&self, token: &str) -> Option<ResolvedToken> {
        if let Some(recovery) = &self.agent_recovery {
            // blake3::Hash equality is constant time
            if recovery.secret == blake3::hash(token.as_bytes()) {
                return Some(ResolvedToken {
                    authorizer: Arc::clone(&recovery.authorizer),
                    identity: Some(Arc::new(AgentRecoveryIdentity::default())),
                });
            }
        }

        if self.backend.is_server_management_token(token) {
            return Some(ResolvedToken {
                authorizer: manage_all(),
                identity: Some(Arc::new(ServerIdentity::default())),
            });
        }

        None
    }

    async fn resolve_token_to_authorizer(&self, token: &str) -> Result<ResolvedToken> {
        let (identity, policies) = match self.resolve_token_to_identity_and_policies(token).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.handle_disabled_error(&err);
                if err.is_remote() {
                    error!(
                        error = %err,
                        datacenter = %self.backend.acl_datacenter(),
                        "Error resolving token"
                    );
                    return Ok(self.down_policy_result(token));
                }
                return Err(err);
            }
        };

        let compiled = self.fetcher().compile(&policies)?;
        let mut chain = vec![compiled];

        match self
            .enterprise
            .resolve_defaults_for_identity(identity.as_ref())
            .await
        {
            Ok(Some(defaults)) => chain.push(defaults),
            Ok(None) => {}
            Err(err) if err.is_remote() => {
                error!(error = %err, "Error resolving identity defaults");
                self.metrics.record_down_policy(self.config.down_policy.as_str());
                return Ok(ResolvedToken {
                    authorizer: Arc::clone(&self.down),
                    identity: Some(identity),
                });
            }
            Err(err) => return Err(err),
        }

        chain.push(self.fetcher().default_authorizer());

        Ok(ResolvedToken {
            authorizer: Arc::new(ChainedAuthorizer::new(chain)),
            identity: Some(identity),
        })
    }

    fn down_policy_result(&self, token: &str) -> ResolvedToken {
        self.metrics.record_down_policy(self.config.down_policy.as_str());
        ResolvedToken {
            authorizer: Arc::clone(&self.down),
            identity: Some(Arc::new(MissingIdentity::new("primary-dc-down", token))),
        }
    }

    /// Resolve a token to its identity and effective policy set, retrying
    /// when the token's links change underneath the resolution.
    pub async fn resolve_token_to_identity_and_policies(
        &self,
        token: &str,
    ) -> Result<(Arc<dyn AclIdentity>, Vec<Arc<AclPolicy>>)> {
        let mut last_err = AclError::NotFound;

        for attempt in 1..=self.config.policy_resolution_max_retries {
            let identity = self.resolve_live_identity(token).await?;

            match self.resolve_policies_for_identity(identity.as_ref()).await {
                Ok(policies) => return Ok((identity, policies)),
                Err(err) => {
                    self.retry_or_fail(&err, identity.as_ref())?;
                    debug!(attempt, error = %err, "token changed while resolving policies, retrying");
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    /// Resolve a token to its identity and linked roles, with the same retry
    /// protocol as policy resolution.
    pub async fn resolve_token_to_identity_and_roles(
        &self,
        token: &str,
    ) -> Result<(Arc<dyn AclIdentity>, Vec<Arc<AclRole>>)> {
        let mut last_err = AclError::NotFound;

        for attempt in 1..=self.config.role_resolution_max_retries {
            let identity = self.resolve_live_identity(token).await?;
            let role_ids = identity.role_ids();

            match self.collect_roles_for_identity(identity.as_ref(), &role_ids).await {
                Ok(roles) => return Ok((identity, roles)),
                Err(err) => {
                    self.retry_or_fail(&err, identity.as_ref())?;
                    debug!(attempt, error = %err, "token changed while resolving roles, retrying");
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    async fn resolve_live_identity(&self, token: &str) -> Result<Arc<dyn AclIdentity>> {
        match self.resolve_identity_from_token(token).await? {
            Some(identity) if !identity.is_expired(Utc::now()) => Ok(identity),
            _ => Err(AclError::NotFound),
        }
    }

    /// Decide whether a link resolution failure is worth another attempt.
    ///
    /// Not-found for the very secret in use means the token was deleted;
    /// other linkage errors mean it changed and are retried. Everything else
    /// is returned as is.
    fn retry_or_fail(&self, err: &AclError, identity: &dyn AclIdentity) -> Result<()> {
        match err.linkage_token() {
            Some(linked) if err.is_not_found() && linked == identity.secret_token() => {
                Err(AclError::NotFound)
            }
            Some(_) => Ok(()),
            None => Err(err.clone()),
        }
    }

    /// Resolve `token` and filter `subject` in place; returns whether
    /// anything was removed.
    pub async fn filter_acl(&self, token: &str, subject: FilterSubject<'_>) -> Result<bool> {
        match self.resolve_token(token).await? {
            Some(authorizer) => {
                Ok(AclFilter::new(authorizer.as_ref(), self.config.enforce_version8).filter(subject))
            }
            None => Ok(false),
        }
    }

    /// Forget everything cached for a token after it was changed or deleted.
    pub fn invalidate_token(&self, secret: &str) {
        self.caches.remove_identity(secret);
        self.caches.remove_authorizer(secret);
    }

    pub fn invalidate_policy(&self, policy_id: &str) {
        self.caches.remove_policy(policy_id);
    }

    pub fn invalidate_role(&self, role_id: &str) {
        self.caches.remove_role(role_id);
    }

    /// Tear down: drop every cached entry and stop caching. Fetches still in
    /// flight complete for their own waiters without writing to the caches.
    pub fn close(&self) {
        self.caches.close();
        *self.disabled_until.write() = None;
        info!("ACL resolver closed");
    }
}

impl std::fmt::Debug for AclResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclResolver")
            .field("datacenter", &self.config.datacenter)
            .field("down_policy", &self.config.down_policy)
            .field("caches", &self.caches)
            .finish()
    }
}
