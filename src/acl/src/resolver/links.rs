//! Identity to roles and policies

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{AclResolver, Fetcher, LocalLookup};
use crate::config::DownPolicy;
use crate::error::{AclError, Result};
use crate::structs::{
    alias_if_anonymous, dedup_node_identities, dedup_service_identities, AclIdentity, AclPolicy,
    AclRole,
};

fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

impl AclResolver {
    /// Effective policy set of an identity in the local datacenter: linked
    /// policies, policies of linked roles and the synthetic policies of all
    /// service and node identities.
    pub(super) async fn resolve_policies_for_identity(
        &self,
        identity: &dyn AclIdentity,
    ) -> Result<Vec<Arc<AclPolicy>>> {
        let mut policy_ids = identity.policy_ids();
        let role_ids = identity.role_ids();
        let mut service_identities = identity.service_identities();
        let mut node_identities = identity.node_identities();

        if policy_ids.is_empty()
            && role_ids.is_empty()
            && service_identities.is_empty()
            && node_identities.is_empty()
        {
            return Ok(identity
                .embedded_policy()
                .map(|policy| vec![Arc::new(policy)])
                .unwrap_or_default());
        }

        let roles = self.collect_roles_for_identity(identity, &role_ids).await?;
        for role in &roles {
            policy_ids.extend(role.policies.iter().map(|link| link.id.clone()));
            service_identities.extend(role.service_identities.iter().cloned());
            node_identities.extend(role.node_identities.iter().cloned());
        }

        let policy_ids = dedup_ids(policy_ids);
        let synthetic: Vec<Arc<AclPolicy>> = dedup_service_identities(service_identities)
            .iter()
            .map(|grant| Arc::new(grant.synthetic_policy()))
            .chain(
                dedup_node_identities(node_identities)
                    .iter()
                    .map(|grant| Arc::new(grant.synthetic_policy())),
            )
            .collect();

        let mut policies = self.collect_policies_for_identity(identity, &policy_ids).await?;
        policies.extend(synthetic);

        let datacenter = &self.config.datacenter;
        Ok(policies
            .into_iter()
            .filter(|policy| policy.applies_in(datacenter))
            .collect())
    }

    pub(super) async fn collect_policies_for_identity(
        &self,
        identity: &dyn AclIdentity,
        policy_ids: &[String],
    ) -> Result<Vec<Arc<AclPolicy>>> {
        let mut policies = Vec::with_capacity(policy_ids.len());
        let mut missing = Vec::new();
        let mut expired = Vec::new();
        let ttl = self.config.policy_ttl();

        for policy_id in policy_ids {
            match self.backend.resolve_policy_locally(policy_id) {
                LocalLookup::Found(Some(policy)) => {
                    policies.push(policy);
                    continue;
                }
                LocalLookup::Failed(err) if !err.is_not_found() => return Err(err),
                LocalLookup::Found(None) | LocalLookup::Failed(_) => {
                    warn!(
                        policy = %policy_id,
                        accessor_id = alias_if_anonymous(identity.id()),
                        "policy not found for identity"
                    );
                    continue;
                }
                LocalLookup::Unhandled => {}
            }

            let Some(entry) = self.caches.get_policy(policy_id) else {
                missing.push(policy_id.clone());
                continue;
            };

            let fresh = entry.is_fresh(ttl);
            match entry.into_value() {
                Some(policy) if fresh => policies.push(policy),
                Some(policy) => expired.push(policy),
                None if fresh => {}
                None => missing.push(policy_id.clone()),
            }
        }

        if missing.is_empty() && expired.is_empty() {
            return Ok(policies);
        }

        let mut fetch_ids = missing.clone();
        fetch_ids.extend(expired.iter().map(|policy| policy.id.clone()));
        debug!(
            missing = missing.len(),
            expired = expired.len(),
            "fetching policies for identity"
        );

        let fetcher = self.fetcher();
        let token = identity.secret_token().to_string();
        let ids = fetch_ids.clone();
        let waiter = self.policy_group.do_chan(identity.secret_token(), move || async move {
            fetcher.fetch_and_cache_policies(&token, &ids).await
        });

        if missing.is_empty() && self.config.down_policy == DownPolicy::AsyncCache {
            policies.extend(expired);
            return Ok(policies);
        }

        let fetched = waiter.await?;
        policies.extend(fetch_ids.iter().filter_map(|id| fetched.get(id).cloned()));
        Ok(policies)
    }

    pub(super) async fn collect_roles_for_identity(
        &self,
        identity: &dyn AclIdentity,
        role_ids: &[String],
    ) -> Result<Vec<Arc<AclRole>>> {
        let mut roles = Vec::with_capacity(role_ids.len());
        let mut missing = Vec::new();
        let mut expired = Vec::new();
        let ttl = self.config.role_ttl();

        for role_id in role_ids {
            match self.backend.resolve_role_locally(role_id) {
                LocalLookup::Found(Some(role)) => {
                    roles.push(role);
                    continue;
                }
                LocalLookup::Failed(err) if !err.is_not_found() => return Err(err),
                LocalLookup::Found(None) | LocalLookup::Failed(_) => {
                    warn!(
                        role = %role_id,
                        accessor_id = alias_if_anonymous(identity.id()),
                        "role not found for identity"
                    );
                    continue;
                }
                LocalLookup::Unhandled => {}
            }

            let Some(entry) = self.caches.get_role(role_id) else {
                missing.push(role_id.clone());
                continue;
            };

            let fresh = entry.is_fresh(ttl);
            match entry.into_value() {
                Some(role) if fresh => roles.push(role),
                Some(role) => expired.push(role),
                None if fresh => {}
                None => missing.push(role_id.clone()),
            }
        }

        if missing.is_empty() && expired.is_empty() {
            return Ok(roles);
        }

        let mut fetch_ids = missing.clone();
        fetch_ids.extend(expired.iter().map(|role| role.id.clone()));

        let fetcher = self.fetcher();
        let token = identity.secret_token().to_string();
        let ids = fetch_ids.clone();
        let waiter = self.role_group.do_chan(identity.secret_token(), move || async move {
            fetcher.fetch_and_cache_roles(&token, &ids).await
        });

        if missing.is_empty() && self.config.down_policy == DownPolicy::AsyncCache {
            roles.extend(expired);
            return Ok(roles);
        }

        let fetched = waiter.await?;
        roles.extend(fetch_ids.iter().filter_map(|id| fetched.get(id).cloned()));
        Ok(roles)
    }
}

impl Fetcher {
    /// Batch reads fail with not-found or permission-denied when the token
    /// used for them is gone or stale. The token's identity is evicted and
    /// the error is tagged with the token so the caller can retry.
    fn identity_error_during_fetch(&self, token: &str, err: &AclError) -> Option<AclError> {
        if err.is_not_found() {
            self.caches.remove_identity(token);
            return Some(AclError::linkage(AclError::NotFound, token));
        }

        if err.is_permission_denied() {
            self.caches.remove_identity(token);
            return Some(AclError::linkage(err.clone(), token));
        }

        None
    }

    pub(super) async fn fetch_and_cache_policies(
        &self,
        token: &str,
        policy_ids: &[String],
    ) -> Result<HashMap<String, Arc<AclPolicy>>> {
        let err = match self.backend.read_policies(token, policy_ids).await {
            Ok(response) => {
                let fetched: HashMap<String, Arc<AclPolicy>> = response
                    .policies
                    .into_iter()
                    .map(|policy| (policy.id.clone(), policy))
                    .collect();

                for policy_id in policy_ids {
                    self.caches
                        .put_policy(policy_id, fetched.get(policy_id).cloned(), response.ttl);
                }
                return Ok(fetched);
            }
            Err(err) => err,
        };

        if let Some(linked) = self.identity_error_during_fetch(token, &err) {
            return Err(linked);
        }

        warn!(error = %err, "Error resolving policies");

        if self.config.down_policy.extends_cache() {
            let mut extended = HashMap::new();
            let mut insufficient = false;

            for policy_id in policy_ids {
                match self.caches.get_policy(policy_id) {
                    Some(entry) => {
                        let policy = entry.value().cloned();
                        self.caches.put_policy(policy_id, policy.clone(), entry.ttl());
                        if let Some(policy) = policy {
                            extended.insert(policy_id.clone(), policy);
                        }
                    }
                    None => insufficient = true,
                }
            }

            if !insufficient {
                return Ok(extended);
            }
        }

        Err(AclError::remote(err))
    }

    pub(super) async fn fetch_and_cache_roles(
        &self,
        token: &str,
        role_ids: &[String],
    ) -> Result<HashMap<String, Arc<AclRole>>> {
        let err = match self.backend.read_roles(token, role_ids).await {
            Ok(response) => {
                let fetched: HashMap<String, Arc<AclRole>> = response
                    .roles
                    .into_iter()
                    .map(|role| (role.id.clone(), role))
                    .collect();

                for role_id in role_ids {
                    self.caches
                        .put_role(role_id, fetched.get(role_id).cloned(), response.ttl);
                }
                return Ok(fetched);
            }
            Err(err) => err,
        };

        if let Some(linked) = self.identity_error_during_fetch(token, &err) {
            return Err(linked);
        }

        warn!(error = %err, "Error resolving roles");

        if self.config.down_policy.extends_cache() {
            let mut extended = HashMap::new();
            let mut insufficient = false;

            for role_id in role_ids {
                match self.caches.get_role(role_id) {
                    Some(entry) => {
                        let role = entry.value().cloned();
                        self.caches.put_role(role_id, role.clone(), entry.ttl());
                        if let Some(role) = role {
                            extended.insert(role_id.clone(), role);
                        }
                    }
                    None => insufficient = true,
                }
            }

            if !insufficient {
                return Ok(extended);
            }
        }

        Err(AclError::remote(err))
    }
}
