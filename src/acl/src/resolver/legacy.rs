//! Legacy token resolution
//!
//! Legacy tokens carry a parent root authorizer and an optional inline rule
//! document. Compiled authorizers are cached per token.

use std::sync::Arc;
use tracing::{error, warn};

use super::{AclResolver, Fetcher, LocalLookup, ResolvedToken};
use crate::authorizer::{
    allow_all, deny_all, root_authorizer, Authorizer, ChainedAuthorizer, PolicyAuthorizer,
};
use crate::cache::CacheEntry;
use crate::config::DownPolicy;
use crate::error::{AclError, Result};
use crate::structs::{content_hash, AclPolicy};

impl AclResolver {
    pub(super) async fn resolve_token_legacy(&self, token: &str) -> Result<ResolvedToken> {
        // local results are compiled directly and never cached
        match self.backend.resolve_identity_locally(token) {
            LocalLookup::Found(Some(identity)) => {
                let policies = self.resolve_policies_for_identity(identity.as_ref()).await?;
                let fetcher = self.fetcher();
                let compiled = fetcher.compile(&policies)?;
                return Ok(ResolvedToken {
                    authorizer: Arc::new(ChainedAuthorizer::new(vec![
                        compiled,
                        fetcher.default_authorizer(),
                    ])),
                    identity: Some(identity),
                });
            }
            LocalLookup::Found(None) => return Err(AclError::NotFound),
            LocalLookup::Failed(err) => return Err(err),
            LocalLookup::Unhandled => {}
        }

        let cached = self.caches.get_authorizer(token);
        if let Some(entry) = &cached {
            if entry.is_fresh(self.config.token_ttl()) {
                self.metrics.token_cache_hit.inc();
                return match entry.value() {
                    Some(authorizer) => Ok(ResolvedToken {
                        authorizer: Arc::clone(authorizer),
                        identity: None,
                    }),
                    None => Err(AclError::NotFound),
                };
            }
        }
        self.metrics.token_cache_miss.inc();

        let fetcher = self.fetcher();
        let key = token.to_string();
        let previous = cached.clone();
        let waiter = self.legacy_group.do_chan(token, move || async move {
            fetcher.fetch_and_cache_token_legacy(&key, previous).await
        });

        if self.config.down_policy == DownPolicy::AsyncCache {
            if let Some(entry) = &cached {
                return match entry.value() {
                    Some(authorizer) => Ok(ResolvedToken {
                        authorizer: Arc::clone(authorizer),
                        identity: None,
                    }),
                    None => Err(AclError::NotFound),
                };
            }
        }

        let authorizer = match waiter.await {
            Ok(authorizer) => authorizer,
            // an upstream "ACL support disabled" report: open the window but
            // still answer this request with the down policy
            Err(err) if err.is_remote() => {
                self.handle_disabled_error(&err);
                self.fetcher().legacy_down_authorizer(cached)
            }
            Err(err) => return Err(err),
        };

        Ok(ResolvedToken {
            authorizer,
            identity: None,
        })
    }
}

impl Fetcher {
    pub(super) async fn fetch_and_cache_token_legacy(
        &self,
        token: &str,
        cached: Option<CacheEntry<Arc<dyn Authorizer>>>,
    ) -> Result<Arc<dyn Authorizer>> {
        let cache_ttl = cached
            .as_ref()
            .and_then(|entry| entry.ttl())
            .unwrap_or_else(|| self.config.token_ttl());

        let err = match self.backend.read_legacy_policy(token).await {
            Ok(response) => {
                let Some(parent) = root_authorizer(&response.parent) else {
                    warn!(parent = %response.parent, "legacy token has an invalid parent");
                    if let Some(entry) = &cached {
                        self.caches
                            .put_authorizer(token, entry.value().cloned(), Some(cache_ttl));
                    }
                    return Err(AclError::InvalidParent);
                };

                let authorizer = match response.rules.filter(|rules| !rules.trim().is_empty()) {
                    Some(rules) => {
                        let hash = content_hash(&rules);
                        let policy = AclPolicy::new(
                            hash.clone(),
                            format!("legacy-policy-{}", hash),
                            rules,
                        );
                        let parsed = self.parse_rules(&policy)?;
                        let compiled: Arc<dyn Authorizer> =
                            Arc::new(PolicyAuthorizer::compile(&[parsed]));
                        Arc::new(ChainedAuthorizer::new(vec![compiled, parent]))
                            as Arc<dyn Authorizer>
                    }
                    None => parent,
                };

                self.caches
                    .put_authorizer(token, Some(Arc::clone(&authorizer)), response.ttl);
                return Ok(authorizer);
            }
            Err(err) => err,
        };

        if err.is_not_found() {
            self.caches.put_authorizer(token, None, Some(cache_ttl));
            return Err(AclError::NotFound);
        }

        error!(
            error = %err,
            datacenter = %self.backend.acl_datacenter(),
            down_policy = %self.config.down_policy,
            "Error resolving legacy token"
        );

        // not cached: the resolver has to see the report to disable ACLs
        if err.is_disabled() {
            return Err(AclError::remote(err));
        }

        let authorizer = self.legacy_down_authorizer(cached);
        self.caches
            .put_authorizer(token, Some(Arc::clone(&authorizer)), Some(cache_ttl));
        Ok(authorizer)
    }

    /// Down policy outcome for a legacy token, given its previous entry
    pub(super) fn legacy_down_authorizer(
        &self,
        cached: Option<CacheEntry<Arc<dyn Authorizer>>>,
    ) -> Arc<dyn Authorizer> {
        self.metrics
            .record_down_policy(self.config.down_policy.as_str());

        match self.config.down_policy {
            DownPolicy::Allow => allow_all(),
            DownPolicy::Deny => deny_all(),
            DownPolicy::ExtendCache | DownPolicy::AsyncCache => cached
                .and_then(|entry| entry.into_value())
                .unwrap_or_else(deny_all),
        }
    }
}
