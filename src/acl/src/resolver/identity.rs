//! Token to identity resolution

use std::sync::Arc;
use tracing::{debug, warn};

use super::{AclResolver, Fetcher, LocalLookup};
use crate::config::DownPolicy;
use crate::error::{AclError, Result};
use crate::structs::AclIdentity;

impl AclResolver {
    /// Identity for `token`, `None` when the token does not exist.
    ///
    /// Authority failures come back wrapped as [`AclError::Remote`] unless
    /// the down policy could answer from cache.
    pub(super) async fn resolve_identity_from_token(
        &self,
        token: &str,
    ) -> Result<Option<Arc<dyn AclIdentity>>> {
        match self.backend.resolve_identity_locally(token) {
            LocalLookup::Found(identity) => return Ok(identity),
            LocalLookup::Failed(err) => return Err(err),
            LocalLookup::Unhandled => {}
        }

        let cached = self.caches.get_identity(token);
        if let Some(entry) = &cached {
            if entry.is_fresh(self.config.token_ttl()) {
                self.metrics.token_cache_hit.inc();
                return Ok(entry.value().cloned());
            }
        }
        self.metrics.token_cache_miss.inc();

        let fetcher = self.fetcher();
        let key = token.to_string();
        let waiter = self.identity_group.do_chan(token, move || async move {
            fetcher.fetch_and_cache_identity(&key).await
        });

        // serve stale, let the fetch refresh the cache behind us
        if self.config.down_policy == DownPolicy::AsyncCache {
            if let Some(entry) = cached {
                debug!("serving stale identity while refreshing");
                return Ok(entry.into_value());
            }
        }

        match waiter.await {
            Ok(identity) => Ok(identity),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) if err.is_permission_denied() => Err(err),
            Err(err) => Err(AclError::remote(err)),
        }
    }
}

impl Fetcher {
    pub(super) async fn fetch_and_cache_identity(
        &self,
        token: &str,
    ) -> Result<Option<Arc<dyn AclIdentity>>> {
        let cached = self.caches.get_identity(token);

        let err = match self.backend.read_token(token).await {
            Ok(response) => {
                let Some(found) = response.token else {
                    self.caches.put_identity(token, None, response.ttl);
                    return Ok(None);
                };

                if found.local && response.source_datacenter != self.config.datacenter {
                    self.caches.remove_identity(token);
                    return Err(AclError::permission_denied(format!(
                        "This is a local token in datacenter {:?}",
                        response.source_datacenter
                    )));
                }

                let identity: Arc<dyn AclIdentity> = found;
                self.caches
                    .put_identity(token, Some(Arc::clone(&identity)), response.ttl);
                return Ok(Some(identity));
            }
            Err(err) => err,
        };

        if err.is_not_found() {
            self.caches.put_identity(token, None, None);
            return Ok(None);
        }

        if self.config.down_policy.extends_cache() {
            if let Some(entry) = cached {
                warn!(error = %err, "Error resolving token, extending cached identity");
                let identity = entry.value().cloned();
                self.caches.put_identity(token, identity.clone(), entry.ttl());
                return Ok(identity);
            }
        }

        self.caches.remove_identity(token);
        Err(err)
    }
}
