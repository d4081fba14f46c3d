//! TTL'd caches for identities, policies, roles and compiled authorizers

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::authorizer::{Authorizer, PolicyRules};
use crate::config::CacheSizes;
use crate::structs::{AclIdentity, AclPolicy, AclRole};

/// Cached lookup result
///
/// A `None` value is a negative entry: the authority said the object does
/// not exist.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    value: Option<T>,
    ttl: Option<Duration>,
    created: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: Option<T>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            ttl,
            created: Instant::now(),
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    pub fn is_negative(&self) -> bool {
        self.value.is_none()
    }

    /// TTL assigned by the authority, if any
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Freshness bound: the authority TTL can shorten but never extend the
    /// local ceiling.
    pub fn effective_ttl(&self, local_ttl: Duration) -> Duration {
        match self.ttl {
            Some(ttl) => ttl.min(local_ttl),
            None => local_ttl,
        }
    }

    pub fn is_fresh(&self, local_ttl: Duration) -> bool {
        self.age() <= self.effective_ttl(local_ttl)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(created) = self.created.checked_sub(by) {
            self.created = created;
        }
    }
}

type Map<T> = DashMap<String, CacheEntry<T>>;

fn put<T>(map: &Map<T>, capacity: usize, key: &str, entry: CacheEntry<T>) -> usize {
    let mut evicted = 0;
    if !map.contains_key(key) && map.len() >= capacity {
        evicted = evict_oldest(map, capacity);
    }
    map.insert(key.to_string(), entry);
    evicted
}

/// Evict the oldest tenth of entries (at least one).
fn evict_oldest<T>(map: &Map<T>, capacity: usize) -> usize {
    let to_remove = (capacity / 10).max(1);

    let mut ages: Vec<(String, Instant)> = map
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().created))
        .collect();
    ages.sort_by_key(|(_, created)| *created);

    let mut removed = 0;
    for (key, _) in ages.into_iter().take(to_remove) {
        if map.remove(&key).is_some() {
            removed += 1;
        }
    }
    removed
}

fn get<T: Clone>(map: &Map<T>, key: &str) -> Option<CacheEntry<T>> {
    map.get(key).map(|entry| entry.value().clone())
}

/// Resolver caches
///
/// Each map is guarded per shard, so unrelated keys never serialize against
/// each other and no lock is held across an authority fetch. Once closed,
/// writes are dropped so fetches still in flight cannot refill the maps.
pub struct AclCaches {
    identities: Map<Arc<dyn AclIdentity>>,
    policies: Map<Arc<AclPolicy>>,
    parsed_policies: Map<Arc<PolicyRules>>,
    authorizers: Map<Arc<dyn Authorizer>>,
    roles: Map<Arc<AclRole>>,
    sizes: CacheSizes,
    stats: DashMap<String, usize>,
    closed: AtomicBool,
}

impl AclCaches {
    pub fn new(sizes: CacheSizes) -> Self {
        Self {
            identities: DashMap::new(),
            policies: DashMap::new(),
            parsed_policies: DashMap::new(),
            authorizers: DashMap::new(),
            roles: DashMap::new(),
            sizes,
            stats: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Identity by secret token
    pub fn get_identity(&self, secret: &str) -> Option<CacheEntry<Arc<dyn AclIdentity>>> {
        get(&self.identities, secret)
    }

    pub fn put_identity(
        &self,
        secret: &str,
        identity: Option<Arc<dyn AclIdentity>>,
        ttl: Option<Duration>,
    ) {
        if self.is_closed() {
            return;
        }
        let evicted = put(
            &self.identities,
            self.sizes.identities,
            secret,
            CacheEntry::new(identity, ttl),
        );
        self.record_evictions(evicted);
    }

    pub fn remove_identity(&self, secret: &str) {
        self.identities.remove(secret);
    }

    pub fn get_policy(&self, policy_id: &str) -> Option<CacheEntry<Arc<AclPolicy>>> {
        get(&self.policies, policy_id)
    }

    pub fn put_policy(&self, policy_id: &str, policy: Option<Arc<AclPolicy>>, ttl: Option<Duration>) {
        if self.is_closed() {
            return;
        }
        let evicted = put(
            &self.policies,
            self.sizes.policies,
            policy_id,
            CacheEntry::new(policy, ttl),
        );
        self.record_evictions(evicted);
    }

    pub fn remove_policy(&self, policy_id: &str) {
        self.policies.remove(policy_id);
    }

    pub fn get_role(&self, role_id: &str) -> Option<CacheEntry<Arc<AclRole>>> {
        get(&self.roles, role_id)
    }

    pub fn put_role(&self, role_id: &str, role: Option<Arc<AclRole>>, ttl: Option<Duration>) {
        if self.is_closed() {
            return;
        }
        let evicted = put(&self.roles, self.sizes.roles, role_id, CacheEntry::new(role, ttl));
        self.record_evictions(evicted);
    }

    pub fn remove_role(&self, role_id: &str) {
        self.roles.remove(role_id);
    }

    /// Parsed rules by content hash; content-addressed entries never expire
    pub fn get_parsed_policy(&self, hash: &str) -> Option<Arc<PolicyRules>> {
        self.parsed_policies
            .get(hash)
            .and_then(|entry| entry.value().value().cloned())
    }

    pub fn put_parsed_policy(&self, hash: &str, rules: Arc<PolicyRules>) {
        if self.is_closed() {
            return;
        }
        let evicted = put(
            &self.parsed_policies,
            self.sizes.parsed_policies,
            hash,
            CacheEntry::new(Some(rules), None),
        );
        self.record_evictions(evicted);
    }

    /// Compiled authorizer by token (legacy resolution)
    pub fn get_authorizer(&self, token: &str) -> Option<CacheEntry<Arc<dyn Authorizer>>> {
        get(&self.authorizers, token)
    }

    pub fn put_authorizer(
        &self,
        token: &str,
        authorizer: Option<Arc<dyn Authorizer>>,
        ttl: Option<Duration>,
    ) {
        if self.is_closed() {
            return;
        }
        let evicted = put(
            &self.authorizers,
            self.sizes.authorizers,
            token,
            CacheEntry::new(authorizer, ttl),
        );
        self.record_evictions(evicted);
    }

    pub fn remove_authorizer(&self, token: &str) {
        self.authorizers.remove(token);
    }

    /// Purge and stop accepting writes for good.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.purge();
    }

    /// Drop every entry.
    pub fn purge(&self) {
        self.identities.clear();
        self.policies.clear();
        self.parsed_policies.clear();
        self.authorizers.clear();
        self.roles.clear();
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            identities: self.identities.len(),
            policies: self.policies.len(),
            parsed_policies: self.parsed_policies.len(),
            authorizers: self.authorizers.len(),
            roles: self.roles.len(),
            evictions: self.stats.get("evictions").map(|v| *v).unwrap_or(0),
        }
    }

    fn record_evictions(&self, evicted: usize) {
        if evicted == 0 {
            return;
        }
        self.stats
            .entry("evictions".to_string())
            .and_modify(|count| *count += evicted)
            .or_insert(evicted);
    }

    #[cfg(test)]
    pub(crate) fn backdate_identity(&self, secret: &str, by: Duration) {
        if let Some(mut entry) = self.identities.get_mut(secret) {
            entry.backdate(by);
        }
    }
}

impl std::fmt::Debug for AclCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclCaches").field("stats", &self.stats()).finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub identities: usize,
    pub policies: usize,
    pub parsed_policies: usize,
    pub authorizers: usize,
    pub roles: usize,
    pub evictions: usize,
}
