//! Token resolution tests
//!
//! Drives the resolver against the in-memory authority: caching, request
//! coalescing, the down-policy matrix, link resolution and the retry
//! protocol.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use cretoai_acl::{
    allow_all,
    structs::{
        AclIdentity, AclPolicy, AclRole, AclToken, ServiceIdentity, AGENT_RECOVERY_TOKEN_ID,
        ANONYMOUS_TOKEN_ID, ANONYMOUS_TOKEN_SECRET, SERVER_MANAGEMENT_TOKEN_ID,
    },
    AclError, AclResolver, AclResolverBackend, AclResolverConfig, Authorizer, DefaultPolicy,
    DownPolicy, EnforcementDecision, EnterpriseDelegate, InMemoryAuthority,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const NODE_WEB_WRITE: &str = r#"{ "node": { "web-1": { "policy": "write" } } }"#;
const NODE_WEB_DENY: &str = r#"{ "node": { "web-1": { "policy": "deny" } } }"#;

fn config(down_policy: DownPolicy) -> AclResolverConfig {
    let mut config = AclResolverConfig::new("dc1");
    config.down_policy = down_policy;
    config.default_policy = DefaultPolicy::Deny;
    config
}

fn build(config: AclResolverConfig) -> (Arc<InMemoryAuthority>, AclResolver) {
    let authority = Arc::new(InMemoryAuthority::new(config.datacenter.clone()));
    let backend: Arc<dyn AclResolverBackend> = authority.clone();
    let resolver = AclResolver::new(config, backend).unwrap();
    (authority, resolver)
}

/// Token `s1` linked to policy `p1` granting write on node web-1.
fn seed_web_writer(authority: &InMemoryAuthority) {
    authority.insert_policy(AclPolicy::new("p1", "web-writer", NODE_WEB_WRITE));
    authority.insert_token(AclToken::new("a1", "s1").with_policy("p1"));
}

async fn authorizer(resolver: &AclResolver, token: &str) -> Arc<dyn Authorizer> {
    resolver
        .resolve_token(token)
        .await
        .expect("resolution failed")
        .expect("ACLs unexpectedly disabled")
}

// ============================================================================
// BASIC RESOLUTION
// ============================================================================

#[tokio::test]
async fn test_resolve_token_with_linked_policy() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_write("web-1"), EnforcementDecision::Allow);
    assert_eq!(authz.node_read("db-1"), EnforcementDecision::Deny);
    assert_eq!(authz.acl_read(), EnforcementDecision::Deny);
}

#[tokio::test]
async fn test_default_policy_allow_fills_gaps() {
    let mut config = config(DownPolicy::ExtendCache);
    config.default_policy = DefaultPolicy::Allow;
    let (authority, resolver) = build(config);
    authority.insert_policy(AclPolicy::new("p1", "no-web", NODE_WEB_DENY));
    authority.insert_token(AclToken::new("a1", "s1").with_policy("p1"));

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_read("web-1"), EnforcementDecision::Deny);
    assert_eq!(authz.node_read("db-1"), EnforcementDecision::Allow);
    // allow never extends to ACL management
    assert_eq!(authz.acl_write(), EnforcementDecision::Deny);
}

#[tokio::test]
async fn test_resolve_through_roles() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    authority.insert_policy(AclPolicy::new("p1", "web-writer", NODE_WEB_WRITE));
    authority.insert_role(AclRole::new("r1", "web-ops").with_policy("p1"));
    authority.insert_token(AclToken::new("a1", "s1").with_role("r1"));

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_write("web-1"), EnforcementDecision::Allow);

    let (identity, roles) = resolver.resolve_token_to_identity_and_roles("s1").await.unwrap();
    assert_eq!(identity.id(), "a1");
    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0].id, "r1");
}

#[tokio::test]
async fn test_root_names_rejected_without_lookup() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));

    for name in ["allow", "deny", "manage"] {
        let err = resolver.resolve_token(name).await.unwrap_err();
        assert_eq!(err, AclError::RootDenied);
    }
    assert_eq!(authority.read_token_calls(), 0);
}

#[tokio::test]
async fn test_empty_token_resolves_anonymous() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    authority.insert_policy(AclPolicy::new(
        "p-anon",
        "anonymous-read",
        r#"{ "node_prefix": { "": { "policy": "read" } } }"#,
    ));
    authority.insert_token(AclToken::new(ANONYMOUS_TOKEN_ID, ANONYMOUS_TOKEN_SECRET).with_policy("p-anon"));

    let resolved = resolver.resolve_token_with_identity("").await.unwrap().unwrap();
    assert_eq!(resolved.accessor_id(), "anonymous token");
    assert_eq!(resolved.authorizer.node_read("anything"), EnforcementDecision::Allow);
    assert_eq!(resolved.authorizer.node_write("anything"), EnforcementDecision::Deny);
}

#[tokio::test]
async fn test_expired_token_is_not_found() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    let mut token = AclToken::new("a1", "s1").with_policy("p1");
    token.expiration_time = Some(Utc::now() - ChronoDuration::minutes(5));
    authority.insert_token(token);

    assert_eq!(resolver.resolve_token("s1").await.unwrap_err(), AclError::NotFound);
}

#[tokio::test]
async fn test_embedded_policy_used_without_links() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    let mut token = AclToken::new("a1", "s1");
    token.rules = r#"{ "key_prefix": { "app/": { "policy": "write" } } }"#.to_string();
    authority.insert_token(token);

    let (_, policies) = resolver.resolve_token_to_identity_and_policies("s1").await.unwrap();
    assert_eq!(policies.len(), 1);
    assert!(policies[0].name.starts_with("legacy-policy-"));

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.key_write("app/config"), EnforcementDecision::Allow);
    assert_eq!(authz.key_write("other/config"), EnforcementDecision::Deny);
    assert_eq!(authority.read_policies_calls(), 0);
}

#[tokio::test]
async fn test_compile_error_is_terminal() {
    // even fail-open down policies never mask malformed policy data
    let (authority, resolver) = build(config(DownPolicy::Allow));
    authority.insert_policy(AclPolicy::new("p1", "broken", "{ not json"));
    authority.insert_token(AclToken::new("a1", "s1").with_policy("p1"));

    let err = resolver.resolve_token("s1").await.unwrap_err();
    assert!(matches!(err, AclError::Compile { ref policy, .. } if policy == "broken"));
}

#[tokio::test]
async fn test_local_token_from_other_datacenter_rejected() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    let mut token = AclToken::new("a1", "s1");
    token.local = true;
    authority.insert_token(token);
    authority.set_source_datacenter("dc2");

    let err = resolver.resolve_token("s1").await.unwrap_err();
    assert!(err.is_permission_denied());
    assert!(resolver.caches().get_identity("s1").is_none());
}

#[tokio::test]
async fn test_authoritative_lookups_bypass_cache() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);
    authority.set_authoritative(true);

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_write("web-1"), EnforcementDecision::Allow);
    assert_eq!(authority.read_token_calls(), 0);
    assert_eq!(authority.read_policies_calls(), 0);

    let stats = resolver.caches().stats();
    assert_eq!(stats.identities, 0);
    assert_eq!(stats.policies, 0);
}

// ============================================================================
// LOCALLY MANAGED TOKENS
// ============================================================================

#[tokio::test]
async fn test_agent_recovery_token() {
    let mut config = config(DownPolicy::ExtendCache);
    config.node_name = "agent-1".to_string();
    config.agent_recovery_token = Some("recovery-secret".to_string());
    let (authority, resolver) = build(config);

    let resolved = resolver
        .resolve_token_with_identity("recovery-secret")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.identity.unwrap().id(), AGENT_RECOVERY_TOKEN_ID);
    assert_eq!(resolved.authorizer.agent_write("agent-1"), EnforcementDecision::Allow);
    assert_eq!(resolved.authorizer.agent_write("agent-2"), EnforcementDecision::Deny);
    assert_eq!(resolved.authorizer.node_read("any-node"), EnforcementDecision::Allow);
    assert_eq!(resolved.authorizer.service_read("web"), EnforcementDecision::Deny);
    assert_eq!(authority.read_token_calls(), 0);
}

#[tokio::test]
async fn test_server_management_token() {
    let (authority, resolver) = build(config(DownPolicy::Deny));
    authority.set_server_token("server-secret");
    authority.set_unreachable(true);

    let resolved = resolver
        .resolve_token_with_identity("server-secret")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.identity.unwrap().id(), SERVER_MANAGEMENT_TOKEN_ID);
    assert_eq!(resolved.authorizer.acl_write(), EnforcementDecision::Allow);
    assert_eq!(authority.read_token_calls(), 0);
}

// ============================================================================
// CACHING
// ============================================================================

#[tokio::test]
async fn test_negative_caching_single_fetch() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));

    for _ in 0..3 {
        let err = resolver.resolve_token("unknown").await.unwrap_err();
        assert_eq!(err, AclError::NotFound);
    }
    assert_eq!(authority.read_token_calls(), 1);
    assert!(resolver.caches().get_identity("unknown").unwrap().is_negative());
}

#[tokio::test]
async fn test_missing_policy_cached_negatively() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    authority.insert_token(AclToken::new("a1", "s1").with_policy("p-gone"));

    for _ in 0..2 {
        let authz = authorizer(&resolver, "s1").await;
        assert_eq!(authz.node_read("web-1"), EnforcementDecision::Deny);
    }
    assert_eq!(authority.read_policies_calls(), 1);
    assert!(resolver.caches().get_policy("p-gone").unwrap().is_negative());
}

#[tokio::test]
async fn test_cache_hits_counted() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);

    authorizer(&resolver, "s1").await;
    authorizer(&resolver, "s1").await;

    let snapshot = resolver.metrics().snapshot();
    assert_eq!(snapshot.token_cache_misses, 1);
    assert_eq!(snapshot.token_cache_hits, 1);
    assert_eq!(snapshot.resolutions, 2);
    assert_eq!(authority.read_token_calls(), 1);
    assert_eq!(authority.read_policies_calls(), 1);
}

#[tokio::test]
async fn test_local_ttl_bounds_authority_ttl() {
    let mut config = config(DownPolicy::ExtendCache);
    config.token_ttl_ms = 100;
    let (authority, resolver) = build(config);
    seed_web_writer(&authority);
    authority.set_response_ttl(Some(Duration::from_secs(10)));

    authorizer(&resolver, "s1").await;
    authorizer(&resolver, "s1").await;
    assert_eq!(authority.read_token_calls(), 1);

    sleep(Duration::from_millis(150)).await;
    authorizer(&resolver, "s1").await;
    assert_eq!(authority.read_token_calls(), 2);
}

#[tokio::test]
async fn test_authority_ttl_shortens_freshness() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);
    authority.set_response_ttl(Some(Duration::from_millis(50)));

    authorizer(&resolver, "s1").await;
    sleep(Duration::from_millis(100)).await;
    authorizer(&resolver, "s1").await;
    assert_eq!(authority.read_token_calls(), 2);
}

#[tokio::test]
async fn test_invalidate_token_forces_refetch() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);

    authorizer(&resolver, "s1").await;
    authority.remove_token("s1");
    resolver.invalidate_token("s1");

    assert_eq!(resolver.resolve_token("s1").await.unwrap_err(), AclError::NotFound);
    assert_eq!(authority.read_token_calls(), 2);
}

#[tokio::test]
async fn test_invalidate_policy_picks_up_new_rules() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);

    let before = authorizer(&resolver, "s1").await;
    assert_eq!(before.node_write("web-1"), EnforcementDecision::Allow);

    authority.insert_policy(AclPolicy::new("p1", "web-writer", NODE_WEB_DENY));
    resolver.invalidate_policy("p1");

    let after = authorizer(&resolver, "s1").await;
    assert_eq!(after.node_write("web-1"), EnforcementDecision::Deny);
    // previously handed out authorizers are immutable
    assert_eq!(before.node_write("web-1"), EnforcementDecision::Allow);
}

#[tokio::test]
async fn test_invalidate_role_picks_up_new_links() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    authority.insert_policy(AclPolicy::new("p1", "web-writer", NODE_WEB_WRITE));
    authority.insert_role(AclRole::new("r1", "web-ops").with_policy("p1"));
    authority.insert_token(AclToken::new("a1", "s1").with_role("r1"));

    assert_eq!(authorizer(&resolver, "s1").await.node_write("web-1"), EnforcementDecision::Allow);

    authority.insert_role(AclRole::new("r1", "web-ops"));
    resolver.invalidate_role("r1");

    assert_eq!(authorizer(&resolver, "s1").await.node_write("web-1"), EnforcementDecision::Deny);
    assert_eq!(authority.read_roles_calls(), 2);
}

// ============================================================================
// COALESCING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolutions_share_one_fetch() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);
    authority.set_latency(Some(Duration::from_millis(50)));
    let resolver = Arc::new(resolver);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let resolver = Arc::clone(&resolver);
        handles.push(tokio::spawn(async move {
            resolver.resolve_token("s1").await.map(|authz| authz.map(|a| a.node_write("web-1")))
        }));
    }

    for handle in handles {
        let decision = handle.await.unwrap().unwrap();
        assert_eq!(decision, Some(EnforcementDecision::Allow));
    }
    assert_eq!(authority.read_token_calls(), 1);
    assert_eq!(authority.read_policies_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unknown_token_single_fetch() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    authority.set_latency(Some(Duration::from_millis(50)));
    let resolver = Arc::new(resolver);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let resolver = Arc::clone(&resolver);
        handles.push(tokio::spawn(async move { resolver.resolve_token("ghost").await }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap_err(), AclError::NotFound);
    }
    assert_eq!(authority.read_token_calls(), 1);
}

// ============================================================================
// DOWN POLICY
// ============================================================================

#[tokio::test]
async fn test_down_deny_without_cache_yields_deny_all() {
    let (authority, resolver) = build(config(DownPolicy::Deny));
    authority.set_unreachable(true);

    let resolved = resolver.resolve_token_with_identity("s1").await.unwrap().unwrap();
    assert_eq!(resolved.authorizer.node_read("web-1"), EnforcementDecision::Deny);
    assert_eq!(resolved.authorizer.service_read("web"), EnforcementDecision::Deny);

    let identity = resolved.identity.unwrap();
    assert_eq!(identity.id(), "primary-dc-down");
    assert_eq!(identity.secret_token(), "s1");
    assert_eq!(resolver.metrics().snapshot().down_policy_applied, 1);
}

#[tokio::test]
async fn test_down_allow_yields_allow_all() {
    let (authority, resolver) = build(config(DownPolicy::Allow));
    authority.set_unreachable(true);

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_write("web-1"), EnforcementDecision::Allow);
    assert_eq!(authz.key_write("anything"), EnforcementDecision::Allow);
    assert_eq!(authz.acl_write(), EnforcementDecision::Deny);
}

#[tokio::test]
async fn test_down_extend_cache_serves_previous_answer() {
    let mut config = config(DownPolicy::ExtendCache);
    config.token_ttl_ms = 50;
    config.policy_ttl_ms = 50;
    let (authority, resolver) = build(config);
    seed_web_writer(&authority);

    let primed = authorizer(&resolver, "s1").await;
    assert_eq!(primed.node_write("web-1"), EnforcementDecision::Allow);

    sleep(Duration::from_millis(100)).await;
    authority.set_unreachable(true);

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_write("web-1"), EnforcementDecision::Allow);
    assert_eq!(authz.node_read("db-1"), EnforcementDecision::Deny);
    assert_eq!(authority.read_token_calls(), 2);
    assert_eq!(authority.read_policies_calls(), 2);
    assert_eq!(resolver.metrics().snapshot().down_policy_applied, 0);
}

#[tokio::test]
async fn test_down_extend_cache_without_cache_denies() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    authority.set_unreachable(true);

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_read("web-1"), EnforcementDecision::Deny);
    // transient failures are not cached as "not found"
    assert!(resolver.caches().get_identity("s1").is_none());
}

#[tokio::test]
async fn test_down_policy_applies_at_policy_layer() {
    let (authority, resolver) = build(config(DownPolicy::Deny));
    seed_web_writer(&authority);
    authority.inject_policy_error(Some(AclError::Transport("connection reset".into())));

    let resolved = resolver.resolve_token_with_identity("s1").await.unwrap().unwrap();
    assert_eq!(resolved.identity.unwrap().id(), "primary-dc-down");
    assert_eq!(resolved.authorizer.node_write("web-1"), EnforcementDecision::Deny);
    assert!(resolver.caches().get_policy("p1").is_none());
}

#[tokio::test]
async fn test_async_cache_returns_stale_without_waiting() {
    let mut config = config(DownPolicy::AsyncCache);
    config.token_ttl_ms = 400;
    config.policy_ttl_ms = 400;
    let (authority, resolver) = build(config);
    seed_web_writer(&authority);

    authorizer(&resolver, "s1").await;
    sleep(Duration::from_millis(450)).await;

    authority.insert_policy(AclPolicy::new("p1", "web-writer", NODE_WEB_DENY));
    authority.set_latency(Some(Duration::from_millis(250)));

    let started = Instant::now();
    let stale = authorizer(&resolver, "s1").await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(stale.node_write("web-1"), EnforcementDecision::Allow);

    // background refreshes land in the cache
    sleep(Duration::from_millis(400)).await;
    let fresh = authorizer(&resolver, "s1").await;
    assert_eq!(fresh.node_write("web-1"), EnforcementDecision::Deny);
    assert_eq!(authority.read_token_calls(), 2);
}

#[tokio::test]
async fn test_async_cache_without_entry_waits() {
    let (authority, resolver) = build(config(DownPolicy::AsyncCache));
    seed_web_writer(&authority);
    authority.set_latency(Some(Duration::from_millis(50)));

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_write("web-1"), EnforcementDecision::Allow);
}

// ============================================================================
// LINK RESOLUTION
// ============================================================================

#[tokio::test]
async fn test_policies_scoped_to_other_datacenter_excluded() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    let mut scoped = AclPolicy::new("p-dc2", "dc2-only", NODE_WEB_WRITE);
    scoped.datacenters = vec!["dc2".to_string()];
    authority.insert_policy(scoped);
    authority.insert_policy(AclPolicy::new(
        "p-global",
        "global",
        r#"{ "service": { "web": { "policy": "read" } } }"#,
    ));
    authority.insert_token(AclToken::new("a1", "s1").with_policy("p-dc2").with_policy("p-global"));

    let (_, policies) = resolver.resolve_token_to_identity_and_policies("s1").await.unwrap();
    let ids: Vec<&str> = policies.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p-global"]);

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_write("web-1"), EnforcementDecision::Deny);
    assert_eq!(authz.service_read("web"), EnforcementDecision::Allow);
}

#[tokio::test]
async fn test_service_identity_dedup_widens_scope() {
    let mut config = config(DownPolicy::ExtendCache);
    config.datacenter = "dc2".to_string();
    let (authority, resolver) = build(config);

    authority.insert_role(
        AclRole::new("r1", "scoped").with_service_identity(ServiceIdentity::scoped("web", &["dc1"])),
    );
    authority.insert_role(AclRole::new("r2", "unscoped").with_service_identity(ServiceIdentity::new("web")));
    authority.insert_token(AclToken::new("a1", "s1").with_role("r1").with_role("r2"));

    let (_, policies) = resolver.resolve_token_to_identity_and_policies("s1").await.unwrap();
    assert_eq!(policies.len(), 1);
    assert!(policies[0].name.starts_with("synthetic-policy-"));
    assert!(policies[0].datacenters.is_empty());

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.service_write("web"), EnforcementDecision::Allow);
    assert_eq!(authz.service_write("web-sidecar-proxy"), EnforcementDecision::Allow);
    assert_eq!(authz.service_read("db"), EnforcementDecision::Allow);
    assert_eq!(authz.service_write("db"), EnforcementDecision::Deny);
}

#[tokio::test]
async fn test_node_identity_scoped_to_its_datacenter() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    authority.insert_token(
        AclToken::new("a1", "s1")
            .with_node_identity("web-1", "dc1")
            .with_node_identity("web-2", "dc2"),
    );

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_write("web-1"), EnforcementDecision::Allow);
    assert_eq!(authz.node_write("web-2"), EnforcementDecision::Deny);
    assert_eq!(authz.service_read("anything"), EnforcementDecision::Allow);
}

#[tokio::test]
async fn test_role_and_token_policy_links_deduplicated() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    authority.insert_policy(AclPolicy::new("p1", "web-writer", NODE_WEB_WRITE));
    authority.insert_role(AclRole::new("r1", "ops").with_policy("p1"));
    authority.insert_token(AclToken::new("a1", "s1").with_policy("p1").with_role("r1"));

    let (_, policies) = resolver.resolve_token_to_identity_and_policies("s1").await.unwrap();
    assert_eq!(policies.len(), 1);
}

// ============================================================================
// RETRY PROTOCOL
// ============================================================================

#[tokio::test]
async fn test_deleted_token_terminates_without_retry() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);

    // cache the identity, then delete the token before its policies are read
    resolver.resolve_token_to_identity_and_roles("s1").await.unwrap();
    authority.remove_token("s1");

    let err = resolver
        .resolve_token_to_identity_and_policies("s1")
        .await
        .unwrap_err();
    assert_eq!(err, AclError::NotFound);
    assert_eq!(authority.read_token_calls(), 1);
    assert_eq!(authority.read_policies_calls(), 1);
    assert!(resolver.caches().get_identity("s1").is_none());
}

#[tokio::test]
async fn test_linkage_errors_retry_up_to_bound() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    seed_web_writer(&authority);
    authority.inject_policy_error(Some(AclError::permission_denied("stale token view")));

    let err = resolver
        .resolve_token_to_identity_and_policies("s1")
        .await
        .unwrap_err();
    assert!(err.is_permission_denied());
    assert_eq!(err.linkage_token(), Some("s1"));
    assert_eq!(authority.read_token_calls(), 5);
    assert_eq!(authority.read_policies_calls(), 5);
}

#[tokio::test]
async fn test_role_retries_are_independent_and_configurable() {
    let mut config = config(DownPolicy::ExtendCache);
    config.role_resolution_max_retries = 2;
    let (authority, resolver) = build(config);
    authority.insert_role(AclRole::new("r1", "ops"));
    authority.insert_token(AclToken::new("a1", "s1").with_role("r1"));
    authority.inject_role_error(Some(AclError::permission_denied("stale token view")));

    let err = resolver
        .resolve_token_to_identity_and_roles("s1")
        .await
        .unwrap_err();
    assert!(err.is_permission_denied());
    assert_eq!(authority.read_roles_calls(), 2);
}

#[tokio::test]
async fn test_linkage_errors_surface_from_resolve_token() {
    let (authority, resolver) = build(config(DownPolicy::Allow));
    seed_web_writer(&authority);
    authority.inject_policy_error(Some(AclError::permission_denied("stale token view")));

    // terminal, so the fail-open down policy does not apply
    let err = resolver.resolve_token("s1").await.unwrap_err();
    assert!(err.is_permission_denied());
}

// ============================================================================
// ENTERPRISE DEFAULTS
// ============================================================================

struct StaticDefaults(cretoai_acl::Result<Option<Arc<dyn Authorizer>>>);

#[async_trait]
impl EnterpriseDelegate for StaticDefaults {
    async fn resolve_defaults_for_identity(
        &self,
        _identity: &dyn AclIdentity,
    ) -> cretoai_acl::Result<Option<Arc<dyn Authorizer>>> {
        self.0.clone()
    }
}

#[tokio::test]
async fn test_enterprise_defaults_layer_between_policies_and_default() {
    let (authority, resolver) = build(config(DownPolicy::ExtendCache));
    let resolver = resolver.with_enterprise(Arc::new(StaticDefaults(Ok(Some(allow_all())))));
    authority.insert_policy(AclPolicy::new("p1", "no-web", NODE_WEB_DENY));
    authority.insert_token(AclToken::new("a1", "s1").with_policy("p1"));

    let authz = authorizer(&resolver, "s1").await;
    assert_eq!(authz.node_read("web-1"), EnforcementDecision::Deny);
    assert_eq!(authz.node_read("db-1"), EnforcementDecision::Allow);
}

#[tokio::test]
async fn test_enterprise_remote_failure_uses_down_policy() {
    let (authority, resolver) = build(config(DownPolicy::Deny));
    let resolver = resolver.with_enterprise(Arc::new(StaticDefaults(Err(AclError::remote(
        AclError::Transport("partition unreachable".into()),
    )))));
    seed_web_writer(&authority);

    let resolved = resolver.resolve_token_with_identity("s1").await.unwrap().unwrap();
    assert_eq!(resolved.identity.unwrap().id(), "a1");
    assert_eq!(resolved.authorizer.node_write("web-1"), EnforcementDecision::Deny);
}

// ============================================================================
// PROPERTY-BASED TESTS (PROPTEST)
// ============================================================================

proptest! {
    #[test]
    fn test_cached_resolution_is_deterministic(
        suffix in "[a-z0-9/]{1,16}",
        other in "[b-z][a-z0-9]{0,8}/[a-z0-9]{0,8}"
    ) {
        tokio_test::block_on(async {
            let (authority, resolver) = build(config(DownPolicy::ExtendCache));
            authority.insert_policy(AclPolicy::new(
                "p1",
                "app-writer",
                r#"{ "key_prefix": { "app/": { "policy": "write" } } }"#,
            ));
            authority.insert_token(AclToken::new("a1", "s1").with_policy("p1"));

            let first = authorizer(&resolver, "s1").await;
            let second = authorizer(&resolver, "s1").await;
            let key = format!("app/{}", suffix);

            assert_eq!(first.key_write(&key), EnforcementDecision::Allow);
            assert_eq!(first.key_write(&key), second.key_write(&key));
            assert_eq!(first.key_read(&other), EnforcementDecision::Deny,
                       "keys outside the prefix fall through to the default");
            assert_eq!(authority.read_token_calls(), 1);
        });
    }
}
