//! ACL token resolution for CretoAI
//!
//! Resolves caller tokens to authorizers, filters read results and vets
//! catalog writes:
//! - **Resolver**: token → identity → roles → policies → layered authorizer,
//!   with TTL'd negative and positive caching and coalesced authority reads
//! - **Down policy**: `allow`, `deny`, `extend-cache` or `async-cache` when
//!   the authoritative datacenter cannot be reached
//! - **Filter**: prunes and redacts catalog, health and ACL results
//! - **Vetting**: register, deregister and transaction checks
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cretoai_acl::{AclResolver, AclResolverConfig, Authorizer, InMemoryAuthority};
//!
//! # async fn run() -> cretoai_acl::Result<()> {
//! let authority = Arc::new(InMemoryAuthority::new("dc1"));
//! let resolver = AclResolver::new(AclResolverConfig::new("dc1"), authority)?;
//!
//! if let Some(authz) = resolver.resolve_token("secret").await? {
//!     println!("node:read on web-1 = {}", authz.node_read("web-1"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod authorizer;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod filter;
pub mod memory;
pub mod metrics;
pub mod resolver;
pub mod structs;
pub mod vet;

pub use authorizer::{
    allow_all, deny_all, manage_all, Access, Authorizer, ChainedAuthorizer, EnforcementDecision,
    PolicyAuthorizer, PolicyRules, Resource,
};
pub use cache::{AclCaches, CacheEntry, CacheStats};
pub use config::{AclResolverConfig, CacheSizes, DefaultPolicy, DownPolicy};
pub use error::{AclError, Result};
pub use filter::{AclFilter, FilterSubject, REDACTED_TOKEN};
pub use memory::{AuthorityState, InMemoryAuthority, LegacyToken};
pub use metrics::{AclMetrics, MetricsSnapshot};
pub use resolver::{
    AclResolver, AclResolverBackend, EnterpriseDelegate, LocalLookup, NoEnterpriseDefaults,
    ResolvedToken,
};
pub use vet::{vet_deregister, vet_register, vet_txn_op};
