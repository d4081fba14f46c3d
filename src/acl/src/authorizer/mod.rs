//! Decision surfaces consulted before revealing or mutating cluster state
//!
//! Every authorizer answers `enforce(resource, segment, access)` with a
//! three-valued [`EnforcementDecision`]. `Default` means "no rule matched" and
//! lets a [`ChainedAuthorizer`] defer to its next layer.

mod chained;
mod policy;
mod rules;
mod static_authz;

pub use chained::ChainedAuthorizer;
pub use policy::PolicyAuthorizer;
pub use rules::{AccessLevel, PolicyRules, SegmentRule, ServiceRule};
pub use static_authz::{
    agent_recovery_authorizer, allow_all, deny_all, manage_all, root_authorizer,
    StaticAuthorizer, ROOT_AUTHORIZER_NAMES,
};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AclError, Result};

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnforcementDecision {
    Deny,
    Allow,
    /// No rule matched; defer to the next layer
    Default,
}

impl EnforcementDecision {
    pub fn is_allow(self) -> bool {
        self == EnforcementDecision::Allow
    }
}

impl fmt::Display for EnforcementDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementDecision::Deny => write!(f, "Deny"),
            EnforcementDecision::Allow => write!(f, "Allow"),
            EnforcementDecision::Default => write!(f, "Default"),
        }
    }
}

/// Resource families rules can grant access to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Acl,
    Agent,
    Event,
    Intention,
    Key,
    Keyring,
    Mesh,
    Node,
    Operator,
    Query,
    Service,
    Session,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Acl => "acl",
            Resource::Agent => "agent",
            Resource::Event => "event",
            Resource::Intention => "intention",
            Resource::Key => "key",
            Resource::Keyring => "keyring",
            Resource::Mesh => "mesh",
            Resource::Node => "node",
            Resource::Operator => "operator",
            Resource::Query => "query",
            Resource::Service => "service",
            Resource::Session => "session",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    List,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::List => write!(f, "list"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Decision surface. Implementations are immutable and shared across
/// requests.
pub trait Authorizer: Send + Sync + fmt::Debug {
    /// Decide `access` on `segment` of `resource`. Segment-less resources
    /// (acl, keyring, mesh, operator) ignore the segment.
    fn enforce(&self, resource: Resource, segment: &str, access: Access) -> EnforcementDecision;

    /// Write access to every key under `prefix`
    fn key_write_prefix(&self, prefix: &str) -> EnforcementDecision;

    /// Whether intentions default to allow when none match
    fn intention_default_allow(&self) -> EnforcementDecision;

    fn acl_read(&self) -> EnforcementDecision {
        self.enforce(Resource::Acl, "", Access::Read)
    }

    fn acl_write(&self) -> EnforcementDecision {
        self.enforce(Resource::Acl, "", Access::Write)
    }

    fn agent_read(&self, node: &str) -> EnforcementDecision {
        self.enforce(Resource::Agent, node, Access::Read)
    }

    fn agent_write(&self, node: &str) -> EnforcementDecision {
        self.enforce(Resource::Agent, node, Access::Write)
    }

    fn event_read(&self, name: &str) -> EnforcementDecision {
        self.enforce(Resource::Event, name, Access::Read)
    }

    fn event_write(&self, name: &str) -> EnforcementDecision {
        self.enforce(Resource::Event, name, Access::Write)
    }

    fn intention_read(&self, prefix: &str) -> EnforcementDecision {
        self.enforce(Resource::Intention, prefix, Access::Read)
    }

    fn intention_write(&self, prefix: &str) -> EnforcementDecision {
        self.enforce(Resource::Intention, prefix, Access::Write)
    }

    fn key_read(&self, key: &str) -> EnforcementDecision {
        self.enforce(Resource::Key, key, Access::Read)
    }

    fn key_list(&self, key: &str) -> EnforcementDecision {
        self.enforce(Resource::Key, key, Access::List)
    }

    fn key_write(&self, key: &str) -> EnforcementDecision {
        self.enforce(Resource::Key, key, Access::Write)
    }

    fn keyring_read(&self) -> EnforcementDecision {
        self.enforce(Resource::Keyring, "", Access::Read)
    }

    fn keyring_write(&self) -> EnforcementDecision {
        self.enforce(Resource::Keyring, "", Access::Write)
    }

    fn mesh_read(&self) -> EnforcementDecision {
        self.enforce(Resource::Mesh, "", Access::Read)
    }

    fn mesh_write(&self) -> EnforcementDecision {
        self.enforce(Resource::Mesh, "", Access::Write)
    }

    fn node_read(&self, name: &str) -> EnforcementDecision {
        self.enforce(Resource::Node, name, Access::Read)
    }

    fn node_write(&self, name: &str) -> EnforcementDecision {
        self.enforce(Resource::Node, name, Access::Write)
    }

    fn operator_read(&self) -> EnforcementDecision {
        self.enforce(Resource::Operator, "", Access::Read)
    }

    fn operator_write(&self) -> EnforcementDecision {
        self.enforce(Resource::Operator, "", Access::Write)
    }

    fn prepared_query_read(&self, prefix: &str) -> EnforcementDecision {
        self.enforce(Resource::Query, prefix, Access::Read)
    }

    fn prepared_query_write(&self, prefix: &str) -> EnforcementDecision {
        self.enforce(Resource::Query, prefix, Access::Write)
    }

    fn service_read(&self, name: &str) -> EnforcementDecision {
        self.enforce(Resource::Service, name, Access::Read)
    }

    fn service_write(&self, name: &str) -> EnforcementDecision {
        self.enforce(Resource::Service, name, Access::Write)
    }

    fn session_read(&self, node: &str) -> EnforcementDecision {
        self.enforce(Resource::Session, node, Access::Read)
    }

    fn session_write(&self, node: &str) -> EnforcementDecision {
        self.enforce(Resource::Session, node, Access::Write)
    }
}

/// Turn a decision into a result; only an explicit `Allow` passes.
pub fn require(
    decision: EnforcementDecision,
    resource: Resource,
    access: Access,
    segment: &str,
) -> Result<()> {
    if decision.is_allow() {
        return Ok(());
    }

    if segment.is_empty() {
        Err(AclError::permission_denied(format!(
            "token lacks permission '{}:{}'",
            resource, access
        )))
    } else {
        Err(AclError::permission_denied(format!(
            "token lacks permission '{}:{}' on \"{}\"",
            resource, access, segment
        )))
    }
}
