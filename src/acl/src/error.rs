//! Error types for token resolution, filtering and write vetting

use thiserror::Error;

/// ACL resolution errors
///
/// Errors are `Clone` because one coalesced fetch hands the same outcome to
/// every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AclError {
    /// Token, policy or role does not exist
    #[error("ACL not found")]
    NotFound,

    /// An authorizer conclusively denied the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Attempt to authenticate as a root authorizer name
    #[error("Cannot resolve root ACL")]
    RootDenied,

    /// The ACL system is disabled on the servers
    #[error("ACL support disabled")]
    Disabled,

    /// Legacy token whose parent is not a root authorizer
    #[error("Invalid Parent")]
    InvalidParent,

    /// The authoritative datacenter could not be consulted
    #[error("Error communicating with the ACL Datacenter: {0}")]
    Remote(Box<AclError>),

    /// A policy or role fetch failed because of the token used to fetch it
    #[error("{cause}")]
    TokenLinkage {
        #[source]
        cause: Box<AclError>,
        token: String,
    },

    /// Merged policy data could not be compiled
    #[error("Failed to compile policy {policy}: {reason}")]
    Compile { policy: String, reason: String },

    /// Network or RPC failure talking to the authority
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AclError {
    /// Wrap an authority failure so callers can apply the down policy.
    pub fn remote(err: AclError) -> Self {
        match err {
            AclError::Remote(_) => err,
            other => AclError::Remote(Box::new(other)),
        }
    }

    pub(crate) fn linkage(cause: AclError, token: &str) -> Self {
        AclError::TokenLinkage {
            cause: Box::new(cause),
            token: token.to_string(),
        }
    }

    pub fn permission_denied(cause: impl Into<String>) -> Self {
        AclError::PermissionDenied(cause.into())
    }

    /// True for not-found, including a not-found reported for the token
    /// that was used to fetch linked policies or roles.
    pub fn is_not_found(&self) -> bool {
        match self {
            AclError::NotFound => true,
            AclError::TokenLinkage { cause, .. } => cause.is_not_found(),
            _ => false,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            AclError::PermissionDenied(_) => true,
            AclError::TokenLinkage { cause, .. } => cause.is_permission_denied(),
            _ => false,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, AclError::Remote(_))
    }

    /// True when the servers reported that ACLs are disabled, however deeply
    /// the report was wrapped.
    pub fn is_disabled(&self) -> bool {
        match self {
            AclError::Disabled => true,
            AclError::Remote(inner) => inner.is_disabled(),
            AclError::TokenLinkage { cause, .. } => cause.is_disabled(),
            _ => false,
        }
    }

    /// Token named by a linkage error.
    pub fn linkage_token(&self) -> Option<&str> {
        match self {
            AclError::TokenLinkage { token, .. } => Some(token),
            _ => None,
        }
    }
}

/// Result type for ACL operations
pub type Result<T> = std::result::Result<T, AclError>;
