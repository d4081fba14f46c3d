//! Authorization of catalog writes before they are proposed
//!
//! Every function takes `None` for the authorizer when ACLs are disabled,
//! in which case everything is allowed.

use crate::authorizer::{require, Access, Authorizer, Resource};
use crate::error::{AclError, Result};
use crate::structs::{
    CatalogVerb, DeregisterRequest, HealthCheck, KvVerb, NodeService, NodeServices,
    RegisterRequest, TxnOp,
};

fn node_write(authz: &dyn Authorizer, node: &str) -> Result<()> {
    require(authz.node_write(node), Resource::Node, Access::Write, node)
}

fn service_write(authz: &dyn Authorizer, service: &str) -> Result<()> {
    require(authz.service_write(service), Resource::Service, Access::Write, service)
}

/// Vet a catalog registration against the node's stored state.
///
/// Re-posting unchanged node information does not need node write, and a
/// check attached to the service being registered is covered by the
/// service's own write check.
pub fn vet_register(
    authorizer: Option<&dyn Authorizer>,
    request: &RegisterRequest,
    stored: Option<&NodeServices>,
) -> Result<()> {
    let Some(authz) = authorizer else {
        return Ok(());
    };

    if request.changes_node(stored.map(|ns| &ns.node)) {
        node_write(authz, &request.node)?;
    }

    if let Some(service) = &request.service {
        service_write(authz, &service.service)?;

        // registering over an existing ID also rewrites that service
        if let Some(other) = stored.and_then(|ns| ns.services.get(&service.id)) {
            service_write(authz, &other.service)?;
        }
    }

    if request.check.is_some() {
        return Err(AclError::InvalidRequest("check member must be nil".to_string()));
    }

    for check in &request.checks {
        if !check.node.eq_ignore_ascii_case(&request.node) {
            return Err(AclError::InvalidRequest(format!(
                "Node '{}' for check '{}' doesn't match register request node '{}'",
                check.node, check.check_id, request.node
            )));
        }

        if check.service_id.is_empty() {
            node_write(authz, &request.node)?;
            continue;
        }

        if request
            .service
            .as_ref()
            .map_or(false, |service| service.id == check.service_id)
        {
            continue;
        }

        let Some(other) = stored.and_then(|ns| ns.services.get(&check.service_id)) else {
            return Err(AclError::InvalidRequest(format!(
                "Unknown service ID '{}' for check ID '{}'",
                check.service_id, check.check_id
            )));
        };
        service_write(authz, &other.service)?;
    }

    Ok(())
}

/// Vet a deregistration. `service` and `check` are the stored objects named
/// by the request, if they exist.
///
/// Node write covers everything on the node. Otherwise the service ID takes
/// precedence over the check ID, matching the order deregistration applies
/// them in.
pub fn vet_deregister(
    authorizer: Option<&dyn Authorizer>,
    request: &DeregisterRequest,
    service: Option<&NodeService>,
    check: Option<&HealthCheck>,
) -> Result<()> {
    let Some(authz) = authorizer else {
        return Ok(());
    };

    let node_err = match node_write(authz, &request.node) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };

    if !request.service_id.is_empty() {
        let Some(service) = service else {
            return Err(AclError::InvalidRequest(format!(
                "Unknown service ID '{}'",
                request.service_id
            )));
        };
        return service_write(authz, &service.service);
    }

    if !request.check_id.is_empty() {
        let Some(check) = check else {
            return Err(AclError::InvalidRequest(format!(
                "Unknown check ID '{}'",
                request.check_id
            )));
        };
        if check.service_id.is_empty() {
            return node_write(authz, &request.node);
        }
        return service_write(authz, &check.service_name);
    }

    Err(node_err)
}

/// Vet one operation of a transaction.
pub fn vet_txn_op(authorizer: Option<&dyn Authorizer>, op: &TxnOp) -> Result<()> {
    let Some(authz) = authorizer else {
        return Ok(());
    };

    match op {
        TxnOp::Kv { verb, key } => match verb {
            KvVerb::Get | KvVerb::CheckSession | KvVerb::CheckIndex => {
                require(authz.key_read(key), Resource::Key, Access::Read, key)
            }
            KvVerb::GetTree => require(authz.key_list(key), Resource::Key, Access::List, key),
            KvVerb::DeleteTree => {
                require(authz.key_write_prefix(key), Resource::Key, Access::Write, key)
            }
            KvVerb::Set
            | KvVerb::Cas
            | KvVerb::Lock
            | KvVerb::Unlock
            | KvVerb::Delete
            | KvVerb::DeleteCas
            | KvVerb::CheckNotExists => {
                require(authz.key_write(key), Resource::Key, Access::Write, key)
            }
        },
        TxnOp::Node { verb, node } => match verb {
            CatalogVerb::Get => {
                require(authz.node_read(&node.node), Resource::Node, Access::Read, &node.node)
            }
            _ => node_write(authz, &node.node),
        },
        TxnOp::Service { verb, service, .. } => match verb {
            CatalogVerb::Get => require(
                authz.service_read(&service.service),
                Resource::Service,
                Access::Read,
                &service.service,
            ),
            _ => service_write(authz, &service.service),
        },
        TxnOp::Check { verb, check } => match verb {
            CatalogVerb::Get => {
                require(authz.node_read(&check.node), Resource::Node, Access::Read, &check.node)?;
                if check.service_name.is_empty() {
                    return Ok(());
                }
                require(
                    authz.service_read(&check.service_name),
                    Resource::Service,
                    Access::Read,
                    &check.service_name,
                )
            }
            _ if check.service_id.is_empty() => node_write(authz, &check.node),
            _ => service_write(authz, &check.service_name),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::{allow_all, deny_all};
    use crate::structs::Node;

    #[test]
    fn test_disabled_acls_allow_everything() {
        let request = RegisterRequest {
            node: "n1".into(),
            check: Some(HealthCheck::node_check("n1", "c1")),
            ..Default::default()
        };
        assert!(vet_register(None, &request, None).is_ok());

        let op = TxnOp::Kv {
            verb: KvVerb::DeleteTree,
            key: "app/".into(),
        };
        assert!(vet_txn_op(None, &op).is_ok());
    }

    #[test]
    fn test_unflattened_check_rejected() {
        let allow = allow_all();
        let request = RegisterRequest {
            node: "n1".into(),
            check: Some(HealthCheck::node_check("n1", "c1")),
            ..Default::default()
        };
        let err = vet_register(Some(allow.as_ref()), &request, None).unwrap_err();
        assert_eq!(err, AclError::InvalidRequest("check member must be nil".into()));
    }

    #[test]
    fn test_deregister_without_target_returns_node_error() {
        let deny = deny_all();
        let request = DeregisterRequest {
            node: "n1".into(),
            ..Default::default()
        };
        let err = vet_deregister(Some(deny.as_ref()), &request, None, None).unwrap_err();
        assert!(err.is_permission_denied());
        assert!(err.to_string().contains("node:write"));
    }

    #[test]
    fn test_txn_node_write_denied() {
        let deny = deny_all();
        let op = TxnOp::Node {
            verb: CatalogVerb::Set,
            node: Node::named("n1"),
        };
        assert!(vet_txn_op(Some(deny.as_ref()), &op).unwrap_err().is_permission_denied());
    }
}
