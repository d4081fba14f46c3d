//! ACL filtering of read results
//!
//! [`AclFilter::filter`] prunes elements the authorizer may not read and
//! redacts embedded secrets from elements it may read but not manage.
//! Redaction always replaces the shared pointer with a modified copy; the
//! original object may be live state and is never touched.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::authorizer::Authorizer;
use crate::structs::{
    AclAuthMethod, AclBindingRule, AclPolicy, AclRole, AclToken, AclTokenListStub,
    CheckServiceNode, Coordinate, GatewayService, HealthCheck, Intention, IntentionQueryMatch,
    Node, NodeInfo, NodeServiceList, NodeServices, NodesWithGateways, PreparedQuery, ServiceInfo,
    ServiceName, ServiceNode, ServiceTopology, Session,
};

/// Replaces secrets the caller may not see
pub const REDACTED_TOKEN: &str = "<hidden>";

/// Result shapes the filter understands
#[derive(Debug)]
pub enum FilterSubject<'a> {
    Nodes(&'a mut Vec<Node>),
    /// Service name to tags
    Services(&'a mut BTreeMap<String, Vec<String>>),
    ServiceNodes(&'a mut Vec<ServiceNode>),
    NodeServices(&'a mut Option<NodeServices>),
    NodeServiceList(&'a mut NodeServiceList),
    HealthChecks(&'a mut Vec<HealthCheck>),
    CheckServiceNodes(&'a mut Vec<CheckServiceNode>),
    /// Datacenter to check-service-nodes
    DatacenterCheckServiceNodes(&'a mut BTreeMap<String, Vec<CheckServiceNode>>),
    ServiceTopology(&'a mut ServiceTopology),
    Sessions(&'a mut Vec<Session>),
    Coordinates(&'a mut Vec<Coordinate>),
    Intentions(&'a mut Vec<Intention>),
    IntentionMatch(&'a mut IntentionQueryMatch),
    NodeDump(&'a mut Vec<NodeInfo>),
    ServiceDump(&'a mut Vec<ServiceInfo>),
    ServiceList(&'a mut Vec<ServiceName>),
    /// Peer name to the services exported to it
    ExportedServices(&'a mut BTreeMap<String, Vec<ServiceName>>),
    GatewayServices(&'a mut Vec<GatewayService>),
    NodesWithGateways(&'a mut NodesWithGateways),
    PreparedQueries(&'a mut Vec<Arc<PreparedQuery>>),
    PreparedQuery(&'a mut Arc<PreparedQuery>),
    Tokens(&'a mut Vec<Arc<AclToken>>),
    Token(&'a mut Option<Arc<AclToken>>),
    TokenStubs(&'a mut Vec<Arc<AclTokenListStub>>),
    TokenStub(&'a mut Option<Arc<AclTokenListStub>>),
    Policies(&'a mut Vec<Arc<AclPolicy>>),
    Policy(&'a mut Option<Arc<AclPolicy>>),
    Roles(&'a mut Vec<Arc<AclRole>>),
    Role(&'a mut Option<Arc<AclRole>>),
    BindingRules(&'a mut Vec<Arc<AclBindingRule>>),
    BindingRule(&'a mut Option<Arc<AclBindingRule>>),
    AuthMethods(&'a mut Vec<Arc<AclAuthMethod>>),
    AuthMethod(&'a mut Option<Arc<AclAuthMethod>>),
}

/// Keep the elements `allow` accepts; true when any were dropped.
fn retain_logged<T>(items: &mut Vec<T>, kind: &str, mut allow: impl FnMut(&T) -> bool) -> bool {
    let before = items.len();
    items.retain(|item| allow(item));
    let dropped = before - items.len();
    if dropped > 0 {
        debug!(kind, dropped, "dropping results due to ACLs");
    }
    dropped > 0
}

/// Filter bound to one authorizer
pub struct AclFilter<'a> {
    authorizer: &'a dyn Authorizer,
    enforce_version8: bool,
}

impl<'a> AclFilter<'a> {
    /// With `enforce_version8` off, node and session visibility is not
    /// checked.
    pub fn new(authorizer: &'a dyn Authorizer, enforce_version8: bool) -> Self {
        Self {
            authorizer,
            enforce_version8,
        }
    }

    /// Filter `subject` in place; returns whether any element was removed.
    pub fn filter(&self, subject: FilterSubject<'_>) -> bool {
        match subject {
            FilterSubject::Nodes(nodes) => {
                retain_logged(nodes, "node", |node| self.allow_node(&node.node))
            }
            FilterSubject::Services(services) => {
                let before = services.len();
                services.retain(|name, _| self.allow_service(name));
                let dropped = before - services.len();
                if dropped > 0 {
                    debug!(kind = "service", dropped, "dropping results due to ACLs");
                }
                dropped > 0
            }
            FilterSubject::ServiceNodes(nodes) => retain_logged(nodes, "service node", |node| {
                self.allow_node(&node.node) && self.allow_service(&node.service_name)
            }),
            FilterSubject::NodeServices(services) => self.filter_node_services(services),
            FilterSubject::NodeServiceList(list) => self.filter_node_service_list(list),
            FilterSubject::HealthChecks(checks) => self.filter_health_checks(checks),
            FilterSubject::CheckServiceNodes(nodes) => self.filter_check_service_nodes(nodes),
            FilterSubject::DatacenterCheckServiceNodes(by_dc) => {
                let mut removed = false;
                for nodes in by_dc.values_mut() {
                    removed |= self.filter_check_service_nodes(nodes);
                }
                by_dc.retain(|_, nodes| !nodes.is_empty());
                removed
            }
            FilterSubject::ServiceTopology(topology) => {
                let upstreams = self.filter_check_service_nodes(&mut topology.upstreams);
                let downstreams = self.filter_check_service_nodes(&mut topology.downstreams);
                topology.filtered_by_acls = upstreams || downstreams;
                topology.filtered_by_acls
            }
            FilterSubject::Sessions(sessions) => {
                retain_logged(sessions, "session", |session| self.allow_session(&session.node))
            }
            FilterSubject::Coordinates(coords) => {
                retain_logged(coords, "coordinate", |coord| self.allow_node(&coord.node))
            }
            FilterSubject::Intentions(intentions) => {
                retain_logged(intentions, "intention", |ixn| self.can_read_intention(ixn))
            }
            FilterSubject::IntentionMatch(matches) => self.filter_intention_match(matches),
            FilterSubject::NodeDump(dump) => self.filter_node_dump(dump),
            FilterSubject::ServiceDump(dump) => self.filter_service_dump(dump),
            FilterSubject::ServiceList(names) => {
                retain_logged(names, "service", |svc| self.allow_service(&svc.name))
            }
            FilterSubject::ExportedServices(by_peer) => {
                let mut removed = false;
                for names in by_peer.values_mut() {
                    removed |= retain_logged(names, "service", |svc| self.allow_service(&svc.name));
                }
                by_peer.retain(|_, names| !names.is_empty());
                removed
            }
            FilterSubject::GatewayServices(services) => {
                retain_logged(services, "gateway service", |gs| self.allow_gateway(gs))
            }
            FilterSubject::NodesWithGateways(result) => {
                let nodes = self.filter_check_service_nodes(&mut result.nodes);
                let gateways = retain_logged(&mut result.gateways, "gateway service", |gs| {
                    self.allow_gateway(gs)
                });
                let imported = self.filter_check_service_nodes(&mut result.imported_nodes);
                nodes || gateways || imported
            }
            FilterSubject::PreparedQueries(queries) => self.filter_prepared_queries(queries),
            FilterSubject::PreparedQuery(query) => {
                self.redact_prepared_query(query);
                false
            }
            FilterSubject::Tokens(tokens) => self.filter_tokens(tokens),
            FilterSubject::Token(token) => {
                let present = token.is_some();
                self.filter_token(token);
                present && token.is_none()
            }
            FilterSubject::TokenStubs(stubs) => self.filter_token_stubs(stubs),
            FilterSubject::TokenStub(stub) => {
                let present = stub.is_some();
                self.filter_token_stub(stub);
                present && stub.is_none()
            }
            FilterSubject::Policies(policies) => self.filter_acl_objects(policies, "policy"),
            FilterSubject::Policy(policy) => self.filter_acl_object(policy),
            FilterSubject::Roles(roles) => self.filter_acl_objects(roles, "role"),
            FilterSubject::Role(role) => self.filter_acl_object(role),
            FilterSubject::BindingRules(rules) => self.filter_acl_objects(rules, "binding rule"),
            FilterSubject::BindingRule(rule) => self.filter_acl_object(rule),
            FilterSubject::AuthMethods(methods) => self.filter_acl_objects(methods, "auth method"),
            FilterSubject::AuthMethod(method) => self.filter_acl_object(method),
        }
    }

    fn allow_node(&self, node: &str) -> bool {
        !self.enforce_version8 || self.authorizer.node_read(node).is_allow()
    }

    fn allow_service(&self, service: &str) -> bool {
        service.is_empty() || self.authorizer.service_read(service).is_allow()
    }

    /// Both the gateway and the service behind it must be readable.
    fn allow_gateway(&self, gs: &GatewayService) -> bool {
        self.allow_service(&gs.gateway.name) && self.allow_service(&gs.service.name)
    }

    fn allow_session(&self, node: &str) -> bool {
        !self.enforce_version8 || self.authorizer.session_read(node).is_allow()
    }

    /// Readable when either end of the intention is.
    fn can_read_intention(&self, ixn: &Intention) -> bool {
        (!ixn.source_name.is_empty() && self.authorizer.intention_read(&ixn.source_name).is_allow())
            || (!ixn.destination_name.is_empty()
                && self.authorizer.intention_read(&ixn.destination_name).is_allow())
    }

    fn filter_health_checks(&self, checks: &mut Vec<HealthCheck>) -> bool {
        retain_logged(checks, "check", |check| {
            self.allow_node(&check.node) && self.allow_service(&check.service_name)
        })
    }

    fn filter_check_service_nodes(&self, nodes: &mut Vec<CheckServiceNode>) -> bool {
        retain_logged(nodes, "check service node", |csn| {
            self.allow_node(&csn.node.node) && self.allow_service(&csn.service.service)
        })
    }

    fn filter_node_services(&self, services: &mut Option<NodeServices>) -> bool {
        let Some(inner) = services.as_mut() else {
            return false;
        };

        if !self.allow_node(&inner.node.node) {
            debug!(node = %inner.node.node, "dropping node services due to ACLs");
            *services = None;
            return true;
        }

        let before = inner.services.len();
        inner.services.retain(|_, svc| self.allow_service(&svc.service));
        before != inner.services.len()
    }

    fn filter_node_service_list(&self, list: &mut NodeServiceList) -> bool {
        let Some(node) = list.node.as_ref() else {
            return false;
        };

        if !self.allow_node(&node.node) {
            debug!(node = %node.node, "dropping node service list due to ACLs");
            *list = NodeServiceList::default();
            return true;
        }

        retain_logged(&mut list.services, "service", |svc| self.allow_service(&svc.service))
    }

    /// Match results are all or nothing: one unreadable prefix clears them.
    fn filter_intention_match(&self, matches: &mut IntentionQueryMatch) -> bool {
        let denied = matches.entries.iter().find(|entry| {
            !entry.name.is_empty() && !self.authorizer.intention_read(&entry.name).is_allow()
        });

        match denied {
            Some(entry) => {
                warn!(prefix = %entry.name, "Operation on intention prefix denied due to ACLs");
                matches.entries.clear();
                true
            }
            None => false,
        }
    }

    fn filter_node_dump(&self, dump: &mut Vec<NodeInfo>) -> bool {
        let mut removed = retain_logged(dump, "node", |info| self.allow_node(&info.node));

        for info in dump.iter_mut() {
            removed |= retain_logged(&mut info.services, "service", |svc| {
                self.allow_service(&svc.service)
            });
            removed |= retain_logged(&mut info.checks, "check", |check| {
                self.allow_service(&check.service_name)
            });
        }

        removed
    }

    fn filter_service_dump(&self, dump: &mut Vec<ServiceInfo>) -> bool {
        retain_logged(dump, "service dump entry", |info| {
            self.allow_gateway(&info.gateway_service)
                && info
                    .node
                    .as_ref()
                    .map_or(true, |node| self.allow_node(&node.node))
        })
    }

    /// Only named queries the caller can read survive, with their tokens
    /// redacted. Dropping unnamed queries does not count as filtering: they
    /// are only ever visible to managers.
    fn filter_prepared_queries(&self, queries: &mut Vec<Arc<PreparedQuery>>) -> bool {
        if self.authorizer.acl_write().is_allow() {
            return false;
        }

        let mut named_removed = false;
        queries.retain(|query| match query.acl_prefix() {
            Some(prefix) if self.authorizer.prepared_query_read(prefix).is_allow() => true,
            Some(_) => {
                debug!(query = %query.id, "dropping prepared query from result due to ACLs");
                named_removed = true;
                false
            }
            None => {
                debug!(query = %query.id, "dropping prepared query from result due to ACLs");
                false
            }
        });

        for query in queries.iter_mut() {
            self.redact_prepared_query(query);
        }

        named_removed
    }

    fn redact_prepared_query(&self, query: &mut Arc<PreparedQuery>) {
        if self.authorizer.acl_write().is_allow() || query.token.is_empty() {
            return;
        }

        let mut redacted = PreparedQuery::clone(query);
        redacted.token = REDACTED_TOKEN.to_string();
        *query = Arc::new(redacted);
    }

    fn filter_tokens(&self, tokens: &mut Vec<Arc<AclToken>>) -> bool {
        if !self.authorizer.acl_read().is_allow() {
            let removed = !tokens.is_empty();
            tokens.clear();
            return removed;
        }

        if !self.authorizer.acl_write().is_allow() {
            for token in tokens.iter_mut() {
                let mut redacted = AclToken::clone(token);
                redacted.secret_id = REDACTED_TOKEN.to_string();
                *token = Arc::new(redacted);
            }
        }
        false
    }

    fn filter_token(&self, token: &mut Option<Arc<AclToken>>) {
        let Some(current) = token.as_ref() else {
            return;
        };

        if !self.authorizer.acl_read().is_allow() {
            *token = None;
        } else if !self.authorizer.acl_write().is_allow() {
            let mut redacted = AclToken::clone(current);
            redacted.secret_id = REDACTED_TOKEN.to_string();
            *token = Some(Arc::new(redacted));
        }
    }

    fn filter_token_stubs(&self, stubs: &mut Vec<Arc<AclTokenListStub>>) -> bool {
        if !self.authorizer.acl_read().is_allow() {
            let removed = !stubs.is_empty();
            stubs.clear();
            return removed;
        }

        if !self.authorizer.acl_write().is_allow() {
            for stub in stubs.iter_mut() {
                *stub = Self::redacted_stub(stub);
            }
        }
        false
    }

    fn filter_token_stub(&self, stub: &mut Option<Arc<AclTokenListStub>>) {
        let Some(current) = stub.as_ref() else {
            return;
        };

        if !self.authorizer.acl_read().is_allow() {
            *stub = None;
        } else if !self.authorizer.acl_write().is_allow() {
            *stub = Some(Self::redacted_stub(current));
        }
    }

    fn redacted_stub(stub: &AclTokenListStub) -> Arc<AclTokenListStub> {
        let mut redacted = stub.clone();
        redacted.secret_id = REDACTED_TOKEN.to_string();
        Arc::new(redacted)
    }

    /// Policies, roles, binding rules and auth methods need `acl:read`.
    fn filter_acl_objects<T>(&self, objects: &mut Vec<T>, kind: &str) -> bool {
        if self.authorizer.acl_read().is_allow() || objects.is_empty() {
            return false;
        }
        debug!(kind, dropped = objects.len(), "dropping results due to ACLs");
        objects.clear();
        true
    }

    fn filter_acl_object<T>(&self, object: &mut Option<T>) -> bool {
        if self.authorizer.acl_read().is_allow() || object.is_none() {
            return false;
        }
        *object = None;
        true
    }
}
