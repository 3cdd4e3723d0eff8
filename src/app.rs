//! ENABLE-APP, DISABLE-APP, STOP-APP and REMOVE-APP
//!
//! A lifecycle command targets one context (CONTEXT range), every context
//! of a node (NODE range) or every node of a domain (DOMAIN range).

use crate::command::{Manager, McmpResponse, Origin, Range};
use crate::decoder::Fields;
use crate::error::{
    McmpError, McmpResult, ALIAS_WITHOUT_CONTEXT, CONTEXT_WITHOUT_ALIAS, JVMROUTE_EMPTY,
    JVMROUTE_TOO_BIG, MISSING_FIELDS, MULTIPLE_ALIAS, MULTIPLE_CONTEXT,
};
use crate::records::{
    truncate_field, Context, ContextStatus, Host, Node, CONTEXT_SIZE, HOST_ALIAS_SIZE,
    JVMROUTE_SIZE,
};
use crate::registry::NodeScope;
use tracing::{debug, info, warn};

/// Lifecycle transition requested for an application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    Enable,
    Disable,
    Stop,
    Remove,
}

impl AppAction {
    /// Context status the action leaves behind
    pub fn status(&self) -> ContextStatus {
        match self {
            AppAction::Enable => ContextStatus::Enabled,
            AppAction::Disable => ContextStatus::Disabled,
            AppAction::Stop => ContextStatus::Stopped,
            AppAction::Remove => ContextStatus::Removed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppAction::Enable => "ENABLE-APP",
            AppAction::Disable => "DISABLE-APP",
            AppAction::Stop => "STOP-APP",
            AppAction::Remove => "REMOVE-APP",
        }
    }
}

/// Validated fields of a lifecycle command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppMessage {
    pub route: String,
    /// Lowercased, possibly comma-separated aliases
    pub alias: Option<String>,
    /// Possibly comma-separated context paths
    pub context: Option<String>,
}

impl AppMessage {
    fn for_node(route: &str) -> Self {
        Self {
            route: route.to_string(),
            ..Self::default()
        }
    }
}

/// Validate the fields of a lifecycle command
pub fn parse_app(fields: &Fields) -> McmpResult<AppMessage> {
    let mut message = AppMessage::default();

    for (name, value) in fields.iter() {
        if name.eq_ignore_ascii_case("JVMRoute") {
            if value.len() >= JVMROUTE_SIZE {
                return Err(McmpError::syntax(JVMROUTE_TOO_BIG));
            }
            message.route = value.to_string();
        } else if name.eq_ignore_ascii_case("Alias") {
            if message.alias.is_some() {
                return Err(McmpError::syntax(MULTIPLE_ALIAS));
            }
            message.alias = Some(value.to_ascii_lowercase());
        } else if name.eq_ignore_ascii_case("Context") {
            if message.context.is_some() {
                return Err(McmpError::syntax(MULTIPLE_CONTEXT));
            }
            message.context = Some(value.to_string());
        }
    }

    if message.route.is_empty() {
        return Err(McmpError::syntax(JVMROUTE_EMPTY));
    }
    match (&message.alias, &message.context) {
        (Some(_), None) => Err(McmpError::syntax(ALIAS_WITHOUT_CONTEXT)),
        (None, Some(_)) => Err(McmpError::syntax(CONTEXT_WITHOUT_ALIAS)),
        _ => Ok(message),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

/// Handle a lifecycle command at the given range
pub fn process_app(
    manager: &Manager,
    action: AppAction,
    fields: &Fields,
    range: Range,
    origin: Origin,
) -> McmpResult<McmpResponse> {
    if range == Range::Domain {
        let domain = fields
            .get("Domain")
            .filter(|d| !d.is_empty())
            .ok_or_else(|| McmpError::syntax(MISSING_FIELDS))?;
        return process_domain(manager, action, domain, origin);
    }

    let message = parse_app(fields)?;
    if range == Range::Context && message.context.is_none() {
        return Err(McmpError::syntax(MISSING_FIELDS));
    }
    apply(manager, action, &message, range, origin)
}

/// Run a NODE-range command for every node of `domain`.
///
/// Every node is attempted; the error of the last failing node is returned.
pub fn process_domain(
    manager: &Manager,
    action: AppAction,
    domain: &str,
    origin: Origin,
) -> McmpResult<McmpResponse> {
    let nodes = manager.registry().nodes_in_domain(domain);
    debug!(domain, nodes = nodes.len(), action = action.as_str(), "Domain command");

    let mut last_error = None;
    for node in &nodes {
        let message = AppMessage::for_node(&node.jvm_route);
        if let Err(e) = apply(manager, action, &message, Range::Node, origin) {
            warn!(domain, route = %node.jvm_route, error = %e, "Domain command failed on node");
            last_error = Some(e);
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => Ok(McmpResponse::empty()),
    }
}

fn apply(
    manager: &Manager,
    action: AppAction,
    message: &AppMessage,
    range: Range,
    origin: Origin,
) -> McmpResult<McmpResponse> {
    manager.registry().with_node_lock(|scope| {
        let node = match scope.node_by_route(&message.route) {
            Some(node) if node.is_active() => node,
            _ if action == AppAction::Remove => {
                debug!(route = %message.route, "REMOVE-APP for unknown or removed node");
                return Ok(McmpResponse::empty());
            }
            _ => return Err(McmpError::node_not_found(&message.route)),
        };
        scope.bump_version();

        match range {
            Range::Context => apply_context(scope, action, &node, message, origin),
            _ => {
                apply_node(scope, action, &node);
                Ok(McmpResponse::empty())
            }
        }
    })
}

fn apply_node(scope: &mut NodeScope<'_>, action: AppAction, node: &Node) {
    for host in scope.hosts_of_node(node.id) {
        for context in scope.contexts_of(node.id, host.vhost) {
            if action == AppAction::Remove {
                scope.remove_context(context.id);
            } else {
                scope.set_context_status(context.id, action.status());
            }
        }
        if action == AppAction::Remove {
            scope.remove_host(host.id);
        }
    }

    if action == AppAction::Remove {
        scope.mark_node_removed(node.id);
        info!(node = node.id, route = %node.jvm_route, "Node removed");
    } else {
        debug!(node = node.id, route = %node.jvm_route, status = action.status().as_str(), "Node contexts updated");
    }
}

fn apply_context(
    scope: &mut NodeScope<'_>,
    action: AppAction,
    node: &Node,
    message: &AppMessage,
    origin: Origin,
) -> McmpResult<McmpResponse> {
    let route = node.jvm_route.as_str();
    let aliases = message.alias.as_deref().unwrap_or_default();
    let paths = message.context.as_deref().unwrap_or_default();
    let first_alias = truncate_field(split_list(aliases).next().unwrap_or_default(), HOST_ALIAS_SIZE);

    let host = match scope.find_host(node.id, &first_alias) {
        Some(host) => host,
        None if action == AppAction::Remove => return Ok(McmpResponse::empty()),
        None => {
            let vhost = scope.next_vhost(node.id);
            for alias in split_list(aliases) {
                scope
                    .store_host(Host {
                        id: 0,
                        node: node.id,
                        vhost,
                        alias: truncate_field(alias, HOST_ALIAS_SIZE),
                    })
                    .map_err(|e| {
                        warn!(route, error = %e, "Host update failed");
                        McmpError::host_update_failed(route)
                    })?;
            }
            scope
                .find_host(node.id, &first_alias)
                .ok_or_else(|| McmpError::host_read_failed(route))?
        }
    };

    if action == AppAction::Enable {
        for path in split_list(paths) {
            for other in scope.contexts_with_path(path) {
                if other.node == node.id {
                    continue;
                }
                if let Some(other_node) = scope.node(other.node) {
                    if other_node.balancer != node.balancer {
                        warn!(
                            context = path,
                            route,
                            balancer = %node.balancer,
                            other_route = %other_node.jvm_route,
                            other_balancer = %other_node.balancer,
                            "Context served by two balancers"
                        );
                    }
                }
            }
        }
    }

    for path in split_list(paths) {
        let path = truncate_field(path, CONTEXT_SIZE);
        if action == AppAction::Remove {
            if let Some(existing) = scope.find_context(node.id, host.vhost, &path) {
                scope.remove_context(existing.id);
            }
            continue;
        }
        scope
            .store_context(Context {
                id: 0,
                node: node.id,
                vhost: host.vhost,
                path,
                status: action.status(),
                nb_requests: 0,
            })
            .map_err(|e| {
                warn!(route, error = %e, "Context update failed");
                McmpError::context_update_failed(route)
            })?;
    }

    if action == AppAction::Remove && scope.contexts_of(node.id, host.vhost).is_empty() {
        let removed = scope.remove_hosts_of(node.id, host.vhost);
        debug!(route, vhost = host.vhost, hosts = removed.len(), "Removed empty virtual host");
    }

    if action == AppAction::Stop && origin == Origin::Node {
        let first_path = truncate_field(split_list(paths).next().unwrap_or_default(), CONTEXT_SIZE);
        if let Some(context) = scope.find_context(node.id, host.vhost, &first_path) {
            debug!(route, context = %context.path, requests = context.nb_requests, "Context stopped");
            return Ok(McmpResponse::plain(format!(
                "Type=STOP-APP-RSP&JvmRoute={}&Alias={}&Context={}&Requests={}\n",
                route, aliases, paths, context.nb_requests
            )));
        }
    }

    Ok(McmpResponse::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OutputFormat;
    use crate::config::Config;
    use crate::health::{HealthBridge, NoopProber};
    use crate::registry::Registry;
    use crate::stats::StatsBlock;
    use std::sync::Arc;

    fn manager() -> Manager {
        let config = Config::default();
        let registry = Arc::new(Registry::in_memory(&config.manager));
        let health = HealthBridge::new(Arc::new(NoopProber), Arc::new(StatsBlock::new()));
        Manager::new(registry, health, &config)
    }

    fn run(manager: &Manager, verb: &str, body: &str, range: Range) -> McmpResult<McmpResponse> {
        manager.execute(verb, body.as_bytes(), range, OutputFormat::Plain)
    }

    fn status_of(manager: &Manager, route: &str, path: &str) -> Option<ContextStatus> {
        let node = manager.registry().node_by_route(route)?;
        manager
            .registry()
            .contexts()
            .into_iter()
            .find(|c| c.node == node.id && c.path == path)
            .map(|c| c.status)
    }

    #[test]
    fn test_parse_app() {
        let fields = Fields::decode(b"JVMRoute=n1&Alias=WWW.Example.com&Context=/app").unwrap();
        let message = parse_app(&fields).unwrap();
        assert_eq!(message.route, "n1");
        assert_eq!(message.alias.as_deref(), Some("www.example.com"));
        assert_eq!(message.context.as_deref(), Some("/app"));

        let fields = Fields::decode(b"JVMRoute=n1&Alias=a&Alias=b&Context=/app").unwrap();
        assert_eq!(parse_app(&fields).unwrap_err(), McmpError::syntax(MULTIPLE_ALIAS));

        let fields = Fields::decode(b"JVMRoute=n1&Alias=a&Context=/x&Context=/y").unwrap();
        assert_eq!(parse_app(&fields).unwrap_err(), McmpError::syntax(MULTIPLE_CONTEXT));

        let fields = Fields::decode(b"JVMRoute=n1&Alias=a").unwrap();
        assert_eq!(parse_app(&fields).unwrap_err(), McmpError::syntax(ALIAS_WITHOUT_CONTEXT));

        let fields = Fields::decode(b"JVMRoute=n1&Context=/x").unwrap();
        assert_eq!(parse_app(&fields).unwrap_err(), McmpError::syntax(CONTEXT_WITHOUT_ALIAS));

        let fields = Fields::decode(b"Alias=a&Context=/x").unwrap();
        assert_eq!(parse_app(&fields).unwrap_err(), McmpError::syntax(JVMROUTE_EMPTY));
    }

    #[test]
    fn test_enable_creates_host_and_context() {
        let manager = manager();
        run(&manager, "CONFIG", "JVMRoute=n1", Range::Context).unwrap();
        let before = manager.registry().version();

        run(&manager, "ENABLE-APP", "JVMRoute=n1&Alias=a.com,b.com&Context=/app", Range::Context).unwrap();
        assert_eq!(manager.registry().version(), before + 1);
        assert_eq!(status_of(&manager, "n1", "/app"), Some(ContextStatus::Enabled));

        let hosts = manager.registry().hosts();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.iter().all(|h| h.vhost == 1));

        // A second vhost gets the next id
        run(&manager, "ENABLE-APP", "JVMRoute=n1&Alias=c.com&Context=/other", Range::Context).unwrap();
        let node = manager.registry().node_by_route("n1").unwrap();
        assert_eq!(manager.registry().find_host(node.id, "c.com").unwrap().vhost, 2);
    }

    #[test]
    fn test_context_range_requires_target() {
        let manager = manager();
        run(&manager, "CONFIG", "JVMRoute=n1", Range::Context).unwrap();
        let err = run(&manager, "ENABLE-APP", "JVMRoute=n1", Range::Context).unwrap_err();
        assert_eq!(err, McmpError::syntax(MISSING_FIELDS));
    }

    #[test]
    fn test_unknown_node() {
        let manager = manager();
        let err = run(&manager, "DISABLE-APP", "JVMRoute=ghost&Alias=a&Context=/x", Range::Context)
            .unwrap_err();
        assert_eq!(err, McmpError::node_not_found("ghost"));

        run(&manager, "REMOVE-APP", "JVMRoute=ghost&Alias=a&Context=/x", Range::Context).unwrap();
        assert_eq!(manager.registry().version(), 0);
    }

    #[test]
    fn test_node_range_status_and_remove() {
        let manager = manager();
        run(
            &manager,
            "CONFIG",
            "JVMRoute=n1&Alias=a.com&Context=/app,/shop&Alias=b.com&Context=/admin",
            Range::Context,
        )
        .unwrap();

        run(&manager, "ENABLE-APP", "JVMRoute=n1", Range::Node).unwrap();
        for path in ["/app", "/shop", "/admin"] {
            assert_eq!(status_of(&manager, "n1", path), Some(ContextStatus::Enabled));
        }

        run(&manager, "REMOVE-APP", "JVMRoute=n1", Range::Node).unwrap();
        assert!(manager.registry().contexts().is_empty());
        assert!(manager.registry().hosts().is_empty());
        let node = manager.registry().node_by_route("n1").unwrap();
        assert!(node.is_removed());

        // Removed nodes are invisible to new commands
        let err = run(&manager, "ENABLE-APP", "JVMRoute=n1", Range::Node).unwrap_err();
        assert_eq!(err, McmpError::node_not_found("n1"));
        run(&manager, "REMOVE-APP", "JVMRoute=n1", Range::Node).unwrap();
    }

    #[test]
    fn test_remove_last_context_drops_host() {
        let manager = manager();
        run(&manager, "CONFIG", "JVMRoute=n1&Alias=a.com&Context=/app,/shop", Range::Context).unwrap();

        run(&manager, "REMOVE-APP", "JVMRoute=n1&Alias=a.com&Context=/app", Range::Context).unwrap();
        assert_eq!(manager.registry().hosts().len(), 1);

        run(&manager, "REMOVE-APP", "JVMRoute=n1&Alias=a.com&Context=/shop", Range::Context).unwrap();
        assert!(manager.registry().hosts().is_empty());
        assert!(manager.registry().contexts().is_empty());

        // Unknown host on REMOVE is already satisfied
        run(&manager, "REMOVE-APP", "JVMRoute=n1&Alias=nowhere&Context=/app", Range::Context).unwrap();
    }

    #[test]
    fn test_stop_reports_requests() {
        let manager = manager();
        run(&manager, "CONFIG", "JVMRoute=n1&Alias=a.com&Context=/app", Range::Context).unwrap();
        let node = manager.registry().node_by_route("n1").unwrap();
        let context = manager.registry().find_context(node.id, 1, "/app").unwrap();
        manager
            .registry()
            .with_context_lock(|scope| Ok(scope.add_requests(context.id, 4)))
            .unwrap();

        let response = run(&manager, "STOP-APP", "JVMRoute=n1&Alias=a.com&Context=/app", Range::Context).unwrap();
        assert_eq!(
            response.body,
            "Type=STOP-APP-RSP&JvmRoute=n1&Alias=a.com&Context=/app&Requests=4\n"
        );
        assert_eq!(status_of(&manager, "n1", "/app"), Some(ContextStatus::Stopped));
    }

    #[test]
    fn test_stop_from_console_has_no_body() {
        let manager = manager();
        run(&manager, "CONFIG", "JVMRoute=n1&Alias=a.com&Context=/app", Range::Context).unwrap();
        let fields = Fields::decode(b"JVMRoute=n1&Alias=a.com&Context=/app").unwrap();
        let response =
            process_app(&manager, AppAction::Stop, &fields, Range::Context, Origin::Console).unwrap();
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_domain_range() {
        let manager = manager();
        run(&manager, "CONFIG", "JVMRoute=a&Domain=dom&Alias=x&Context=/app", Range::Context).unwrap();
        run(&manager, "CONFIG", "JVMRoute=b&Domain=dom&Alias=x&Context=/app", Range::Context).unwrap();
        run(&manager, "CONFIG", "JVMRoute=c&Domain=other&Alias=x&Context=/app", Range::Context).unwrap();

        run(&manager, "ENABLE-APP", "Domain=dom", Range::Domain).unwrap();
        assert_eq!(status_of(&manager, "a", "/app"), Some(ContextStatus::Enabled));
        assert_eq!(status_of(&manager, "b", "/app"), Some(ContextStatus::Enabled));
        assert_eq!(status_of(&manager, "c", "/app"), Some(ContextStatus::Stopped));

        let err = run(&manager, "ENABLE-APP", "JVMRoute=a", Range::Domain).unwrap_err();
        assert_eq!(err, McmpError::syntax(MISSING_FIELDS));
    }
}
