//! CONFIG: node, balancer and topology announcement

use crate::command::{Manager, McmpResponse};
use crate::decoder::{parse_int, Fields};
use crate::error::{
    McmpError, McmpResult, ALIAS_WITHOUT_CONTEXT, BALANCER_TOO_BIG, CONTEXT_WITHOUT_ALIAS,
    DOMAIN_TOO_BIG, FIELD_TOO_BIG, HOST_TOO_BIG, JVMROUTE_EMPTY, JVMROUTE_TOO_BIG, PORT_TOO_BIG,
    TYPE_TOO_BIG,
};
use crate::records::{
    truncate_field, Balancer, Context, ContextStatus, FlushPackets, Host, Node, BALANCER_SIZE,
    CONTEXT_SIZE, COOKIE_SIZE, DOMAIN_SIZE, HOST_ALIAS_SIZE, HOST_NODE_SIZE, JVMROUTE_SIZE,
    PORT_NODE_SIZE, SCHEME_SIZE,
};
use tracing::{debug, info, warn};

/// Aliases of one virtual host and the contexts deployed on it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhostGroup {
    pub aliases: Vec<String>,
    pub contexts: Vec<String>,
}

/// A validated CONFIG message
#[derive(Debug, Clone)]
pub struct ConfigMessage {
    pub balancer: Balancer,
    pub node: Node,
    pub groups: Vec<VhostGroup>,
}

fn check_len(value: &str, size: usize, message: &'static str) -> McmpResult<()> {
    if value.len() >= size {
        return Err(McmpError::syntax(message));
    }
    Ok(())
}

fn normalize_balancer(name: &str) -> String {
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        let lower = name.to_ascii_lowercase();
        warn!(balancer = name, normalized = %lower, "Balancer name contained upper case characters");
        lower
    } else {
        name.to_string()
    }
}

/// Drop an IPv6 zone id: `[fe80::1%eth0]` becomes `[fe80::1]`
fn strip_zone(host: &str) -> String {
    if !host.starts_with('[') {
        return host.to_string();
    }
    match (host.find('%'), host.find(']')) {
        (Some(zone), Some(end)) if zone < end => format!("{}{}", &host[..zone], &host[end..]),
        (Some(zone), None) => host[..zone].to_string(),
        _ => host.to_string(),
    }
}

fn split_list(value: &str, lowercase: bool) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            if lowercase {
                v.to_ascii_lowercase()
            } else {
                v.to_string()
            }
        })
        .collect()
}

/// Validate CONFIG fields and apply defaults
pub fn parse_config(
    fields: &Fields,
    default_balancer: &str,
    default_smax: i64,
    ws_tunnel: bool,
) -> McmpResult<ConfigMessage> {
    let mut balancer = Balancer::new(default_balancer);
    let mut node = Node::new("", default_balancer, default_smax);
    let mut groups: Vec<VhostGroup> = Vec::new();

    for (name, value) in fields.iter() {
        match name.to_ascii_lowercase().as_str() {
            "balancer" => {
                check_len(value, BALANCER_SIZE, BALANCER_TOO_BIG)?;
                let name = normalize_balancer(value);
                node.balancer = name.clone();
                balancer.name = name;
            }
            "stickysession" => {
                if value.eq_ignore_ascii_case("no") {
                    balancer.sticky_session = false;
                }
            }
            "stickysessioncookie" => {
                check_len(value, COOKIE_SIZE, FIELD_TOO_BIG)?;
                balancer.sticky_session_cookie = value.to_string();
            }
            "stickysessionpath" => {
                check_len(value, COOKIE_SIZE, FIELD_TOO_BIG)?;
                balancer.sticky_session_path = value.to_string();
            }
            "stickysessionremove" => {
                if value.eq_ignore_ascii_case("yes") {
                    balancer.sticky_session_remove = true;
                }
            }
            "stickysessionforce" => {
                if value.eq_ignore_ascii_case("no") {
                    balancer.sticky_session_force = false;
                }
            }
            "waitworker" => balancer.timeout_secs = parse_int(value),
            "maxattempts" => balancer.max_attempts = parse_int(value),
            "jvmroute" => {
                check_len(value, JVMROUTE_SIZE, JVMROUTE_TOO_BIG)?;
                node.jvm_route = value.to_string();
            }
            "domain" => {
                check_len(value, DOMAIN_SIZE, DOMAIN_TOO_BIG)?;
                node.domain = value.to_string();
            }
            "host" => {
                check_len(value, HOST_NODE_SIZE, HOST_TOO_BIG)?;
                node.host = strip_zone(value);
            }
            "port" => {
                check_len(value, PORT_NODE_SIZE, PORT_TOO_BIG)?;
                node.port = value.to_string();
            }
            "type" => {
                check_len(value, SCHEME_SIZE, TYPE_TOO_BIG)?;
                node.scheme = value.to_string();
            }
            "reversed" => {
                if value.eq_ignore_ascii_case("yes") {
                    node.reversed = true;
                }
            }
            "flushpackets" => {
                if value.eq_ignore_ascii_case("on") {
                    node.flush_packets = FlushPackets::On;
                } else if value.eq_ignore_ascii_case("auto") {
                    node.flush_packets = FlushPackets::Auto;
                }
            }
            "flushwait" => node.flush_wait_ms = parse_int(value).saturating_mul(1000),
            "ping" => node.ping_secs = parse_int(value),
            "smax" => node.smax = parse_int(value),
            "ttl" => node.ttl_secs = parse_int(value),
            "timeout" => node.timeout_secs = parse_int(value),
            "alias" => {
                match groups.last() {
                    Some(group) if group.contexts.is_empty() => {
                        return Err(McmpError::syntax(ALIAS_WITHOUT_CONTEXT));
                    }
                    _ => {}
                }
                groups.push(VhostGroup {
                    aliases: split_list(value, true),
                    contexts: Vec::new(),
                });
            }
            "context" => match groups.last_mut() {
                Some(group) if group.contexts.is_empty() => {
                    group.contexts = split_list(value, false);
                    // An empty list still closes the group
                    if group.contexts.is_empty() {
                        group.contexts.push(String::new());
                    }
                }
                _ => return Err(McmpError::syntax(CONTEXT_WITHOUT_ALIAS)),
            },
            _ => debug!(field = name, "Ignoring unknown CONFIG field"),
        }
    }

    if node.jvm_route.is_empty() {
        return Err(McmpError::syntax(JVMROUTE_EMPTY));
    }
    if matches!(groups.last(), Some(group) if group.contexts.is_empty()) {
        return Err(McmpError::syntax(ALIAS_WITHOUT_CONTEXT));
    }

    if ws_tunnel && node.scheme != "ajp" {
        match node.scheme.as_str() {
            "http" => node.scheme = "ws".to_string(),
            "https" => node.scheme = "wss".to_string(),
            _ => {}
        }
    }

    Ok(ConfigMessage {
        balancer,
        node,
        groups,
    })
}

/// Handle a CONFIG message
pub fn process_config(manager: &Manager, fields: &Fields) -> McmpResult<McmpResponse> {
    let settings = manager.settings();
    let message = parse_config(
        fields,
        &settings.default_balancer(),
        manager.node_defaults().smax,
        settings.enable_ws_tunnel,
    )?;
    let route = message.node.jvm_route.clone();

    manager.registry().with_node_lock(|scope| {
        scope
            .upsert_balancer(message.balancer.clone())
            .map_err(|e| {
                warn!(route = %route, error = %e, "Balancer update failed");
                McmpError::balancer_update_failed(&route)
            })?;

        if let Some(existing) = scope.node_by_route(&route) {
            if !existing.is_compatible(&message.node) {
                // The old worker keeps its pool until purged; the sender retries
                scope.supersede_node(existing.id);
                scope.bump_version();
                info!(route = %route, node = existing.id, "Node changed; old entry superseded");
                return Err(McmpError::node_still_exists(&route));
            }
        }

        let id = scope.store_node(message.node.clone()).map_err(|e| {
            warn!(route = %route, error = %e, "Node update failed");
            McmpError::node_update_failed(&route)
        })?;
        scope.remove_domain(&route, &message.node.balancer);
        scope.bump_version();
        debug!(route = %route, node = id, balancer = %message.node.balancer, "Node configured");

        for (index, group) in message.groups.iter().enumerate() {
            let vhost = index as u32 + 1;
            for alias in &group.aliases {
                scope
                    .store_host(Host {
                        id: 0,
                        node: id,
                        vhost,
                        alias: truncate_field(alias, HOST_ALIAS_SIZE),
                    })
                    .map_err(|e| {
                        warn!(route = %route, error = %e, "Host update failed");
                        McmpError::host_update_failed(&route)
                    })?;
            }
            for path in group.contexts.iter().filter(|p| !p.is_empty()) {
                scope
                    .store_context(Context {
                        id: 0,
                        node: id,
                        vhost,
                        path: truncate_field(path, CONTEXT_SIZE),
                        status: ContextStatus::Stopped,
                        nb_requests: 0,
                    })
                    .map_err(|e| {
                        warn!(route = %route, error = %e, "Context update failed");
                        McmpError::context_update_failed(&route)
                    })?;
            }
        }
        Ok(McmpResponse::empty())
    })
}
