//! STATUS, PING and VERSION

use crate::command::{Manager, McmpResponse, OutputFormat};
use crate::decoder::{parse_int, Fields};
use crate::error::{
    McmpError, McmpResult, JVMROUTE_TOO_BIG, MISSING_FIELDS, VERSION_PROTOCOL,
};
use crate::health::{LOAD_BROKEN, LOAD_PING};
use crate::records::JVMROUTE_SIZE;
use crate::server::{PKG_NAME, VERSION};
use tracing::debug;

fn state(up: bool) -> &'static str {
    if up {
        "OK"
    } else {
        "NOTOK"
    }
}

/// Handle a STATUS message: apply the reported load and answer with the verdict
pub fn process_status(manager: &Manager, fields: &Fields) -> McmpResult<McmpResponse> {
    let mut route = "";
    let mut load = LOAD_BROKEN;

    for (name, value) in fields.iter() {
        if name.eq_ignore_ascii_case("JVMRoute") {
            if value.len() >= JVMROUTE_SIZE {
                return Err(McmpError::syntax(JVMROUTE_TOO_BIG));
            }
            route = value;
        } else if name.eq_ignore_ascii_case("Load") {
            load = parse_int(value);
        } else {
            return Err(McmpError::invalid_field(name));
        }
    }

    let node = manager
        .registry()
        .node_by_route(route)
        .ok_or_else(|| McmpError::node_not_found(route))?;
    let up = manager.health().node_is_up(&node, load);
    debug!(route, load, up, "STATUS");

    Ok(McmpResponse::plain(format!(
        "Type=STATUS-RSP&JVMRoute={}&State={}&id={}\n",
        route,
        state(up),
        manager.restart_epoch()
    )))
}

/// Handle a PING message for a node, a raw scheme/host/port or the manager itself
pub fn process_ping(manager: &Manager, fields: &Fields) -> McmpResult<McmpResponse> {
    let mut route = None;
    let mut scheme = None;
    let mut host = None;
    let mut port = None;

    for (name, value) in fields.iter() {
        if name.eq_ignore_ascii_case("JVMRoute") {
            if value.len() >= JVMROUTE_SIZE {
                return Err(McmpError::syntax(JVMROUTE_TOO_BIG));
            }
            route = Some(value);
        } else if name.eq_ignore_ascii_case("Scheme") {
            scheme = Some(value);
        } else if name.eq_ignore_ascii_case("Host") {
            host = Some(value);
        } else if name.eq_ignore_ascii_case("Port") {
            port = Some(value);
        } else {
            return Err(McmpError::invalid_field(name));
        }
    }

    let epoch = manager.restart_epoch();
    if let Some(route) = route {
        let node = manager
            .registry()
            .node_by_route(route)
            .ok_or_else(|| McmpError::node_not_found(route))?;
        let up = manager.health().node_is_up(&node, LOAD_PING);
        debug!(route, up, "PING node");
        return Ok(McmpResponse::plain(format!(
            "Type=PING-RSP&JVMRoute={}&State={}&id={}\n",
            route,
            state(up),
            epoch
        )));
    }

    match (scheme, host, port) {
        (None, None, None) => Ok(McmpResponse::plain(format!(
            "Type=PING-RSP&State=OK&id={}\n",
            epoch
        ))),
        (Some(scheme), Some(host), Some(port)) => {
            let up = manager.health().host_is_up(scheme, host, port);
            debug!(scheme, host, port, up, "PING host");
            Ok(McmpResponse::plain(format!(
                "Type=PING-RSP&State={}&id={}\n",
                state(up),
                epoch
            )))
        }
        _ => Err(McmpError::syntax(MISSING_FIELDS)),
    }
}

/// Release string reported by VERSION
pub fn release() -> String {
    format!("{}/{}", PKG_NAME, VERSION)
}

/// Handle a VERSION message
pub fn process_version(format: OutputFormat) -> McmpResponse {
    let body = match format {
        OutputFormat::Plain => format!("release: {}, protocol: {}\n", release(), VERSION_PROTOCOL),
        OutputFormat::Xml => format!(
            "<?xml version=\"1.0\" standalone=\"yes\" ?>\n<version><release>{}</release><protocol>{}</protocol></version>\n",
            release(),
            VERSION_PROTOCOL
        ),
    };
    McmpResponse::formatted(format, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Range;
    use crate::config::Config;
    use crate::health::{HealthBridge, HealthProber};
    use crate::registry::Registry;
    use crate::stats::StatsBlock;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedProber(bool);

    impl HealthProber for FixedProber {
        fn probe(&self, _scheme: &str, _host: &str, _port: &str, _timeout: Duration) -> bool {
            self.0
        }
    }

    fn manager(up: bool) -> Manager {
        let config = Config::default();
        let registry = Arc::new(Registry::in_memory(&config.manager));
        let health = HealthBridge::new(Arc::new(FixedProber(up)), Arc::new(StatsBlock::new()));
        Manager::new(registry, health, &config).with_restart_epoch(1700000000)
    }

    fn run(manager: &Manager, verb: &str, body: &str) -> McmpResult<McmpResponse> {
        manager.execute(verb, body.as_bytes(), Range::Context, OutputFormat::Plain)
    }

    #[test]
    fn test_status() {
        let manager = manager(true);
        run(&manager, "CONFIG", "JVMRoute=n1").unwrap();
        let version = manager.registry().version();

        let response = run(&manager, "STATUS", "JVMRoute=n1&Load=75").unwrap();
        assert_eq!(response.body, "Type=STATUS-RSP&JVMRoute=n1&State=OK&id=1700000000\n");
        let node = manager.registry().node_by_route("n1").unwrap();
        assert_eq!(manager.stats().get(node.id).lbfactor, 75);
        assert_eq!(manager.registry().version(), version);
    }

    #[test]
    fn test_status_not_up() {
        let manager = manager(false);
        run(&manager, "CONFIG", "JVMRoute=n1").unwrap();
        let response = run(&manager, "STATUS", "JVMRoute=n1&Load=10").unwrap();
        assert_eq!(response.body, "Type=STATUS-RSP&JVMRoute=n1&State=NOTOK&id=1700000000\n");
    }

    #[test]
    fn test_status_errors() {
        let manager = manager(true);
        assert_eq!(
            run(&manager, "STATUS", "JVMRoute=ghost&Load=1").unwrap_err(),
            McmpError::node_not_found("ghost")
        );
        assert_eq!(
            run(&manager, "STATUS", "JVMRoute=n1&Weight=3").unwrap_err(),
            McmpError::invalid_field("Weight")
        );
    }

    #[test]
    fn test_ping_variants() {
        let manager = manager(true);
        assert_eq!(
            run(&manager, "PING", "").unwrap().body,
            "Type=PING-RSP&State=OK&id=1700000000\n"
        );
        assert_eq!(
            run(&manager, "PING", "Scheme=http&Host=10.0.0.1&Port=8080").unwrap().body,
            "Type=PING-RSP&State=OK&id=1700000000\n"
        );
        assert_eq!(
            run(&manager, "PING", "Scheme=http&Host=10.0.0.1").unwrap_err(),
            McmpError::syntax(MISSING_FIELDS)
        );

        run(&manager, "CONFIG", "JVMRoute=n1").unwrap();
        assert_eq!(
            run(&manager, "PING", "JVMRoute=n1").unwrap().body,
            "Type=PING-RSP&JVMRoute=n1&State=OK&id=1700000000\n"
        );
    }

    #[test]
    fn test_ping_host_down() {
        let manager = manager(false);
        assert_eq!(
            run(&manager, "PING", "Scheme=ajp&Host=10.0.0.1&Port=8009").unwrap().body,
            "Type=PING-RSP&State=NOTOK&id=1700000000\n"
        );
    }

    #[test]
    fn test_version() {
        let plain = process_version(OutputFormat::Plain);
        assert_eq!(plain.content_type, "text/plain");
        assert_eq!(plain.body, format!("release: {}, protocol: 0.2.1\n", release()));

        let xml = process_version(OutputFormat::Xml);
        assert_eq!(xml.content_type, "text/xml");
        assert!(xml.body.starts_with("<?xml version=\"1.0\" standalone=\"yes\" ?>\n<version>"));
        assert!(xml.body.ends_with("<protocol>0.2.1</protocol></version>\n"));
    }
}
