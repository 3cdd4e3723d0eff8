//! DUMP and INFO snapshots
//!
//! Both read the registry without taking a lock. DUMP lists raw table
//! rows; INFO joins nodes with their worker statistics.

use crate::command::{McmpResponse, OutputFormat};
use crate::registry::Registry;
use crate::stats::StatsBlock;
use std::fmt::Write as _;

const XML_HEADER: &str = "<?xml version=\"1.0\" standalone=\"yes\" ?>\n";

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn flag(value: bool) -> i32 {
    i32::from(value)
}

/// Handle a DUMP message
pub fn process_dump(registry: &Registry, format: OutputFormat) -> McmpResponse {
    McmpResponse::formatted(format, render_dump(registry, format))
}

/// Handle an INFO message
pub fn process_info(registry: &Registry, stats: &StatsBlock, format: OutputFormat) -> McmpResponse {
    McmpResponse::formatted(format, render_info(registry, stats, format, false))
}

pub fn render_dump(registry: &Registry, format: OutputFormat) -> String {
    let mut out = String::new();
    let xml = format == OutputFormat::Xml;

    if xml {
        out.push_str(XML_HEADER);
        out.push_str("<Dump><Balancers>");
    }
    for b in registry.balancers() {
        if xml {
            let _ = write!(
                out,
                "<Balancer id=\"{}\" name=\"{}\"><StickySession><Enabled>{}</Enabled><Cookie>{}</Cookie><Path>{}</Path><Remove>{}</Remove><Force>{}</Force></StickySession><Timeout>{}</Timeout><MaxAttempts>{}</MaxAttempts></Balancer>",
                b.id,
                escape(&b.name),
                flag(b.sticky_session),
                escape(&b.sticky_session_cookie),
                escape(&b.sticky_session_path),
                flag(b.sticky_session_remove),
                flag(b.sticky_session_force),
                b.timeout_secs,
                b.max_attempts
            );
        } else {
            let _ = writeln!(
                out,
                "balancer: [{}] Name: {} Sticky: {} [{}]/[{}] remove: {} force: {} Timeout: {} maxAttempts: {}",
                b.id,
                b.name,
                flag(b.sticky_session),
                b.sticky_session_cookie,
                b.sticky_session_path,
                flag(b.sticky_session_remove),
                flag(b.sticky_session_force),
                b.timeout_secs,
                b.max_attempts
            );
        }
    }

    if xml {
        out.push_str("</Balancers><Nodes>");
    }
    for n in registry.nodes() {
        if xml {
            let _ = write!(
                out,
                "<Node id=\"{}\"><Balancer>{}</Balancer><JVMRoute>{}</JVMRoute><LBGroup>{}</LBGroup><Host>{}</Host><Port>{}</Port><Type>{}</Type><FlushPackets>{}</FlushPackets><FlushWait>{}</FlushWait><Ping>{}</Ping><Smax>{}</Smax><Ttl>{}</Ttl><Timeout>{}</Timeout></Node>",
                n.id,
                escape(&n.balancer),
                escape(n.display_route()),
                escape(&n.domain),
                escape(&n.host),
                escape(&n.port),
                escape(&n.scheme),
                n.flush_packets.code(),
                n.flush_wait_ms / 1000,
                n.ping_secs,
                n.smax,
                n.ttl_secs,
                n.timeout_secs
            );
        } else {
            let _ = writeln!(
                out,
                "node: [{}:{}],Balancer: {},JVMRoute: {},LBGroup: [{}],Host: {},Port: {},Type: {},flushpackets: {},flushwait: {},ping: {},smax: {},ttl: {},timeout: {}",
                n.id,
                n.id,
                n.balancer,
                n.display_route(),
                n.domain,
                n.host,
                n.port,
                n.scheme,
                n.flush_packets.code(),
                n.flush_wait_ms / 1000,
                n.ping_secs,
                n.smax,
                n.ttl_secs,
                n.timeout_secs
            );
        }
    }

    if xml {
        out.push_str("</Nodes><Hosts>");
    }
    for h in registry.hosts() {
        if xml {
            let _ = write!(
                out,
                "<Host id=\"{}\" alias=\"{}\"><Vhost>{}</Vhost><Node>{}</Node></Host>",
                h.id,
                escape(&h.alias),
                h.vhost,
                h.node
            );
        } else {
            let _ = writeln!(out, "host: {} [{}] vhost: {} node: {}", h.id, h.alias, h.vhost, h.node);
        }
    }

    if xml {
        out.push_str("</Hosts><Contexts>");
    }
    for c in registry.contexts() {
        if xml {
            let _ = write!(
                out,
                "<Context id=\"{}\" path=\"{}\"><Vhost>{}</Vhost><Node>{}</Node><Status id=\"{}\">{}</Status></Context>",
                c.id,
                escape(&c.path),
                c.vhost,
                c.node,
                c.status.code(),
                c.status.as_str()
            );
        } else {
            let _ = writeln!(
                out,
                "context: {} [{}] vhost: {} node: {} status: {}",
                c.id,
                c.path,
                c.vhost,
                c.node,
                c.status.code()
            );
        }
    }

    if xml {
        out.push_str("</Contexts></Dump>");
    }
    out
}

/// INFO body; `reduced` leaves out virtual hosts and contexts
pub fn render_info(
    registry: &Registry,
    stats: &StatsBlock,
    format: OutputFormat,
    reduced: bool,
) -> String {
    let mut out = String::new();
    let xml = format == OutputFormat::Xml;

    if xml {
        out.push_str(XML_HEADER);
        out.push_str("<Info><Nodes>");
    }
    for n in registry.nodes() {
        let worker = stats.get(n.id);
        if xml {
            let _ = write!(
                out,
                "<Node id=\"{}\" name=\"{}\"><Balancer>{}</Balancer><LBGroup>{}</LBGroup><Host>{}</Host><Port>{}</Port><Type>{}</Type><Flushpackets>{}</Flushpackets><Flushwait>{}</Flushwait><Ping>{}</Ping><Smax>{}</Smax><Ttl>{}</Ttl><Elected>{}</Elected><Read>{}</Read><Transfered>{}</Transfered><Connected>{}</Connected><Load>{}</Load></Node>",
                n.id,
                escape(n.display_route()),
                escape(&n.balancer),
                escape(&n.domain),
                escape(&n.host),
                escape(&n.port),
                escape(&n.scheme),
                n.flush_packets.label(),
                n.flush_wait_ms / 1000,
                n.ping_secs,
                n.smax,
                n.ttl_secs,
                worker.elected,
                worker.read,
                worker.transferred,
                worker.busy,
                worker.lbfactor
            );
        } else {
            let _ = writeln!(
                out,
                "Node: [{}],Name: {},Balancer: {},LBGroup: {},Host: {},Port: {},Type: {},Flushpackets: {},Flushwait: {},Ping: {},Smax: {},Ttl: {},Elected: {},Read: {},Transfered: {},Connected: {},Load: {}",
                n.id,
                n.display_route(),
                n.balancer,
                n.domain,
                n.host,
                n.port,
                n.scheme,
                n.flush_packets.label(),
                n.flush_wait_ms / 1000,
                n.ping_secs,
                n.smax,
                n.ttl_secs,
                worker.elected,
                worker.read,
                worker.transferred,
                worker.busy,
                worker.lbfactor
            );
        }
    }
    if xml {
        out.push_str("</Nodes>");
    }

    if !reduced {
        if xml {
            out.push_str("<Vhosts>");
        }
        for h in registry.hosts() {
            if xml {
                let _ = write!(
                    out,
                    "<Vhost id=\"{}\" alias=\"{}\"><Node id=\"{}\"/></Vhost>",
                    h.vhost,
                    escape(&h.alias),
                    h.node
                );
            } else {
                let _ = writeln!(out, "Vhost: [{}:{}:{}], Alias: {}", h.node, h.vhost, h.id, h.alias);
            }
        }
        if xml {
            out.push_str("</Vhosts><Contexts>");
        }
        for c in registry.contexts() {
            if xml {
                let _ = write!(
                    out,
                    "<Context id=\"{}\"><Status id=\"{}\">{}</Status><Context>{}</Context><Node id=\"{}\"/><Vhost id=\"{}\"/></Context>",
                    c.id,
                    c.status.code(),
                    c.status.as_str(),
                    escape(&c.path),
                    c.node,
                    c.vhost
                );
            } else {
                let _ = writeln!(
                    out,
                    "Context: [{}:{}:{}], Context: {}, Status: {}",
                    c.node,
                    c.vhost,
                    c.id,
                    c.path,
                    c.status.as_str()
                );
            }
        }
        if xml {
            out.push_str("</Contexts>");
        }
    }

    if xml {
        out.push_str("</Info>");
    }
    out
}

/// Session ids and their per-node counts, for the status page
pub fn render_sessions(registry: &Registry) -> String {
    let sessions = registry.sessions();
    if sessions.is_empty() {
        return String::new();
    }
    let mut out = String::from("SessionIDs:\n");
    for s in &sessions {
        let _ = writeln!(out, "id: {} route: {}", s.session_id, s.jvm_route);
    }
    for n in registry.nodes().iter().filter(|n| !n.is_removed()) {
        let _ = writeln!(out, "Node: {},Num sessions: {}", n.jvm_route, registry.count_sessions(&n.jvm_route));
    }
    out
}

/// Domain memberships remembered for purged nodes
pub fn render_domains(registry: &Registry) -> String {
    let domains = registry.domains();
    if domains.is_empty() {
        return String::new();
    }
    let mut out = String::from("LBGroup:\n");
    for d in &domains {
        let _ = writeln!(out, "dom: {} route: {} balancer: {}", d.domain, d.jvm_route, d.balancer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Manager, Range};
    use crate::config::Config;
    use crate::health::{HealthBridge, NoopProber};
    use std::sync::Arc;

    fn populated() -> Manager {
        let config = Config::default();
        let registry = Arc::new(Registry::in_memory(&config.manager));
        let health = HealthBridge::new(Arc::new(NoopProber), Arc::new(StatsBlock::new()));
        let manager = Manager::new(registry, health, &config);
        manager
            .execute(
                "CONFIG",
                b"JVMRoute=node1&Domain=dom1&Host=10.0.0.1&Port=8009&flushpackets=on&flushwait=3&Alias=localhost&Context=/app",
                Range::Context,
                OutputFormat::Plain,
            )
            .unwrap();
        manager
    }

    #[test]
    fn test_dump_plain() {
        let manager = populated();
        let dump = render_dump(manager.registry(), OutputFormat::Plain);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(
            lines,
            vec![
                "balancer: [1] Name: mycluster Sticky: 1 [JSESSIONID]/[jsessionid] remove: 0 force: 1 Timeout: 0 maxAttempts: 1",
                "node: [1:1],Balancer: mycluster,JVMRoute: node1,LBGroup: [dom1],Host: 10.0.0.1,Port: 8009,Type: ajp,flushpackets: 1,flushwait: 3,ping: 10,smax: 26,ttl: 60,timeout: 0",
                "host: 1 [localhost] vhost: 1 node: 1",
                "context: 1 [/app] vhost: 1 node: 1 status: 3",
            ]
        );
    }

    #[test]
    fn test_dump_xml() {
        let manager = populated();
        let dump = render_dump(manager.registry(), OutputFormat::Xml);
        assert!(dump.starts_with(XML_HEADER));
        assert!(dump.contains("<Dump><Balancers><Balancer id=\"1\" name=\"mycluster\">"));
        assert!(dump.contains("<JVMRoute>node1</JVMRoute><LBGroup>dom1</LBGroup>"));
        assert!(dump.contains("<Host id=\"1\" alias=\"localhost\"><Vhost>1</Vhost><Node>1</Node></Host>"));
        assert!(dump.contains("<Status id=\"3\">STOPPED</Status>"));
        assert!(dump.ends_with("</Contexts></Dump>"));
    }

    #[test]
    fn test_info_merges_stats() {
        let manager = populated();
        manager.stats().record_elected(1);
        manager.stats().record_read(1, 512);
        manager.stats().set_busy(1, 2);
        manager.stats().set_lbfactor(1, 40);

        let info = render_info(manager.registry(), manager.stats(), OutputFormat::Plain, false);
        let lines: Vec<&str> = info.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Node: [1],Name: node1,Balancer: mycluster,LBGroup: dom1,Host: 10.0.0.1,Port: 8009,Type: ajp,Flushpackets: On,Flushwait: 3,Ping: 10,Smax: 26,Ttl: 60,Elected: 1,Read: 512,Transfered: 0,Connected: 2,Load: 40",
                "Vhost: [1:1:1], Alias: localhost",
                "Context: [1:1:1], Context: /app, Status: STOPPED",
            ]
        );

        let reduced = render_info(manager.registry(), manager.stats(), OutputFormat::Plain, true);
        assert_eq!(reduced.lines().count(), 1);
    }

    #[test]
    fn test_info_xml() {
        let manager = populated();
        let info = process_info(manager.registry(), manager.stats(), OutputFormat::Xml);
        assert_eq!(info.content_type, "text/xml");
        assert!(info.body.contains("<Info><Nodes><Node id=\"1\" name=\"node1\">"));
        assert!(info.body.contains("<Vhosts><Vhost id=\"1\" alias=\"localhost\"><Node id=\"1\"/></Vhost></Vhosts>"));
        assert!(info.body.contains("<Context id=\"1\"><Status id=\"3\">STOPPED</Status><Context>/app</Context>"));
        assert!(info.body.ends_with("</Contexts></Info>"));
    }

    #[test]
    fn test_sessions_and_domains() {
        let mut config = Config::default();
        config.manager.max_sessionid = 4;
        let registry = Arc::new(Registry::in_memory(&config.manager));
        let health = HealthBridge::new(Arc::new(NoopProber), Arc::new(StatsBlock::new()));
        let manager = Manager::new(Arc::clone(&registry), health, &config);
        assert!(render_sessions(&registry).is_empty());
        assert!(render_domains(&registry).is_empty());

        for body in [&b"JVMRoute=node1"[..], b"JVMRoute=node2&Domain=dom1"] {
            manager.execute("CONFIG", body, Range::Context, OutputFormat::Plain).unwrap();
        }
        registry.insert_session("abc", "node1").unwrap();
        registry.insert_session("def", "node1").unwrap();

        let sessions = render_sessions(&registry);
        let lines: Vec<&str> = sessions.lines().collect();
        assert_eq!(
            lines,
            vec![
                "SessionIDs:",
                "id: abc route: node1",
                "id: def route: node1",
                "Node: node1,Num sessions: 2",
                "Node: node2,Num sessions: 0",
            ]
        );

        manager
            .execute("REMOVE-APP", b"JVMRoute=node2", Range::Node, OutputFormat::Plain)
            .unwrap();
        registry
            .purge_removed_nodes(std::time::Duration::from_secs(60), manager.stats())
            .unwrap();
        assert_eq!(
            render_domains(&registry),
            "LBGroup:\ndom: dom1 route: node2 balancer: mycluster\n"
        );
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a&b"), "a&amp;b");
        assert_eq!(escape("<'x'>\""), "&lt;&apos;x&apos;&gt;&quot;");
        assert_eq!(escape("plain"), "plain");
    }
}
