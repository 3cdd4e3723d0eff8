//! Health-check bridge used by STATUS and PING
//!
//! Probing itself sits behind [`HealthProber`]; the bridge applies the
//! load value a node reports to the worker statistics and turns probe
//! results into an up/not-up verdict.

use crate::records::Node;
use crate::stats::StatsBlock;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Load value meaning "node broken"
pub const LOAD_BROKEN: i64 = -1;
/// Load value used by PING: probe without changing the load factor
pub const LOAD_PING: i64 = -2;

/// Liveness probe transport
pub trait HealthProber: Send + Sync {
    /// Whether a connection to `scheme://host:port` can be made within `timeout`
    fn probe(&self, scheme: &str, host: &str, port: &str, timeout: Duration) -> bool;
}

/// Probe by opening a TCP connection
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

impl HealthProber for TcpProber {
    fn probe(&self, scheme: &str, host: &str, port: &str, timeout: Duration) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs = match (host, port.parse::<u16>().unwrap_or(0)).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(scheme, host, port, error = %e, "Health check failed (resolve error)");
                return false;
            }
        };

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(_stream) => {
                    debug!(scheme, %addr, "Health check passed (TCP connect)");
                    return true;
                }
                Err(e) => {
                    debug!(scheme, %addr, error = %e, "Health check failed (connection error)");
                }
            }
        }
        false
    }
}

/// Prober that reports every target as reachable
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProber;

impl HealthProber for NoopProber {
    fn probe(&self, _scheme: &str, _host: &str, _port: &str, _timeout: Duration) -> bool {
        true
    }
}

/// Connects STATUS/PING to the prober and the worker statistics
#[derive(Clone)]
pub struct HealthBridge {
    prober: Arc<dyn HealthProber>,
    stats: Arc<StatsBlock>,
    timeout: Duration,
}

impl HealthBridge {
    pub fn new(prober: Arc<dyn HealthProber>, stats: Arc<StatsBlock>) -> Self {
        Self {
            prober,
            stats,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn stats(&self) -> &Arc<StatsBlock> {
        &self.stats
    }

    /// Apply a reported load to the node's worker and return whether it is up.
    ///
    /// `-1` marks the worker broken without probing, `-2` only probes, `0`
    /// probes then puts the worker on hot standby, and `1..=100` probes then
    /// sets the load factor.
    pub fn node_is_up(&self, node: &Node, load: i64) -> bool {
        if load >= 0 || load == LOAD_PING {
            let timeout = Duration::from_secs(node.ping_secs.max(1) as u64);
            if !self
                .prober
                .probe(&node.scheme, &node.host, &node.port, timeout)
            {
                self.stats.set_in_error(node.id);
                return false;
            }
        }

        match load {
            LOAD_PING => {}
            LOAD_BROKEN => self.stats.set_in_error(node.id),
            0 => self.stats.set_hot_standby(node.id),
            load if load > 0 => self.stats.set_lbfactor(node.id, load.min(100)),
            _ => {}
        }
        true
    }

    pub fn host_is_up(&self, scheme: &str, host: &str, port: &str) -> bool {
        self.prober.probe(scheme, host, port, self.timeout)
    }
}
