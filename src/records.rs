//! Row types stored in the registry tables
//!
//! Each table holds one of these records. Field sizes mirror the limits
//! enforced on the wire: a CONFIG field longer than its limit is a syntax
//! error, while aliases and context paths are truncated to fit.

use crate::table::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum JVMRoute length (exclusive)
pub const JVMROUTE_SIZE: usize = 80;
/// Maximum balancer name length (exclusive)
pub const BALANCER_SIZE: usize = 40;
/// Maximum domain (LBGroup) length (exclusive)
pub const DOMAIN_SIZE: usize = 20;
/// Maximum connector host length (exclusive)
pub const HOST_NODE_SIZE: usize = 64;
/// Maximum connector port length (exclusive)
pub const PORT_NODE_SIZE: usize = 7;
/// Maximum connector type length (exclusive)
pub const SCHEME_SIZE: usize = 16;
/// Maximum sticky cookie / path parameter name length (exclusive)
pub const COOKIE_SIZE: usize = 30;
/// Virtual host aliases are truncated to this many bytes
pub const HOST_ALIAS_SIZE: usize = 100;
/// Context paths are truncated to this many bytes
pub const CONTEXT_SIZE: usize = 80;
/// Maximum session id length (exclusive)
pub const SESSIONID_SIZE: usize = 128;

/// Balancer name used when neither the message nor the configuration names one
pub const DEFAULT_BALANCER: &str = "mycluster";

/// Load-balancing policy shared by a set of nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balancer {
    pub id: usize,
    pub name: String,
    pub sticky_session: bool,
    pub sticky_session_cookie: String,
    pub sticky_session_path: String,
    pub sticky_session_remove: bool,
    pub sticky_session_force: bool,
    /// Seconds to wait for an available worker
    pub timeout_secs: i64,
    pub max_attempts: i64,
}

impl Balancer {
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            sticky_session: true,
            sticky_session_cookie: "JSESSIONID".to_string(),
            sticky_session_path: "jsessionid".to_string(),
            sticky_session_remove: false,
            sticky_session_force: true,
            timeout_secs: 0,
            max_attempts: 1,
        }
    }
}

/// Packet flushing mode of a node's connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushPackets {
    #[default]
    Off,
    On,
    Auto,
}

impl FlushPackets {
    /// Numeric code used in DUMP output
    pub fn code(&self) -> i32 {
        match self {
            FlushPackets::Off => 0,
            FlushPackets::On => 1,
            FlushPackets::Auto => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FlushPackets::Off => "Off",
            FlushPackets::On => "On",
            FlushPackets::Auto => "Auto",
        }
    }
}

/// Lifecycle of a node row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Serving traffic
    #[default]
    Active,
    /// Removed by a node-wide REMOVE-APP; a compatible CONFIG revives it
    Removed,
    /// Replaced by an incompatible announcement; no longer reachable by JVMRoute
    Superseded,
}

/// An application-server node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: usize,
    pub jvm_route: String,
    pub balancer: String,
    /// Load-balancer group
    pub domain: String,
    pub host: String,
    pub port: String,
    /// Connector scheme (ajp, http, https, ws, wss)
    pub scheme: String,
    pub reversed: bool,
    pub flush_packets: FlushPackets,
    pub flush_wait_ms: i64,
    pub ping_secs: i64,
    pub smax: i64,
    pub ttl_secs: i64,
    pub timeout_secs: i64,
    pub state: NodeState,
    pub last_clean_try: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(jvm_route: &str, balancer: &str, smax: i64) -> Self {
        Self {
            id: 0,
            jvm_route: jvm_route.to_string(),
            balancer: balancer.to_string(),
            domain: String::new(),
            host: "localhost".to_string(),
            port: "8009".to_string(),
            scheme: "ajp".to_string(),
            reversed: false,
            flush_packets: FlushPackets::Off,
            flush_wait_ms: 10,
            ping_secs: 10,
            smax,
            ttl_secs: 60,
            timeout_secs: 0,
            state: NodeState::Active,
            last_clean_try: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    pub fn is_removed(&self) -> bool {
        self.state != NodeState::Active
    }

    /// Whether `other` can take over this row without rebuilding the
    /// connection pool behind it.
    pub fn is_compatible(&self, other: &Node) -> bool {
        self.balancer == other.balancer
            && self.host == other.host
            && self.port == other.port
            && self.scheme == other.scheme
            && self.reversed == other.reversed
            && self.smax == other.smax
            && self.ttl_secs == other.ttl_secs
    }

    /// JVMRoute as shown in snapshots
    pub fn display_route(&self) -> &str {
        match self.state {
            NodeState::Superseded => "REMOVED",
            _ => &self.jvm_route,
        }
    }
}

/// One alias of a node's virtual host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: usize,
    pub node: usize,
    pub vhost: u32,
    pub alias: String,
}

/// Status of a deployed context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Enabled,
    Disabled,
    Stopped,
    Removed,
}

impl ContextStatus {
    pub fn code(&self) -> i32 {
        match self {
            ContextStatus::Enabled => 1,
            ContextStatus::Disabled => 2,
            ContextStatus::Stopped => 3,
            ContextStatus::Removed => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::Enabled => "ENABLED",
            ContextStatus::Disabled => "DISABLED",
            ContextStatus::Stopped => "STOPPED",
            ContextStatus::Removed => "REMOVED",
        }
    }
}

/// A deployed application path on one virtual host of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: usize,
    pub node: usize,
    pub vhost: u32,
    pub path: String,
    pub status: ContextStatus,
    /// Requests currently being served on this context
    pub nb_requests: i64,
}

/// Session affinity record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId {
    pub id: usize,
    pub session_id: String,
    pub jvm_route: String,
}

/// Domain membership of a node that has been purged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: usize,
    pub domain: String,
    pub jvm_route: String,
    pub balancer: String,
}

impl Record for Balancer {
    type Key = String;

    fn key(&self) -> Option<String> {
        Some(self.name.clone())
    }
    fn id(&self) -> usize {
        self.id
    }
    fn set_id(&mut self, id: usize) {
        self.id = id;
    }
}

impl Record for Node {
    type Key = String;

    fn key(&self) -> Option<String> {
        match self.state {
            NodeState::Superseded => None,
            _ => Some(self.jvm_route.clone()),
        }
    }
    fn id(&self) -> usize {
        self.id
    }
    fn set_id(&mut self, id: usize) {
        self.id = id;
    }
}

impl Record for Host {
    type Key = (usize, u32, String);

    fn key(&self) -> Option<Self::Key> {
        Some((self.node, self.vhost, self.alias.clone()))
    }
    fn id(&self) -> usize {
        self.id
    }
    fn set_id(&mut self, id: usize) {
        self.id = id;
    }
}

impl Record for Context {
    type Key = (usize, u32, String);

    fn key(&self) -> Option<Self::Key> {
        Some((self.node, self.vhost, self.path.clone()))
    }
    fn id(&self) -> usize {
        self.id
    }
    fn set_id(&mut self, id: usize) {
        self.id = id;
    }
}

impl Record for SessionId {
    type Key = String;

    fn key(&self) -> Option<String> {
        Some(self.session_id.clone())
    }
    fn id(&self) -> usize {
        self.id
    }
    fn set_id(&mut self, id: usize) {
        self.id = id;
    }
}

impl Record for Domain {
    type Key = (String, String);

    fn key(&self) -> Option<Self::Key> {
        Some((self.jvm_route.clone(), self.balancer.clone()))
    }
    fn id(&self) -> usize {
        self.id
    }
    fn set_id(&mut self, id: usize) {
        self.id = id;
    }
}

/// Truncate `value` to fewer than `size` bytes without splitting a character
pub fn truncate_field(value: &str, size: usize) -> String {
    if value.len() < size {
        return value.to_string();
    }
    let mut end = size.saturating_sub(1);
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
