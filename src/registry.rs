//! Versioned registry of balancers, nodes, hosts, contexts, session ids
//! and domains
//!
//! Reads are lock-free snapshots. Every mutation of the node topology goes
//! through [`Registry::with_node_lock`]; pure context updates go through
//! [`Registry::with_context_lock`]. The two scopes are never held together.

use crate::config::ManagerConfig;
use crate::error::{McmpError, McmpResult};
use crate::lock::{ScopeGuard, ScopeLock};
use crate::records::{
    Balancer, Context, ContextStatus, Domain, Host, Node, NodeState, SessionId, JVMROUTE_SIZE,
    SESSIONID_SIZE,
};
use crate::stats::StatsBlock;
use crate::table::{Record, SlotTable, TableError};
use crate::version::{StoredVersion, VersionClock};
use anyhow::Context as _;
use chrono::Utc;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Occupied rows per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableUsage {
    pub balancers: usize,
    pub nodes: usize,
    pub hosts: usize,
    pub contexts: usize,
    pub sessions: usize,
    pub domains: usize,
}

/// The shared cluster topology
pub struct Registry {
    balancers: SlotTable<Balancer>,
    nodes: SlotTable<Node>,
    hosts: SlotTable<Host>,
    contexts: SlotTable<Context>,
    sessions: SlotTable<SessionId>,
    domains: SlotTable<Domain>,
    version: VersionClock,
    node_lock: ScopeLock,
    context_lock: ScopeLock,
    storage: Option<PathBuf>,
}

fn storage_file(dir: &Path, suffix: &str) -> PathBuf {
    dir.join(format!("manager.{}", suffix))
}

impl Registry {
    fn with_locks(config: &ManagerConfig, node_lock: ScopeLock, context_lock: ScopeLock) -> Self {
        Self {
            balancers: SlotTable::new("balancer", config.max_node),
            nodes: SlotTable::new("node", config.max_node),
            hosts: SlotTable::new("host", config.max_host),
            contexts: SlotTable::new("context", config.max_context),
            sessions: SlotTable::new("sessionid", config.max_sessionid),
            domains: SlotTable::new("domain", config.max_node),
            version: VersionClock::default(),
            node_lock,
            context_lock,
            storage: None,
        }
    }

    /// Registry private to this process, without persistence
    pub fn in_memory(config: &ManagerConfig) -> Self {
        Self::with_locks(
            config,
            ScopeLock::local("node"),
            ScopeLock::local("context"),
        )
    }

    /// Registry whose locks are shared with other processes using the same
    /// storage directory, restoring persisted tables when enabled.
    pub fn open(config: &ManagerConfig) -> anyhow::Result<Self> {
        let dir = config.storage_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;

        let node_lock = ScopeLock::shared("node", &storage_file(&dir, "node.lock"))
            .context("Failed to open node lock file")?;
        let context_lock = ScopeLock::shared("context", &storage_file(&dir, "context.lock"))
            .context("Failed to open context lock file")?;

        let mut registry = Self::with_locks(config, node_lock, context_lock);
        if config.persist_slots {
            registry.load(&dir)?;
            registry.storage = Some(dir);
        }
        Ok(registry)
    }

    fn load(&self, dir: &Path) -> anyhow::Result<()> {
        let balancers = self.balancers.load(&storage_file(dir, "balancer"))?;
        let nodes = self.nodes.load(&storage_file(dir, "node"))?;
        let hosts = self.hosts.load(&storage_file(dir, "host"))?;
        let contexts = self.contexts.load(&storage_file(dir, "context"))?;
        let sessions = self.sessions.load(&storage_file(dir, "sessionid"))?;
        let domains = self.domains.load(&storage_file(dir, "domain"))?;

        let version_path = storage_file(dir, "version");
        match std::fs::read(&version_path) {
            Ok(data) => {
                let stored: StoredVersion = serde_json::from_slice(&data)
                    .with_context(|| format!("Corrupt version file {}", version_path.display()))?;
                self.version.restore(stored.version);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", version_path.display()))
            }
        }

        info!(
            dir = %dir.display(),
            balancers,
            nodes,
            hosts,
            contexts,
            sessions,
            domains,
            version = self.version.current(),
            "Registry restored"
        );
        Ok(())
    }

    /// Save every table when persistence is enabled
    pub fn persist(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.storage else {
            return Ok(());
        };
        // Hold the node lock so the saved tables describe one topology
        let _guard = self.node_lock.acquire()?;

        self.balancers.save(&storage_file(dir, "balancer"))?;
        self.nodes.save(&storage_file(dir, "node"))?;
        self.hosts.save(&storage_file(dir, "host"))?;
        self.contexts.save(&storage_file(dir, "context"))?;
        self.sessions.save(&storage_file(dir, "sessionid"))?;
        self.domains.save(&storage_file(dir, "domain"))?;

        let version = serde_json::to_vec(&StoredVersion {
            version: self.version.current(),
        })?;
        let version_path = storage_file(dir, "version");
        std::fs::write(&version_path, version)
            .with_context(|| format!("Failed to write {}", version_path.display()))?;

        info!(dir = %dir.display(), "Registry persisted");
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version.current()
    }

    pub fn version_clock(&self) -> &VersionClock {
        &self.version
    }

    pub fn usage(&self) -> TableUsage {
        TableUsage {
            balancers: self.balancers.used(),
            nodes: self.nodes.used(),
            hosts: self.hosts.used(),
            contexts: self.contexts.used(),
            sessions: self.sessions.used(),
            domains: self.domains.used(),
        }
    }

    pub fn balancer(&self, name: &str) -> Option<Balancer> {
        self.balancers.find(&name.to_string())
    }

    pub fn balancers(&self) -> Vec<Balancer> {
        self.balancers.rows()
    }

    pub fn node(&self, id: usize) -> Option<Node> {
        self.nodes.get(id)
    }

    /// Node announced under `route`, including one removed by REMOVE-APP
    pub fn node_by_route(&self, route: &str) -> Option<Node> {
        self.nodes.find(&route.to_string())
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.rows()
    }

    /// Reachable nodes belonging to `domain`, ordered by id
    pub fn nodes_in_domain(&self, domain: &str) -> Vec<Node> {
        self.nodes
            .filter(|n| n.state != NodeState::Superseded && n.domain == domain)
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.hosts.rows()
    }

    pub fn hosts_of_node(&self, node: usize) -> Vec<Host> {
        self.hosts.filter(|h| h.node == node)
    }

    /// First host row of `node` carrying `alias`
    pub fn find_host(&self, node: usize, alias: &str) -> Option<Host> {
        self.hosts
            .filter(|h| h.node == node && h.alias == alias)
            .into_iter()
            .next()
    }

    pub fn contexts(&self) -> Vec<Context> {
        self.contexts.rows()
    }

    pub fn contexts_of(&self, node: usize, vhost: u32) -> Vec<Context> {
        self.contexts.filter(|c| c.node == node && c.vhost == vhost)
    }

    pub fn find_context(&self, node: usize, vhost: u32, path: &str) -> Option<Context> {
        self.contexts.find(&(node, vhost, path.to_string()))
    }

    /// Contexts with `path` on any node
    pub fn contexts_with_path(&self, path: &str) -> Vec<Context> {
        self.contexts.filter(|c| c.path == path)
    }

    /// Configured size of the session id table; zero disables it
    pub fn session_capacity(&self) -> usize {
        self.sessions.max_size()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.rows()
    }

    pub fn find_session(&self, session_id: &str) -> Option<SessionId> {
        self.sessions.find(&session_id.to_string())
    }

    /// Record that `session_id` is served by `route`
    pub fn insert_session(&self, session_id: &str, route: &str) -> McmpResult<usize> {
        if session_id.is_empty() || session_id.len() >= SESSIONID_SIZE {
            return Err(McmpError::invalid_field("SessionId"));
        }
        if route.is_empty() || route.len() >= JVMROUTE_SIZE {
            return Err(McmpError::invalid_field("JVMRoute"));
        }
        self.sessions
            .insert_or_update(SessionId {
                id: 0,
                session_id: session_id.to_string(),
                jvm_route: route.to_string(),
            })
            .map_err(|e| McmpError::mem(format!("MEM: {}", e)))
    }

    pub fn remove_session(&self, session_id: &str) -> Option<SessionId> {
        self.sessions.remove_by_key(&session_id.to_string())
    }

    pub fn count_sessions(&self, route: &str) -> usize {
        self.sessions.filter(|s| s.jvm_route == route).len()
    }

    pub fn domains(&self) -> Vec<Domain> {
        self.domains.rows()
    }

    pub fn find_domain(&self, route: &str, balancer: &str) -> Option<Domain> {
        self.domains
            .find(&(route.to_string(), balancer.to_string()))
    }

    /// Run `f` with exclusive access to the node topology
    pub fn with_node_lock<R>(
        &self,
        f: impl FnOnce(&mut NodeScope<'_>) -> McmpResult<R>,
    ) -> McmpResult<R> {
        let guard = self.node_lock.acquire()?;
        let mut scope = NodeScope {
            registry: self,
            _guard: guard,
        };
        f(&mut scope)
    }

    /// Run `f` with exclusive access to context status and counters
    pub fn with_context_lock<R>(
        &self,
        f: impl FnOnce(&mut ContextScope<'_>) -> McmpResult<R>,
    ) -> McmpResult<R> {
        let guard = self.context_lock.acquire()?;
        let mut scope = ContextScope {
            registry: self,
            _guard: guard,
        };
        f(&mut scope)
    }

    /// Free tombstoned nodes whose worker is idle or whose first cleanup
    /// attempt is older than `timeout`. Returns the freed node ids.
    pub fn purge_removed_nodes(
        &self,
        timeout: Duration,
        stats: &StatsBlock,
    ) -> McmpResult<Vec<usize>> {
        self.with_node_lock(|scope| {
            let now = Utc::now();
            let mut freed = Vec::new();

            for node in scope.nodes.filter(|n| n.is_removed()) {
                let expired = node
                    .last_clean_try
                    .and_then(|first| (now - first).to_std().ok())
                    .map(|elapsed| elapsed >= timeout)
                    .unwrap_or(false);
                if stats.busy(node.id) > 0 && !expired {
                    if node.last_clean_try.is_none() {
                        scope.nodes.modify(node.id, |n| n.last_clean_try = Some(now));
                    }
                    debug!(node = node.id, route = %node.jvm_route, "Removed node still busy");
                    continue;
                }

                scope.remove_node_dependents(node.id);
                scope.nodes.remove(node.id);
                stats.reset(node.id);
                if !node.domain.is_empty() {
                    let domain = Domain {
                        id: 0,
                        domain: node.domain.clone(),
                        jvm_route: node.jvm_route.clone(),
                        balancer: node.balancer.clone(),
                    };
                    if let Err(e) = scope.domains.insert_or_update(domain) {
                        warn!(route = %node.jvm_route, error = %e, "Can't record domain of removed node");
                    }
                }
                info!(node = node.id, route = %node.jvm_route, "Removed node freed");
                freed.push(node.id);
            }

            if !freed.is_empty() {
                scope.bump_version();
            }
            Ok(freed)
        })
    }
}

/// Exclusive access to the node topology; see [`Registry::with_node_lock`]
pub struct NodeScope<'a> {
    registry: &'a Registry,
    _guard: ScopeGuard<'a>,
}

impl Deref for NodeScope<'_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        self.registry
    }
}

impl NodeScope<'_> {
    pub fn bump_version(&mut self) -> u64 {
        self.registry.version.bump()
    }

    pub fn upsert_balancer(&mut self, balancer: Balancer) -> Result<usize, TableError> {
        self.registry.balancers.insert_or_update(balancer)
    }

    /// Insert the node, or update the reachable row with the same JVMRoute in place
    pub fn store_node(&mut self, node: Node) -> Result<usize, TableError> {
        self.registry.nodes.insert_or_update(node)
    }

    /// Detach the node from its JVMRoute and drop its hosts and contexts
    pub fn supersede_node(&mut self, id: usize) -> Option<Node> {
        let node = self
            .registry
            .nodes
            .modify(id, |n| n.state = NodeState::Superseded)?;
        self.remove_node_dependents(id);
        debug!(node = id, route = %node.jvm_route, "Node superseded");
        Some(node)
    }

    pub fn mark_node_removed(&mut self, id: usize) -> Option<Node> {
        self.registry.nodes.modify(id, |n| {
            n.state = NodeState::Removed;
            n.last_clean_try = None;
        })
    }

    /// Drop every host and context of the node
    pub fn remove_node_dependents(&mut self, id: usize) -> (usize, usize) {
        let contexts = self.registry.contexts.remove_where(|c| c.node == id).len();
        let hosts = self.registry.hosts.remove_where(|h| h.node == id).len();
        (hosts, contexts)
    }

    pub fn store_host(&mut self, host: Host) -> Result<usize, TableError> {
        self.registry.hosts.insert_or_update(host)
    }

    /// Next unused virtual host id of the node
    pub fn next_vhost(&self, node: usize) -> u32 {
        self.registry
            .hosts
            .filter(|h| h.node == node)
            .iter()
            .map(|h| h.vhost)
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn remove_host(&mut self, id: usize) -> Option<Host> {
        self.registry.hosts.remove(id)
    }

    pub fn remove_hosts_of(&mut self, node: usize, vhost: u32) -> Vec<Host> {
        self.registry
            .hosts
            .remove_where(|h| h.node == node && h.vhost == vhost)
    }

    /// Insert the context, or update the status of the existing one with the same path
    pub fn store_context(&mut self, context: Context) -> Result<usize, TableError> {
        let key = context.key();
        match key.and_then(|k| self.registry.contexts.find(&k)) {
            Some(existing) => {
                let status = context.status;
                self.registry
                    .contexts
                    .modify(existing.id, |c| c.status = status);
                Ok(existing.id)
            }
            None => self.registry.contexts.insert_or_update(context),
        }
    }

    pub fn set_context_status(&mut self, id: usize, status: ContextStatus) -> Option<Context> {
        self.registry.contexts.modify(id, |c| c.status = status)
    }

    pub fn remove_context(&mut self, id: usize) -> Option<Context> {
        self.registry.contexts.remove(id)
    }

    pub fn remove_domain(&mut self, route: &str, balancer: &str) -> Option<Domain> {
        self.registry
            .domains
            .remove_by_key(&(route.to_string(), balancer.to_string()))
    }
}

/// Exclusive access to context rows; see [`Registry::with_context_lock`]
pub struct ContextScope<'a> {
    registry: &'a Registry,
    _guard: ScopeGuard<'a>,
}

impl Deref for ContextScope<'_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        self.registry
    }
}

impl ContextScope<'_> {
    /// Adjust the live request counter, never below zero
    pub fn add_requests(&mut self, id: usize, delta: i64) -> Option<Context> {
        self.registry
            .contexts
            .modify(id, |c| c.nb_requests = (c.nb_requests + delta).max(0))
    }
}
