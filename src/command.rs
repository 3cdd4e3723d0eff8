//! MCMP command dispatcher
//!
//! [`Manager`] owns the registry and the health bridge and routes each
//! decoded message to its handler by verb.

use crate::app::{process_app, AppAction};
use crate::config::{Config, ManagerConfig, NodeDefaults};
use crate::decoder::Fields;
use crate::error::{McmpError, McmpResult, COMMAND_UNSUPPORTED};
use crate::health::HealthBridge;
use crate::node_config::process_config;
use crate::registry::Registry;
use crate::report::{process_dump, process_info};
use crate::stats::StatsBlock;
use crate::status::{process_ping, process_status, process_version};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Verbs understood by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Config,
    EnableApp,
    DisableApp,
    StopApp,
    RemoveApp,
    Status,
    Ping,
    Dump,
    Info,
    Version,
    Error,
    AddId,
    RemoveId,
    Query,
}

impl Command {
    pub const ALL: [Command; 14] = [
        Command::Config,
        Command::EnableApp,
        Command::DisableApp,
        Command::StopApp,
        Command::RemoveApp,
        Command::Status,
        Command::Ping,
        Command::Dump,
        Command::Info,
        Command::Version,
        Command::Error,
        Command::AddId,
        Command::RemoveId,
        Command::Query,
    ];

    /// Case-insensitive verb lookup
    pub fn parse(verb: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(verb))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Config => "CONFIG",
            Command::EnableApp => "ENABLE-APP",
            Command::DisableApp => "DISABLE-APP",
            Command::StopApp => "STOP-APP",
            Command::RemoveApp => "REMOVE-APP",
            Command::Status => "STATUS",
            Command::Ping => "PING",
            Command::Dump => "DUMP",
            Command::Info => "INFO",
            Command::Version => "VERSION",
            Command::Error => "ERROR",
            Command::AddId => "ADDID",
            Command::RemoveId => "REMOVEID",
            Command::Query => "QUERY",
        }
    }

    /// Lifecycle action for the *-APP verbs
    pub fn app_action(&self) -> Option<AppAction> {
        match self {
            Command::EnableApp => Some(AppAction::Enable),
            Command::DisableApp => Some(AppAction::Disable),
            Command::StopApp => Some(AppAction::Stop),
            Command::RemoveApp => Some(AppAction::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Granularity of a lifecycle command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Range {
    /// One application on one virtual host
    #[default]
    Context,
    /// Every application of the node
    Node,
    /// Every node of a load-balancer group
    Domain,
}

impl Range {
    /// Range implied by an MCMP request target: `*` or a path ending in `/*` is node-wide
    pub fn from_target(path: &str) -> Self {
        if path == "*" || path.ends_with("/*") {
            Range::Node
        } else {
            Range::Context
        }
    }

    /// Range named by the `Range` parameter of the management endpoint
    pub fn from_param(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("NODE") {
            Some(Range::Node)
        } else if value.eq_ignore_ascii_case("DOMAIN") {
            Some(Range::Domain)
        } else if value.eq_ignore_ascii_case("CONTEXT") {
            Some(Range::Context)
        } else {
            None
        }
    }
}

/// Who sent the command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Origin {
    /// An application server speaking MCMP
    #[default]
    Node,
    /// The management endpoint
    Console,
}

/// Response body flavor chosen from the `Accept` header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Plain,
    Xml,
}

impl OutputFormat {
    pub fn from_accept(accept: Option<&str>) -> Self {
        match accept {
            Some(value) if value.contains("text/xml") => OutputFormat::Xml,
            _ => OutputFormat::Plain,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Plain => "text/plain",
            OutputFormat::Xml => "text/xml",
        }
    }
}

/// A successful command result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McmpResponse {
    pub content_type: &'static str,
    pub body: String,
}

impl McmpResponse {
    pub fn empty() -> Self {
        Self::plain(String::new())
    }

    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            content_type: OutputFormat::Plain.content_type(),
            body: body.into(),
        }
    }

    pub fn formatted(format: OutputFormat, body: impl Into<String>) -> Self {
        Self {
            content_type: format.content_type(),
            body: body.into(),
        }
    }
}

/// A decoded command ready for dispatch
#[derive(Debug, Clone)]
pub struct McmpRequest {
    pub command: Command,
    pub fields: Fields,
    pub range: Range,
    pub format: OutputFormat,
    pub origin: Origin,
}

impl McmpRequest {
    pub fn new(command: Command, fields: Fields) -> Self {
        Self {
            command,
            fields,
            range: Range::default(),
            format: OutputFormat::default(),
            origin: Origin::default(),
        }
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }
}

/// The cluster manager service
pub struct Manager {
    registry: Arc<Registry>,
    health: HealthBridge,
    settings: ManagerConfig,
    node_defaults: NodeDefaults,
    restart_epoch: i64,
    nonce: String,
}

impl Manager {
    pub fn new(registry: Arc<Registry>, health: HealthBridge, config: &Config) -> Self {
        Self {
            registry,
            health,
            settings: config.manager.clone(),
            node_defaults: config.node_defaults.clone(),
            restart_epoch: chrono::Utc::now().timestamp(),
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Override the restart epoch reported by STATUS and PING
    pub fn with_restart_epoch(mut self, epoch: i64) -> Self {
        self.restart_epoch = epoch;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn health(&self) -> &HealthBridge {
        &self.health
    }

    pub fn stats(&self) -> &Arc<StatsBlock> {
        self.health.stats()
    }

    pub fn settings(&self) -> &ManagerConfig {
        &self.settings
    }

    pub fn node_defaults(&self) -> &NodeDefaults {
        &self.node_defaults
    }

    pub fn restart_epoch(&self) -> i64 {
        self.restart_epoch
    }

    /// Token the management endpoint requires before acting on parameters
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Decode `body` and run `verb`
    pub fn execute(
        &self,
        verb: &str,
        body: &[u8],
        range: Range,
        format: OutputFormat,
    ) -> McmpResult<McmpResponse> {
        let command = Command::parse(verb).ok_or_else(|| McmpError::syntax(COMMAND_UNSUPPORTED))?;
        let fields = Fields::decode(body).inspect_err(|e| {
            warn!(verb = command.as_str(), error = %e, "Rejected MCMP message");
        })?;
        self.handle(&McmpRequest::new(command, fields).with_range(range).with_format(format))
    }

    /// Run one decoded command
    pub fn handle(&self, request: &McmpRequest) -> McmpResult<McmpResponse> {
        let command = request.command;
        debug!(verb = command.as_str(), range = ?request.range, fields = request.fields.len(), "Processing MCMP command");

        let result = match command {
            Command::Config => process_config(self, &request.fields),
            Command::EnableApp | Command::DisableApp | Command::StopApp | Command::RemoveApp => {
                match command.app_action() {
                    Some(action) => {
                        process_app(self, action, &request.fields, request.range, request.origin)
                    }
                    None => Err(McmpError::syntax(COMMAND_UNSUPPORTED)),
                }
            }
            Command::Status => process_status(self, &request.fields),
            Command::Ping => process_ping(self, &request.fields),
            Command::Dump => Ok(process_dump(&self.registry, request.format)),
            Command::Info => Ok(process_info(&self.registry, self.stats(), request.format)),
            Command::Version => Ok(process_version(request.format)),
            Command::Error | Command::AddId | Command::RemoveId | Command::Query => {
                Err(McmpError::syntax(COMMAND_UNSUPPORTED))
            }
        };

        if let Err(e) = &result {
            warn!(
                verb = command.as_str(),
                kind = e.kind().as_header_value(),
                message = e.message(),
                "MCMP command failed"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::NoopProber;

    fn manager() -> Manager {
        let config = Config::default();
        let registry = Arc::new(Registry::in_memory(&config.manager));
        let health = HealthBridge::new(Arc::new(NoopProber), Arc::new(StatsBlock::new()));
        Manager::new(registry, health, &config)
    }

    #[test]
    fn test_parse_verbs() {
        assert_eq!(Command::parse("CONFIG"), Some(Command::Config));
        assert_eq!(Command::parse("enable-app"), Some(Command::EnableApp));
        assert_eq!(Command::parse("Stop-App"), Some(Command::StopApp));
        assert_eq!(Command::parse("QUERY"), Some(Command::Query));
        assert_eq!(Command::parse("GET"), None);
        for command in Command::ALL {
            assert_eq!(Command::parse(command.as_str()), Some(command));
        }
    }

    #[test]
    fn test_range_from_target() {
        assert_eq!(Range::from_target("*"), Range::Node);
        assert_eq!(Range::from_target("/*"), Range::Node);
        assert_eq!(Range::from_target("/"), Range::Context);
        assert_eq!(Range::from_target("/app"), Range::Context);
        assert_eq!(Range::from_param("domain"), Some(Range::Domain));
        assert_eq!(Range::from_param("NODE"), Some(Range::Node));
        assert_eq!(Range::from_param("CONTEXT"), Some(Range::Context));
        assert_eq!(Range::from_param("ALL"), None);
    }

    #[test]
    fn test_output_format() {
        assert_eq!(OutputFormat::from_accept(None), OutputFormat::Plain);
        assert_eq!(
            OutputFormat::from_accept(Some("application/json, text/xml")),
            OutputFormat::Xml
        );
        assert_eq!(OutputFormat::Xml.content_type(), "text/xml");
    }

    #[test]
    fn test_unsupported_verbs() {
        let manager = manager();
        for verb in ["ERROR", "ADDID", "REMOVEID", "QUERY"] {
            let err = manager
                .execute(verb, b"", Range::Context, OutputFormat::Plain)
                .unwrap_err();
            assert_eq!(err, McmpError::syntax(COMMAND_UNSUPPORTED));
        }
        assert!(manager
            .execute("BREW", b"", Range::Context, OutputFormat::Plain)
            .is_err());
    }

    #[test]
    fn test_decode_failure_leaves_registry_untouched() {
        let manager = manager();
        let err = manager
            .execute(
                "CONFIG",
                b"JVMRoute=node1&Alias=%3Cbad%3E&Context=/app",
                Range::Context,
                OutputFormat::Plain,
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Syntax);
        assert_eq!(manager.registry().version(), 0);
        assert_eq!(manager.registry().usage().nodes, 0);
    }

    #[test]
    fn test_nonce_is_unique() {
        assert_ne!(manager().nonce(), manager().nonce());
    }
}
