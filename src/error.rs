//! Error taxonomy for MCMP commands and the error response built from it

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Protocol version reported in VERSION answers and error responses
pub const VERSION_PROTOCOL: &str = "0.2.1";

pub const PARSE_FAILED: &str =
    "SYNTAX: Can't parse MCMP message. It might have contained illegal symbols or unknown elements.";
pub const BALANCER_TOO_BIG: &str = "SYNTAX: Balancer field too big";
pub const FIELD_TOO_BIG: &str = "SYNTAX: A field is too big";
pub const JVMROUTE_TOO_BIG: &str = "SYNTAX: JVMRoute field too big";
pub const JVMROUTE_EMPTY: &str = "SYNTAX: JVMRoute can't be empty";
pub const DOMAIN_TOO_BIG: &str = "SYNTAX: LBGroup field too big";
pub const HOST_TOO_BIG: &str = "SYNTAX: Host field too big";
pub const PORT_TOO_BIG: &str = "SYNTAX: Port field too big";
pub const TYPE_TOO_BIG: &str = "SYNTAX: Type field too big";
pub const ALIAS_WITHOUT_CONTEXT: &str = "SYNTAX: Alias without Context";
pub const CONTEXT_WITHOUT_ALIAS: &str = "SYNTAX: Context without Alias";
pub const MISSING_FIELDS: &str = "SYNTAX: Mandatory field(s) missing in message";
pub const COMMAND_UNSUPPORTED: &str = "SYNTAX: Command is not supported";
pub const MULTIPLE_ALIAS: &str = "SYNTAX: Only one Alias in APP command";
pub const MULTIPLE_CONTEXT: &str = "SYNTAX: Only one Context in APP command";

/// Result type for command handlers
pub type McmpResult<T> = Result<T, McmpError>;

/// Class of a command failure, sent back in the `Type` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; state was not touched
    Syntax,
    /// Registry failure: table full, lookup or store failure
    Mem,
    /// Anything else, e.g. transport failures
    General,
}

impl ErrorKind {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SYNTAX",
            ErrorKind::Mem => "MEM",
            ErrorKind::General => "GENERAL",
        }
    }
}

/// A rejected command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum McmpError {
    #[error("{0}")]
    Syntax(String),
    #[error("{0}")]
    Mem(String),
    #[error("{0}")]
    General(String),
}

impl McmpError {
    pub fn syntax(message: impl Into<String>) -> Self {
        McmpError::Syntax(message.into())
    }

    pub fn mem(message: impl Into<String>) -> Self {
        McmpError::Mem(message.into())
    }

    pub fn general(message: impl Into<String>) -> Self {
        McmpError::General(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            McmpError::Syntax(_) => ErrorKind::Syntax,
            McmpError::Mem(_) => ErrorKind::Mem,
            McmpError::General(_) => ErrorKind::General,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            McmpError::Syntax(m) | McmpError::Mem(m) | McmpError::General(m) => m,
        }
    }

    pub fn invalid_field(name: &str) -> Self {
        Self::syntax(format!("SYNTAX: Invalid field \"{}\" in message", name))
    }

    pub fn read_failed(verb: &str) -> Self {
        Self::syntax(format!("SYNTAX: {} can't read POST data", verb))
    }

    pub fn node_update_failed(route: &str) -> Self {
        Self::mem(format!("MEM: Can't update or insert node with \"{}\" JVMRoute", route))
    }

    pub fn node_still_exists(route: &str) -> Self {
        Self::mem(format!("MEM: Old node with \"{}\" JVMRoute still exists", route))
    }

    pub fn balancer_update_failed(route: &str) -> Self {
        Self::mem(format!(
            "MEM: Can't update or insert balancer for node with \"{}\" JVMRoute",
            route
        ))
    }

    pub fn node_not_found(route: &str) -> Self {
        Self::mem(format!("MEM: Can't read node with \"{}\" JVMRoute", route))
    }

    pub fn host_read_failed(route: &str) -> Self {
        Self::mem(format!(
            "MEM: Can't read host alias for node with \"{}\" JVMRoute",
            route
        ))
    }

    pub fn host_update_failed(route: &str) -> Self {
        Self::mem(format!(
            "MEM: Can't update or insert host alias for node with \"{}\" JVMRoute",
            route
        ))
    }

    pub fn context_update_failed(route: &str) -> Self {
        Self::mem(format!(
            "MEM: Can't update or insert context for node with \"{}\" JVMRoute",
            route
        ))
    }
}

/// Build the response for a rejected command: status 500 and the error
/// carried in `Version`, `Type` and `Mess` headers.
pub fn error_response(error: &McmpError) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("Version", VERSION_PROTOCOL)
        .header("Type", error.kind().as_header_value())
        .header("Mess", error.message())
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| {
            // Mess can only fail header validation if it carried control bytes
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header("Version", VERSION_PROTOCOL)
                .header("Type", error.kind().as_header_value())
                .body(Full::new(Bytes::new()))
                .expect("valid response with StatusCode enum and static headers")
        })
}
