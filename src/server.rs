//! MCMP listener and management endpoint
//!
//! Verbs arrive as extension HTTP methods with the message in the body.
//! `GET <manager_path>` serves the management page.

use crate::command::{Command, Manager, McmpRequest, McmpResponse, Origin, OutputFormat, Range};
use crate::decoder::{decode_token, Fields};
use crate::error::{error_response, McmpError, McmpResult, COMMAND_UNSUPPORTED};
use crate::report::{render_domains, render_dump, render_info, render_sessions};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn command_response(result: McmpResponse) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, result.content_type)
        .body(Full::new(Bytes::from(result.body)))
        .expect("valid response with StatusCode enum and static header")
}

/// Listener for MCMP messages
pub struct McmpServer {
    bind_addr: SocketAddr,
    manager: Arc<Manager>,
    manager_path: Arc<str>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl McmpServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<Manager>,
        manager_path: &str,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            manager_path: Arc::from(manager_path),
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, manager_path = %self.manager_path, "MCMP server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let manager_path = Arc::clone(&self.manager_path);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_connection(tls_stream, manager, manager_path).await {
                                                debug!(addr = %addr, error = %e, "MCMP TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "MCMP TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_connection(stream, manager, manager_path).await {
                                    debug!(addr = %addr, error = %e, "MCMP connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept MCMP connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("MCMP server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    manager: Arc<Manager>,
    manager_path: Arc<str>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let manager = Arc::clone(&manager);
        let manager_path = Arc::clone(&manager_path);
        async move { handle_request(req, manager, manager_path).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("MCMP connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    manager: Arc<Manager>,
    manager_path: Arc<str>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let format = OutputFormat::from_accept(req.headers().get(ACCEPT).and_then(|v| v.to_str().ok()));

    if req.method() == Method::GET {
        if req.uri().path() != &*manager_path {
            return Ok(response(StatusCode::NOT_FOUND, "not found"));
        }
        let query = req.uri().query().map(str::to_string);
        return Ok(handle_manager_page(manager, query.as_deref(), format).await);
    }

    let Some(command) = Command::parse(req.method().as_str()) else {
        return Ok(response(StatusCode::NOT_FOUND, "not found"));
    };
    if !manager.settings().enable_mcpm_receive {
        debug!(verb = command.as_str(), "MCMP receive disabled");
        return Ok(response(StatusCode::NOT_FOUND, "not found"));
    }

    let range = Range::from_target(req.uri().path());
    let limit = manager.settings().message_limit();
    let body = match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(verb = command.as_str(), limit, error = %e, "Failed to read MCMP message");
            return Ok(error_response(&McmpError::read_failed(command.as_str())));
        }
    };

    let result = run_blocking(Arc::clone(&manager), move |manager| {
        manager.execute(command.as_str(), &body, range, format)
    })
    .await;

    Ok(match result {
        Ok(result) => command_response(result),
        Err(e) => error_response(&e),
    })
}

/// Run the command core off the async workers
async fn run_blocking<F>(manager: Arc<Manager>, f: F) -> McmpResult<McmpResponse>
where
    F: FnOnce(&Manager) -> McmpResult<McmpResponse> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&manager))
        .await
        .unwrap_or_else(|e| Err(McmpError::general(format!("GENERAL: command task failed: {}", e))))
}

/// Query parameters, decoded with the same character rules as MCMP bodies
fn parse_query(query: &str) -> McmpResult<Fields> {
    let decode = |raw: &str| decode_token(raw.replace('+', " ").as_bytes());
    let mut pairs = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (decode(name)?, decode(value)?),
            None => (decode(pair)?, String::new()),
        };
        pairs.push((name, value));
    }
    Ok(Fields::from_pairs(pairs))
}

/// Fields handed to a lifecycle command issued from the management page
fn command_fields(params: &Fields, range: Range) -> Fields {
    let wanted: &[&str] = match range {
        Range::Domain => &["Domain"],
        Range::Node => &["JVMRoute"],
        Range::Context => &["JVMRoute", "Alias", "Context"],
    };
    let pairs = params
        .iter()
        .filter(|(name, _)| wanted.iter().any(|w| w.eq_ignore_ascii_case(name)))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    Fields::from_pairs(pairs)
}

async fn handle_manager_page(
    manager: Arc<Manager>,
    query: Option<&str>,
    format: OutputFormat,
) -> Response<Full<Bytes>> {
    let settings = manager.settings();
    let mut notice = String::new();
    let mut params = match query.map(parse_query).transpose() {
        Ok(params) => params.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Rejected management request parameters");
            notice = format!("Command failed: {}\n", e.message());
            Fields::default()
        }
    };

    if settings.check_nonce && !params.is_empty() && params.get("nonce") != Some(manager.nonce()) {
        warn!("Management request with missing or wrong nonce; parameters ignored");
        params = Fields::default();
    }

    if let Some(cmd) = params.get("Cmd") {
        let range = params.get("Range").and_then(Range::from_param);
        match (Command::parse(cmd), range) {
            (Some(command @ (Command::Dump | Command::Info)), _) => {
                let request = McmpRequest::new(command, Fields::default())
                    .with_format(format)
                    .with_origin(Origin::Console);
                let result = run_blocking(Arc::clone(&manager), move |m| m.handle(&request)).await;
                return match result {
                    Ok(result) => command_response(result),
                    Err(e) => error_response(&e),
                };
            }
            (Some(command), Some(range)) if settings.allow_cmd && command.app_action().is_some() => {
                let request = McmpRequest::new(command, command_fields(&params, range))
                    .with_range(range)
                    .with_origin(Origin::Console);
                info!(verb = command.as_str(), range = ?range, "Management command");
                let result = run_blocking(Arc::clone(&manager), move |m| m.handle(&request)).await;
                if let Err(e) = result {
                    notice = format!("Command failed: {}\n", e.message());
                }
            }
            _ => {
                notice = format!("Command failed: {}\n", COMMAND_UNSUPPORTED);
            }
        }
    }

    command_response(McmpResponse::plain(status_page(&manager, &notice)))
}

/// Plain-text status page
pub fn status_page(manager: &Manager, notice: &str) -> String {
    let settings = manager.settings();
    let mut page = format!("{}/{}\n", PKG_NAME, VERSION);
    if settings.allow_cmd {
        page.push_str(&format!("nonce: {}\n", manager.nonce()));
    }
    page.push_str(notice);
    if settings.allow_display {
        page.push_str(&render_dump(manager.registry(), OutputFormat::Plain));
    }
    page.push_str(&render_info(
        manager.registry(),
        manager.stats(),
        OutputFormat::Plain,
        settings.reduce_display,
    ));
    if manager.registry().session_capacity() > 0 {
        page.push_str(&render_sessions(manager.registry()));
    }
    page.push_str(&render_domains(manager.registry()));
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PARSE_FAILED;

    #[test]
    fn test_parse_query() {
        let fields = parse_query("Cmd=ENABLE-APP&Range=NODE&JVMRoute=node%201&Alias=a+b&flag").unwrap();
        assert_eq!(fields.get("Cmd"), Some("ENABLE-APP"));
        assert_eq!(fields.get("range"), Some("NODE"));
        assert_eq!(fields.get("JVMRoute"), Some("node 1"));
        assert_eq!(fields.get("Alias"), Some("a b"));
        assert_eq!(fields.get("flag"), Some(""));
        assert!(parse_query("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_query_rejects_markup() {
        for query in [
            "Cmd=ENABLE-APP&Range=CONTEXT&JVMRoute=n1&Alias=%3Cscript%3E&Context=/x",
            "Alias=%22x",
            "Context=a%0Ab",
            "Alias=caf%E9",
        ] {
            let err = parse_query(query).unwrap_err();
            assert_eq!(err, McmpError::syntax(PARSE_FAILED), "query {}", query);
        }
    }

    #[test]
    fn test_command_fields() {
        let params = parse_query("Cmd=STOP-APP&Range=DOMAIN&Domain=dom1&JVMRoute=n1&nonce=x").unwrap();
        let fields = command_fields(&params, Range::Domain);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("Domain"), Some("dom1"));

        let fields = command_fields(&params, Range::Context);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("JVMRoute"), Some("n1"));
    }

    #[test]
    fn test_command_response_headers() {
        let response = command_response(McmpResponse::formatted(OutputFormat::Xml, "<x/>"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/xml");
    }
}
