use crate::diagnostic::{self, DiagnosticReport};
use crate::error::{
    diagnostic_response, json_diagnostic_response, FailureKind, RuntimeFailure, SupervisorError,
};
use crate::flight::Gate;
use crate::page::PageTemplate;
use crate::pool::{ConnectionPool, PoolError, ProxyBody};
use crate::supervisor::Supervisor;
use crate::watcher::ChangeWatcher;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use regex::Regex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// How long a failed forward waits for the backend's stderr or exit status
const FAILURE_GRACE: Duration = Duration::from_secs(1);
const FAILURE_POLL: Duration = Duration::from_millis(25);

const EXIT_MESSAGE: &str = "App exited unexpectedly.";

static STATIC_ASSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(png|jpg|jpeg|gif|svg|ico|swf|js|css|html|woff)").expect("valid static asset pattern")
});

/// Whether a request URI names a static asset; those are not logged
pub fn is_static(uri: &str) -> bool {
    STATIC_ASSET.is_match(uri)
}

/// The loopback port requests are forwarded to
#[derive(Debug)]
pub struct ProxyTarget {
    port: AtomicU16,
}

impl ProxyTarget {
    pub fn new(port: u16) -> Self {
        Self {
            port: AtomicU16::new(port),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn repoint(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }
}

/// Per-request decisions: rebuild, restart, forward, or render a diagnostic
pub struct Router {
    supervisor: Arc<Supervisor>,
    watcher: Arc<ChangeWatcher>,
    pool: ConnectionPool,
    target: ProxyTarget,
    first_request: Gate,
    template: Arc<dyn PageTemplate>,
    /// Application root for telling app frames from library frames
    root: PathBuf,
}

impl Router {
    pub fn new(
        supervisor: Arc<Supervisor>,
        watcher: Arc<ChangeWatcher>,
        pool: ConnectionPool,
        template: Arc<dyn PageTemplate>,
        root: PathBuf,
    ) -> Self {
        let target = ProxyTarget::new(supervisor.current_port());
        Self {
            supervisor,
            watcher,
            pool,
            target,
            first_request: Gate::new(),
            template,
            root,
        }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let started = Instant::now();
        let uri = req.uri().to_string();
        let quiet = is_static(&uri);
        let wants_json = wants_json(&req);

        let (mut req, params) = collect_params(req).await?;

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        if !quiet {
            info!(target: "request", "Started {} \"{}\" for {}", req.method(), uri, client_addr.ip());
            if !params.is_empty() {
                info!(target: "request", "  Parameters: {}", format_params(&params));
            }
        }
        debug!(request_id, "Incoming request");

        let response = self.dispatch(req, wants_json).await;

        if !quiet {
            info!(
                target: "request",
                "Completed {} in {}ms",
                response.status().as_u16(),
                started.elapsed().as_millis()
            );
        }
        Ok(response)
    }

    async fn dispatch(&self, req: Request<ProxyBody>, wants_json: bool) -> Response<ProxyBody> {
        let mut first = false;
        let mut switched = false;

        if let Some(port) = self.supervisor.take_switch() {
            info!(from = self.target.port(), to = port, "Switching to rebuilt backend");
            self.target.repoint(port);
            first = true;
            switched = true;
        } else {
            self.supervisor.settle().await;
            if !self.supervisor.is_running(None) || self.watcher.take_changed() {
                if let Err(e) = self.supervisor.restart().await {
                    // Keep failing until a build goes through
                    self.watcher.mark_changed();
                    warn!(error = %e, "Restart failed");
                    return self.render(supervisor_report(&e), wants_json);
                }
                self.target.repoint(self.supervisor.current_port());
                first = true;
            }
        }

        let mark = self.supervisor.mark_failures();
        let port = self.target.port();
        let result = if first {
            let pass = self.first_request.pass().await;
            if !pass.is_leader() {
                debug!(port, "Backend warmed by another request");
            }
            self.pool.send_request(req, port).await
        } else {
            self.first_request.wait_open().await;
            self.pool.send_request(req, port).await
        };

        if switched {
            let supervisor = Arc::clone(&self.supervisor);
            tokio::spawn(async move { supervisor.clean().await });
        }

        match result {
            Ok(response) => {
                if let Some(failure) = self.captured_failure(mark).await {
                    return self.render(diagnostic::parse(&failure.raw, &self.root), wants_json);
                }
                if self.supervisor.is_quit(Some(port)) {
                    return self.exited(port, wants_json);
                }
                response
            }
            Err(e) => self.forward_failed(e, mark, port, wants_json).await,
        }
    }

    /// A failure begun after `mark`, waiting for a blob still being read
    /// from stderr to complete
    async fn captured_failure(&self, mark: u64) -> Option<RuntimeFailure> {
        let deadline = Instant::now() + FAILURE_GRACE;
        while self.supervisor.failure_pending_since(mark) && Instant::now() < deadline {
            tokio::time::sleep(FAILURE_POLL).await;
        }
        self.supervisor.runtime_failure_since(mark)
    }

    /// Work out why a forward failed: a panic, an exit, or neither
    async fn forward_failed(
        &self,
        err: PoolError,
        mark: u64,
        port: u16,
        wants_json: bool,
    ) -> Response<ProxyBody> {
        let deadline = Instant::now() + FAILURE_GRACE;
        loop {
            if let Some(failure) = self.supervisor.runtime_failure_since(mark) {
                return self.render(diagnostic::parse(&failure.raw, &self.root), wants_json);
            }
            if self.supervisor.is_quit(Some(port)) || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(FAILURE_POLL).await;
        }

        if self.supervisor.is_quit(Some(port)) {
            return self.exited(port, wants_json);
        }

        error!(port, error = %err, "Failed to forward request");
        self.render(
            DiagnosticReport::message(
                FailureKind::Connection,
                format!("Failed to connect to backend on port {}: {}", port, err),
            ),
            wants_json,
        )
    }

    /// Restart from the last artifact in the background and report the exit
    fn exited(&self, port: u16, wants_json: bool) -> Response<ProxyBody> {
        warn!(port, "== App exited unexpectedly");
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            if let Err(e) = supervisor.start(false).await {
                error!(error = %e, "Failed to restart backend after exit");
            }
        });
        self.render(DiagnosticReport::message(FailureKind::Exit, EXIT_MESSAGE), wants_json)
    }

    fn render(&self, report: DiagnosticReport, wants_json: bool) -> Response<ProxyBody> {
        if wants_json {
            json_diagnostic_response(&report)
        } else {
            diagnostic_response(&report, self.template.as_ref())
        }
    }
}

fn supervisor_report(err: &SupervisorError) -> DiagnosticReport {
    match err {
        SupervisorError::Build(output) => DiagnosticReport::build(output),
        SupervisorError::Startup(message) => {
            DiagnosticReport::message(FailureKind::Startup, message.clone())
        }
        other => DiagnosticReport::message(FailureKind::Startup, other.to_string()),
    }
}

fn wants_json<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json") && !accept.contains("text/html"))
}

fn is_form<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Form parameters from the query string and url-encoded bodies. Form bodies
/// are buffered and handed on unchanged; others stream through.
async fn collect_params(
    req: Request<Incoming>,
) -> Result<(Request<ProxyBody>, Vec<(String, String)>), hyper::Error> {
    let mut params = req
        .uri()
        .query()
        .map(parse_form)
        .unwrap_or_default();

    if !is_form(&req) {
        let (parts, body) = req.into_parts();
        return Ok((Request::from_parts(parts, body.boxed()), params));
    }

    let (parts, body) = req.into_parts();
    let bytes = body.collect().await?.to_bytes();
    params.extend(parse_form(&String::from_utf8_lossy(&bytes)));

    let body = Full::new(bytes).map_err(|e| match e {}).boxed();
    Ok((Request::from_parts(parts, body), params))
}

pub fn parse_form(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(text: &str) -> String {
    let text = text.replace('+', " ");
    urlencoding::decode(&text)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(text)
}

fn format_params(params: &[(String, String)]) -> String {
    let pairs: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{:?}: {:?}", key, value))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

/// The proxy's HTTP listener
pub struct ProxyServer {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        router: Arc<Router>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            router,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, backend_port = self.router.target.port(), "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { router.handle(req, addr).await }
    });

    // HTTP/1.1 plus h2c
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
