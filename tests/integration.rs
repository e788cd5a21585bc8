//! Integration tests for Hotgate
//!
//! Each test supervises the fixture backend binary through a throwaway
//! project: `main.go` holds the response body and the panic line, and a
//! shell "toolchain" turns it into a launcher script.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hotgate::config::{Config, PortRange};
use hotgate::context::Context;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const FIXTURE: &str = env!("CARGO_BIN_EXE_hotgate-fixture-backend");

const DEBOUNCE_MS: u64 = 200;

/// Source for the fixture. The panic call sits on line 7.
fn source(body: &str) -> String {
    format!(
        "package main\n\
         \n\
         // body: {}\n\
         \n\
         func handler(w http.ResponseWriter, r *http.Request) {{\n\
         \tif r.URL.Path == \"/panic\" {{\n\
         \t\tpanic(\"something went wrong\")\n\
         \t}}\n\
         }}\n",
        body
    )
}

struct Project {
    dir: TempDir,
    build_dir: TempDir,
}

impl Project {
    fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = tempfile::tempdir().unwrap();
        let project = Self { dir, build_dir };
        project.write_source(&source(body));
        project.write_toolchain();
        project
    }

    fn main(&self) -> PathBuf {
        self.dir.path().join("main.go")
    }

    fn builds_file(&self) -> PathBuf {
        self.build_dir.path().join("builds.log")
    }

    fn toolchain(&self) -> PathBuf {
        self.build_dir.path().join("build.sh")
    }

    fn write_source(&self, content: &str) {
        std::fs::write(self.main(), content).unwrap();
    }

    /// `build.sh <output> <main>`: fails like `go build` on a marked source,
    /// otherwise snapshots the source and writes a launcher for it
    fn write_toolchain(&self) {
        let script = format!(
            "#!/bin/sh\n\
             echo build >> \"{builds}\"\n\
             sleep 0.3\n\
             if grep -q 'COMPILE ERROR' \"$2\"; then\n\
             \techo '# command-line-arguments'\n\
             \techo './main.go:3:1: syntax error: non-declaration statement outside function body'\n\
             \texit 2\n\
             fi\n\
             cp \"$2\" \"$1.src\"\n\
             printf '#!/bin/sh\\nexec \"%s\" --source \"%s\" --origin \"%s\" \"$@\"\\n' \"{fixture}\" \"$1.src\" \"$2\" > \"$1\"\n\
             chmod +x \"$1\"\n",
            builds = self.builds_file().display(),
            fixture = FIXTURE,
        );
        let path = self.toolchain();
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn build_count(&self) -> usize {
        std::fs::read_to_string(self.builds_file())
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn config(&self, ports: Ports) -> Config {
        let mut config = Config::default();
        config.app = config
            .app
            .with_build_command(&format!("sh {} {{output}} {{main}}", self.toolchain().display()))
            .with_build_dir(self.build_dir.path())
            .with_root(self.dir.path());
        config.app.main = self.main().to_string_lossy().into_owned();
        config.app.startup_timeout_secs = 10;
        config.app = match ports {
            Ports::Single(port) => {
                config.app.port = port;
                config.app
            }
            Ports::Range(range) => config.app.with_port_range(range, "-p"),
        };
        config.proxy.port = 0;
        config.watch.debounce_ms = DEBOUNCE_MS;
        config
    }
}

enum Ports {
    Single(u16),
    Range(PortRange),
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Three consecutive bindable ports
fn free_range() -> PortRange {
    let mut start = 42_000;
    loop {
        if (start..start + 3).all(|p| std::net::TcpListener::bind(("127.0.0.1", p)).is_ok()) {
            return PortRange { start, end: start + 2 };
        }
        start += 3;
    }
}

struct Proxy {
    context: Arc<Context>,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
}

impl Proxy {
    async fn start(config: Config) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = Arc::new(Context::new(config).unwrap());
        let server = context.bind(shutdown_rx).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let serving = Arc::clone(&context);
        tokio::spawn(async move {
            let _ = serving.run(server).await;
        });
        // Let the watcher register its directories
        tokio::time::sleep(Duration::from_millis(300)).await;

        Self {
            context,
            port,
            shutdown_tx,
        }
    }

    async fn get(&self, path: &str) -> Response {
        http_get(self.port, path).await
    }

    /// Request `path` until the body contains `needle`
    async fn get_until(&self, path: &str, needle: &str, timeout: Duration) -> Response {
        let deadline = Instant::now() + timeout;
        loop {
            let response = self.get(path).await;
            if response.body.contains(needle) || Instant::now() >= deadline {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.context.supervisor().stop_all().await;
    }
}

struct Response {
    status: u16,
    head: String,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

/// Send a simple HTTP request and get response
async fn http_get(port: u16, path: &str) -> Response {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Response {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn assert_exists(path: &Path) {
    assert!(path.exists(), "{} should exist", path.display());
}

// ============================================================================
// Basic proxying
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_request_builds_and_proxies() {
    let project = Project::new("server 1");
    let backend_port = free_port();
    let proxy = Proxy::start(project.config(Ports::Single(backend_port))).await;

    let response = proxy.get("/").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "server 1");
    assert_eq!(project.build_count(), 1);
    assert!(proxy.context.supervisor().is_running(None));
    assert_eq!(proxy.context.supervisor().current_port(), backend_port);

    // Warm requests do not rebuild
    let response = proxy.get("/").await;
    assert_eq!(response.body, "server 1");
    assert_eq!(project.build_count(), 1);

    let artifact = proxy.context.supervisor().latest_artifact().unwrap();
    assert_exists(&artifact);

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_build() {
    let project = Project::new("server 1");
    let proxy = Proxy::start(project.config(Ports::Single(free_port()))).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let port = proxy.port;
        handles.push(tokio::spawn(async move { http_get(port, "/").await }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "server 1");
    }
    assert_eq!(project.build_count(), 1);

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edit_rebuilds_on_next_request() {
    let project = Project::new("server 1");
    let proxy = Proxy::start(project.config(Ports::Single(free_port()))).await;

    assert_eq!(proxy.get("/").await.body, "server 1");

    project.write_source(&source("server 2"));
    tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS + 300)).await;

    let response = proxy.get_until("/", "server 2", Duration::from_secs(5)).await;
    assert_eq!(response.body, "server 2");
    // One write, however many events it produced, is one rebuild
    assert_eq!(project.build_count(), 2);

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ignored_files_do_not_invalidate() {
    let project = Project::new("server 1");
    let proxy = Proxy::start(project.config(Ports::Single(free_port()))).await;

    assert_eq!(proxy.get("/").await.body, "server 1");

    std::fs::write(project.dir.path().join("notes.txt"), "scratch").unwrap();
    std::fs::write(project.dir.path().join("main.go~"), "backup").unwrap();
    tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS + 300)).await;

    assert_eq!(proxy.get("/").await.body, "server 1");
    assert_eq!(project.build_count(), 1);

    proxy.stop().await;
}

// ============================================================================
// Diagnostic pages
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_build_error_page_until_fixed() {
    let project = Project::new("server 1");
    let proxy = Proxy::start(project.config(Ports::Single(free_port()))).await;

    assert_eq!(proxy.get("/").await.body, "server 1");

    project.write_source("package main\n\nCOMPILE ERROR\n");
    let response = proxy.get_until("/", "Build Error", Duration::from_secs(5)).await;
    assert_eq!(response.status, 500);
    assert!(response.body.contains("Build Error"));
    assert!(response.body.contains("syntax error: non-declaration statement"));
    assert!(!response.body.contains("# command-line-arguments"));
    assert_eq!(response.header("x-hotgate-error"), Some("BUILD_ERROR"));
    assert!(response
        .header("content-type")
        .is_some_and(|ct| ct.starts_with("text/html")));

    // Still broken, still reported
    let response = proxy.get("/").await;
    assert!(response.body.contains("Build Error"));

    project.write_source(&source("server 3"));
    let response = proxy.get_until("/", "server 3", Duration::from_secs(5)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "server 3");

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panic_renders_trace_and_snippet() {
    let project = Project::new("server 1");
    let proxy = Proxy::start(project.config(Ports::Single(free_port()))).await;

    assert_eq!(proxy.get("/").await.body, "server 1");

    let response = proxy.get("/panic").await;
    assert_eq!(response.status, 500);
    assert_eq!(response.header("x-hotgate-error"), Some("RUNTIME_PANIC"));
    assert!(response.body.contains("Application Error"));
    assert!(response.body.contains("panic: something went wrong"));
    // Application frame, relative to the project root
    assert!(response.body.contains("main.go:7"));
    assert!(response
        .body
        .contains("<tr class=\"current\"><td class=\"number\">7</td>"));

    // The backend survives a handler panic
    let response = proxy.get("/").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "server 1");
    assert_eq!(project.build_count(), 1);

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unexpected_exit_restarts_backend() {
    let project = Project::new("server 1");
    let proxy = Proxy::start(project.config(Ports::Single(free_port()))).await;

    assert_eq!(proxy.get("/").await.body, "server 1");

    let response = proxy.get("/exit").await;
    assert_eq!(response.status, 500);
    assert_eq!(response.header("x-hotgate-error"), Some("UNEXPECTED_EXIT"));
    assert!(response.body.contains("exited unexpectedly"));

    let response = proxy.get_until("/", "server 1", Duration::from_secs(5)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "server 1");
    assert!(proxy.context.supervisor().is_running(None));

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_json_diagnostic_when_requested() {
    let project = Project::new("server 1");
    project.write_source("package main\n\nCOMPILE ERROR\n");
    let proxy = Proxy::start(project.config(Ports::Single(free_port()))).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", proxy.port))
        .await
        .unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
        proxy.port
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let (_, body) = raw.split_once("\r\n\r\n").unwrap();
    let report: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(report["kind"], "build");
    assert!(report["message"]
        .as_str()
        .unwrap()
        .contains("syntax error"));

    proxy.stop().await;
}

// ============================================================================
// Port rotation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_background_rebuild_switches_ports() {
    let project = Project::new("server 1");
    let range = free_range();
    let proxy = Proxy::start(project.config(Ports::Range(range))).await;
    let supervisor = Arc::clone(proxy.context.supervisor());

    assert_eq!(proxy.get("/").await.body, "server 1");
    let first_port = supervisor.current_port();
    assert_eq!(first_port, range.start);

    project.write_source(&source("server 2"));
    assert!(
        wait_until(Duration::from_secs(10), || supervisor.current_port() != first_port).await,
        "background rebuild should move to a new port"
    );
    let second_port = supervisor.current_port();
    assert!(range.contains(second_port));

    // Old process keeps running until the cutover request
    assert!(supervisor.is_running(Some(first_port)));

    let response = proxy.get("/").await;
    assert_eq!(response.body, "server 2");
    assert_eq!(proxy.context.supervisor().current_port(), second_port);

    assert!(
        wait_until(Duration::from_secs(5), || !supervisor.is_running(Some(first_port))).await,
        "old process should be cleaned after the switch"
    );
    assert_eq!(project.build_count(), 2);

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_all_removes_artifacts() {
    let project = Project::new("server 1");
    let proxy = Proxy::start(project.config(Ports::Single(free_port()))).await;

    assert_eq!(proxy.get("/").await.body, "server 1");
    let artifact = proxy.context.supervisor().latest_artifact().unwrap();
    assert_exists(&artifact);

    let supervisor = Arc::clone(proxy.context.supervisor());
    proxy.stop().await;

    assert!(!supervisor.is_running(None));
    assert!(!artifact.exists());
}
