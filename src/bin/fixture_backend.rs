//! Fixture backend for integration testing
//!
//! Behaves like a small Go web server built from a source file:
//!
//!   hotgate-fixture-backend --source <copy> --origin <path> [-p <port>]
//!
//! - `/` answers with the text of the `body: ...` line in the source copy
//! - `/panic` logs a Go-style panic trace pointing at the line of the source
//!   that calls `panic(...)` in `<origin>`, then drops the connection
//! - `/exit` terminates the process
//!
//! The port comes from `-p` or, failing that, the PORT environment variable.

use anyhow::Context;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

struct Fixture {
    source: PathBuf,
    origin: PathBuf,
}

struct Args {
    source: PathBuf,
    origin: PathBuf,
    port: u16,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut source = None;
    let mut origin = None;
    let mut port = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--source" => source = args.next().map(PathBuf::from),
            "--origin" => origin = args.next().map(PathBuf::from),
            "-p" | "--port" => port = args.next(),
            other => anyhow::bail!("unknown argument '{}'", other),
        }
    }

    let port = match port {
        Some(port) => port,
        None => std::env::var("PORT").context("PORT or -p required")?,
    };

    Ok(Args {
        source: source.context("--source required")?,
        origin: origin.context("--origin required")?,
        port: port.parse().context("port must be a valid port number")?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let fixture = Arc::new(Fixture {
        source: args.source,
        origin: args.origin,
    });

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    println!("fixture backend listening on {}", args.port);

    loop {
        let (stream, peer) = listener.accept().await?;
        let fixture = Arc::clone(&fixture);
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let fixture = Arc::clone(&fixture);
                async move { fixture.handle(req, peer).await }
            });
            // Dropped connections are how a panicking handler looks
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

impl Fixture {
    async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let source = tokio::fs::read_to_string(&self.source).await?;

        match req.uri().path() {
            "/panic" => {
                self.log_panic(&source, peer);
                anyhow::bail!("handler panicked")
            }
            "/exit" => std::process::exit(0),
            _ => {
                let body = source
                    .lines()
                    .find_map(|line| line.split_once("body: ").map(|(_, body)| body.trim()))
                    .unwrap_or("")
                    .to_string();
                Ok(Response::new(Full::new(Bytes::from(body))))
            }
        }
    }

    fn log_panic(&self, source: &str, peer: SocketAddr) {
        let (line, message) = source
            .lines()
            .enumerate()
            .find_map(|(i, line)| {
                let start = line.find("panic(\"")? + "panic(\"".len();
                let end = line[start..].find('"')? + start;
                Some((i + 1, line[start..end].to_string()))
            })
            .unwrap_or((1, "unknown".to_string()));

        let trace = format!(
            "{} http: panic serving {}: {}\n\
             goroutine 6 [running]:\n\
             net/http.(*conn).serve.func1()\n\
             \t/usr/local/go/src/net/http/server.go:1898 +0x91\n\
             main.handler({{0x6f4a20, 0xc0000aa000}}, 0xc0000b2000)\n\
             \t{}:{} +0x25\n\
             net/http.HandlerFunc.ServeHTTP(0x0?, {{0x6f4a20?, 0xc0000aa000?}}, 0x0?)\n\
             \t/usr/local/go/src/net/http/server.go:2136 +0x29\n",
            chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
            peer,
            message,
            self.origin.display(),
            line,
        );

        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(trace.as_bytes());
        let _ = stderr.flush();
    }
}
