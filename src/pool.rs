//! Connection pool for backend HTTP connections
//!
//! Keeps loopback connections to the backend alive between requests. Pooled
//! connections to a port whose process is gone fail on first use and are
//! dropped by the client.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

use crate::config::ProxyConfig;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ProxyConfig> for PoolConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        }
    }
}

/// A connection pool for HTTP connections to the backend
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client }
    }

    /// Send a request to the backend on `port`, streaming the response body
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
        port: u16,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            port,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Empty, Full};

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_config_from_proxy_config() {
        let proxy = ProxyConfig {
            pool_max_idle_per_host: 4,
            pool_idle_timeout_secs: 15,
            ..ProxyConfig::default()
        };
        let config = PoolConfig::from(&proxy);
        assert_eq!(config.max_idle_per_host, 4);
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let req = Request::builder()
            .uri("/")
            .body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
            .unwrap();
        let result = pool.send_request(req, port).await;

        assert!(matches!(result, Err(PoolError::Client(_))));
    }

    #[tokio::test]
    async fn test_send_request_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nserver 1")
                .await
                .unwrap();
        });

        let pool = ConnectionPool::new(PoolConfig::default());
        let req = Request::builder()
            .method("POST")
            .uri("/submit?x=1")
            .body(Full::new(Bytes::from("a=b")).map_err(|e| match e {}).boxed())
            .unwrap();
        let response = pool.send_request(req, port).await.unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"server 1");
    }
}
