//! Wiring of supervisor, watcher and router

use crate::config::Config;
use crate::page::{DefaultPage, PageTemplate};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::{ProxyServer, Router};
use crate::supervisor::Supervisor;
use crate::watcher::{ChangeSignal, ChangeWatcher};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Owns every long-lived part of the proxy. Built once, then shared.
pub struct Context {
    config: Config,
    supervisor: Arc<Supervisor>,
    watcher: Arc<ChangeWatcher>,
    router: Arc<Router>,
}

impl Context {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_template(config, Arc::new(DefaultPage))
    }

    pub fn with_template(config: Config, template: Arc<dyn PageTemplate>) -> anyhow::Result<Self> {
        let supervisor = Supervisor::new(&config.app)?;

        let watch_dir = config.watch.dir_for(&config.app.main_path());
        let watcher = ChangeWatcher::new(&watch_dir, &config.watch.files)?
            .with_debounce(config.watch.debounce());

        // One port: rebuilds happen on the next request. A range: rebuild in
        // the background and cut over once the new process is ready.
        let watcher = if supervisor.is_multi_port() {
            let supervisor = Arc::clone(&supervisor);
            let changes = watcher.signal();
            watcher.on_changed(move |_path| rotate(Arc::clone(&supervisor), Arc::clone(&changes)))
        } else {
            watcher
        };

        let watcher = Arc::new(watcher);
        let router = Arc::new(Router::new(
            Arc::clone(&supervisor),
            Arc::clone(&watcher),
            ConnectionPool::new(PoolConfig::from(&config.proxy)),
            template,
            config.app.root(),
        ));

        Ok(Self {
            config,
            supervisor,
            watcher,
            router,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn watcher(&self) -> &Arc<ChangeWatcher> {
        &self.watcher
    }

    /// Bind the proxy listener from the configured address
    pub async fn bind(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<ProxyServer> {
        let addr: SocketAddr = format!("{}:{}", self.config.proxy.bind, self.config.proxy.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid proxy bind address: {}", e))?;
        ProxyServer::bind(addr, Arc::clone(&self.router), shutdown_rx).await
    }

    /// Start watching and serve until shutdown
    pub async fn run(&self, server: ProxyServer) -> anyhow::Result<()> {
        info!(
            app = %self.config.app.name(),
            main = %self.config.app.main,
            ports = %self.supervisor.ports(),
            "Supervising backend"
        );

        let watcher = Arc::clone(&self.watcher);
        tokio::spawn(async move {
            if let Err(e) = watcher.watch().await {
                error!(error = %e, "Change watcher stopped");
            }
        });

        server.run().await
    }
}

/// Background rebuild onto a fresh port after a burst of changes
async fn rotate(supervisor: Arc<Supervisor>, changes: Arc<ChangeSignal>) {
    if !changes.take() {
        return;
    }

    info!("Rebuilding in the background");
    match supervisor.rotate().await {
        Ok(port) => info!(port, "Rebuilt backend ready, switching on next request"),
        Err(e) => {
            warn!(error = %e, "Background rebuild failed");
            // The next request retries and renders the failure
            changes.set();
        }
    }
}
