use hotgate::config::Config;
use hotgate::context::Context;
use hotgate::supervisor::Supervisor;
use hotgate::watcher::ChangeWatcher;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONFIG: &str = "hotgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration before logging so `verbose` picks the log level
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let loaded = if explicit_path.is_none() && !config_path.exists() {
        Config::default().validate().map(|_| Config::default())
    } else {
        Config::load(&config_path)
    };

    let directive = match &loaded {
        Ok(config) if config.proxy.verbose => "hotgate=debug",
        _ => "hotgate=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    let config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    if config_path.exists() {
        info!(path = %config_path.display(), "Configuration loaded");
    } else {
        info!("No configuration file, using defaults");
    }

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let context = Arc::new(Context::new(config)?);
    let server = context.bind(shutdown_rx.clone()).await?;

    let serving = Arc::clone(&context);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = serving.run(server).await {
            error!(error = %e, "Proxy server error");
        }
    });

    tokio::spawn(restart_on_return(
        Arc::clone(context.supervisor()),
        Arc::clone(context.watcher()),
        shutdown_rx.clone(),
    ));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping backend...");
    context.supervisor().stop_all().await;

    if tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        warn!("Proxy server did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

/// A bare Return on the console forces a rebuild and restart
async fn restart_on_return(
    supervisor: Arc<Supervisor>,
    watcher: Arc<ChangeWatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if is_restart_request(&line) => {
                        info!("Restart requested from console");
                        // The rebuild covers any pending source change
                        watcher.reset();
                        if let Err(e) = supervisor.restart().await {
                            warn!(error = %e, "Console restart failed");
                        }
                    }
                    Ok(Some(_)) => {}
                    // stdin closed, e.g. running detached
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read console input");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Only an empty line counts; anything typed before Return is ignored
fn is_restart_request(line: &str) -> bool {
    line.trim_end_matches('\r').is_empty()
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting development proxy");
    info!(
        bind = %config.proxy.bind,
        port = config.proxy.port,
        verbose = config.proxy.verbose,
        "Proxy configuration"
    );
    info!(
        app = %config.app.name(),
        main = %config.app.main,
        ports = %config.app.ports(),
        port_flag = ?config.app.port_flag,
        build_command = %config.app.build_command,
        startup_timeout_secs = config.app.startup_timeout_secs,
        "Backend settings"
    );
    info!(
        dir = %config.watch.dir_for(&config.app.main_path()).display(),
        files = %config.watch.files,
        debounce_ms = config.watch.debounce_ms,
        "Watch settings"
    );
    info!("Press Return to rebuild and restart the backend");
}
