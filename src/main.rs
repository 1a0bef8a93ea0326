use pullcord::cli::{init_tracing, parse_daemon_args};
use pullcord::config::ConfigError;
use pullcord::filter::LandingFilter;
use pullcord::proxy::ProxyServer;
use pullcord::resources::load_config;
use pullcord::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Where the landing server listens when no configuration can be opened
const FALLBACK_LISTEN: &str = "0.0.0.0:80";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = parse_daemon_args(std::env::args_os()).unwrap_or_else(|e| e.exit());
    init_tracing(matches.get_flag("verbose"))?;

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(pullcord::cli::DEFAULT_CONFIG_PATH));
    let fallback = matches.get_one::<bool>("config-fallback").copied().unwrap_or(false);

    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");

    let server = match load_config(&config_path) {
        Ok(config) => config.server,
        Err(ConfigError::Io { path, source }) if fallback => {
            warn!(
                path = %path.display(),
                error = %source,
                listen = FALLBACK_LISTEN,
                "Configuration unavailable, serving landing page"
            );
            let addr: SocketAddr = FALLBACK_LISTEN.parse()?;
            Arc::new(ProxyServer::new(addr, Arc::new(LandingFilter)))
        }
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };

    info!(
        listen = %server.bind_addr(),
        tls = server.tls_enabled(),
        request_timeout_secs = server.request_timeout().as_secs(),
        "Server configuration"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(shutdown_rx).await })
    };

    tokio::select! {
        result = &mut server_task => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Proxy server error");
                    Err(e)
                }
                Err(e) => Err(e.into()),
            };
        }
        result = shutdown_signal() => {
            result?;
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_task).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}
