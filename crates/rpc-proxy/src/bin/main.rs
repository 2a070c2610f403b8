//! fil-rpc-proxy binary: load config, wire the pipeline, run until signalled
//!
//! Shutdown sequence: cancel the root signal, wait up to `shutdown_timeout`
//! seconds for both refresh loops, drain the HTTP server with a two-second
//! deadline, then close the cache store.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tracing::{error, info, warn};

use fil_rpc_proxy::{
    auth::JwtAuth, cache, config::Config, matcher::Matcher, metrics,
    response_cache::ResponseCache, server::ProxyServer, transport::Transport, updater::Updater,
};

/// How long the HTTP server may take to drain on shutdown
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

const CONFIG_EXAMPLES: &str = "\
Default config file is: $HOME/config.yaml
Yaml format examples:

---
proxy_url: http://test.com
port: 8080
jwt_secret: secret
cache_methods:
- name: method
  cache_by_params: true
  params_for_request:
    - 1
    - one
    - two
  params_in_cache_by_id:
    - 1
    - 2

---
proxy_url: http://test.com
port: 8080
jwt_secret: secret
cache_methods:
- name: method
  cache_by_params: true
  params_for_request:
    - 1
    - one
    - two
  params_in_cache_by_name:
    - name1
    - name2
";

/// Caching JSON-RPC reverse proxy.
///
/// Reads a YAML config file describing the upstream endpoint, the listen
/// address, auth secrets, cache backend and the per-method caching policies.
#[derive(Parser, Debug)]
#[command(name = "fil-rpc-proxy")]
#[command(about = "Caching JSON-RPC 2.0 reverse proxy")]
#[command(after_help = CONFIG_EXAMPLES)]
#[command(version)]
struct Args {
    /// Config file (YAML); defaults to $HOME/config.yaml
    #[arg(short = 'c', long = "config", env = "RPC_PROXY_CONFIG_FILE")]
    config: Option<PathBuf>,
}

fn default_config_path() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("config.yaml")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(default_config_path);
    if !config_path.is_file() {
        eyre::bail!("cannot find config file: {}", config_path.display());
    }

    let config = Config::from_file(&config_path)?;
    fil_proxy_common::logging::init_logging(
        &config.log_level,
        config.log_pretty_print,
        config.debug,
    )?;
    info!("starting fil-rpc-proxy with upstream {}", config.proxy_url);

    metrics::register();

    let store = cache::from_config(&config)?;
    let matcher = Arc::new(Matcher::from_config(&config));
    let cacher = Arc::new(ResponseCache::new(store.clone(), matcher));
    let transport = Arc::new(Transport::from_config(&config, cacher.clone())?);
    let auth = Arc::new(JwtAuth::from_config(&config)?);
    let updater = Arc::new(Updater::from_config(&config, cacher, &auth)?);

    let addr = SocketAddr::new(
        config.host.parse().wrap_err_with(|| format!("invalid host: {}", config.host))?,
        config.port,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(transport, auth);
    let server_handle = tokio::spawn(server.serve(addr, shutdown_rx.clone()));

    tokio::spawn(updater.clone().start_method_updater(
        Duration::from_secs(config.update_custom_cache_period),
        shutdown_rx.clone(),
    ));
    tokio::spawn(updater.clone().start_cache_updater(
        Duration::from_secs(config.update_user_cache_period),
        shutdown_rx,
    ));

    shutdown_signal().await;
    info!("caught shutdown signal, stopping...");
    let _ = shutdown_tx.send(true);

    if updater.stop_with_timeout(Duration::from_secs(config.shutdown_timeout), 2).await {
        info!("refresh loops stopped gracefully");
    } else {
        warn!("refresh loops did not stop in time, shutting down forcibly");
    }

    match tokio::time::timeout(SERVER_STOP_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("server has been stopped successfully"),
        Ok(Ok(Err(err))) => error!("server terminated with error: {err}"),
        Ok(Err(err)) => error!("server task failed: {err}"),
        Err(_) => warn!("could not stop server within {}s", SERVER_STOP_TIMEOUT.as_secs()),
    }

    if let Err(err) = store.close().await {
        warn!("failed to close cache store: {err}");
    }

    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                error!("cannot install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
