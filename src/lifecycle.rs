//! Server boot, reload and shutdown orchestration. A fresh [Runtime] is
//! built on every boot and every reload: rebuilding from scratch rather than
//! mutating a long-lived struct in place is what makes "TSIG updates don't
//! survive a reload" and "round-robin cursors reset on reload" true for
//! free, and mirrors the zone index itself being an atomic cell swap.

use crate::cache::Cache;
use crate::config::{ConfigFile, SecretFile};
use crate::error::HerdNsError;
use crate::plugins::script_pool::ScriptPool;
use crate::plugins::PluginChain;
use crate::resolver;
use crate::roundrobin::RoundRobinState;
use crate::servers;
use crate::tsig::TsigKey;
use crate::zones::ZoneIndex;
use concread::cowcell::asynch::CowCell;
use hickory_resolver::TokioAsyncResolver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Everything a single generation of the server needs to answer queries.
/// Held behind an `Arc` so every connection-handling task can cheaply share
/// a reference without needing its own copy.
pub struct Runtime {
    pub config: ConfigFile,
    pub zones: CowCell<ZoneIndex>,
    pub cache: Cache,
    pub roundrobin: RoundRobinState,
    pub plugins: PluginChain,
    pub tsig_key: Option<TsigKey>,
    pub resolver: TokioAsyncResolver,
}

impl Runtime {
    /// Loads configuration (and, if given, a TSIG secret file) and builds a
    /// fresh runtime from it: an empty cache, reset round-robin cursors, a
    /// newly compiled plugin chain and a new recursive resolver client.
    pub async fn build(config_path: Option<&str>, secret_path: Option<&str>) -> Result<Arc<Runtime>, HerdNsError> {
        let config = ConfigFile::try_from_file(config_path)?;
        let zones = CowCell::new(ZoneIndex::build(&config.zones));
        let cache = Cache::new();
        let roundrobin = RoundRobinState::new();

        let script_pool = ScriptPool::new();
        let plugins = PluginChain::load(&config.plugins, &script_pool)?;

        let tsig_key = match secret_path {
            Some(path) => Some(TsigKey::try_from(&SecretFile::try_from_file(path)?)?),
            None => None,
        };

        let resolver = resolver::build_recursive_resolver(config.parent_address()?);

        info!(
            hostname = %config.hostname,
            zones = config.zones.len(),
            plugins = config.plugins.len(),
            tsig = tsig_key.is_some(),
            "built runtime generation"
        );

        Ok(Arc::new(Runtime {
            config,
            zones,
            cache,
            roundrobin,
            plugins,
            tsig_key,
            resolver,
        }))
    }
}

enum ReloadOutcome {
    Reload,
    Exit,
}

/// Runs the server until told to exit: boots a [Runtime], serves on every
/// configured listener, then waits for a reload trigger (SIGHUP, or a
/// watched file changing, if `auto_reload` is set) or a shutdown trigger
/// (SIGINT/SIGTERM). On reload the whole loop repeats with a fresh runtime;
/// on shutdown the listener tasks are stopped and this returns.
pub async fn run(config_path: Option<String>, secret_path: Option<String>) -> Result<(), HerdNsError> {
    loop {
        let runtime = Runtime::build(config_path.as_deref(), secret_path.as_deref()).await?;

        let mut watch_paths = vec![];
        if let Some(path) = &config_path {
            watch_paths.push(PathBuf::from(path));
        }
        if let Some(path) = &secret_path {
            watch_paths.push(PathBuf::from(path));
        }
        let file_events = spawn_file_watcher(watch_paths);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        for addr in runtime.config.listener_addresses() {
            let udp_runtime = runtime.clone();
            let udp_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = servers::udp_server(udp_runtime, addr, udp_rx).await {
                    error!(%addr, %err, "udp listener exited");
                }
            }));

            let tcp_runtime = runtime.clone();
            let tcp_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = servers::tcp_server(tcp_runtime, addr, tcp_rx).await {
                    error!(%addr, %err, "tcp listener exited");
                }
            }));
        }

        if handles.is_empty() {
            warn!("no listener addresses configured or parseable, nothing is listening");
        }

        let outcome = wait_for_reload_or_exit(runtime.config.auto_reload, file_events).await;

        let _ = shutdown_tx.send(true);
        for handle in handles {
            handle.abort();
        }

        match outcome {
            ReloadOutcome::Reload => {
                info!("reloading");
                continue;
            }
            ReloadOutcome::Exit => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Blocks until either a signal or a watched file change tells us what to
/// do next. SIGHUP always means reload (regardless of `auto_reload`, which
/// only gates the filesystem watch); SIGINT/SIGTERM always mean exit.
async fn wait_for_reload_or_exit(auto_reload: bool, mut file_events: mpsc::Receiver<()>) -> ReloadOutcome {
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(value) => value,
        Err(err) => {
            error!(%err, "failed to install SIGHUP handler");
            return ReloadOutcome::Exit;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(value) => value,
        Err(err) => {
            error!(%err, "failed to install SIGTERM handler");
            return ReloadOutcome::Exit;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(value) => value,
        Err(err) => {
            error!(%err, "failed to install SIGINT handler");
            return ReloadOutcome::Exit;
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("received SIGHUP");
                return ReloadOutcome::Reload;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return ReloadOutcome::Exit;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                return ReloadOutcome::Exit;
            }
            event = file_events.recv(), if auto_reload => {
                if event.is_some() {
                    info!("watched file changed on disk");
                    return ReloadOutcome::Reload;
                }
            }
        }
    }
}

/// Watches `paths` for changes on a dedicated thread (`notify`'s blocking
/// API doesn't play well with an async executor) and forwards a debounced
/// "something changed" signal into the async world. Events within one
/// second of the last forwarded one are coalesced, since a single `save`
/// in most editors produces several filesystem events.
fn spawn_file_watcher(paths: Vec<PathBuf>) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(8);
    if paths.is_empty() {
        return rx;
    }

    std::thread::spawn(move || {
        let (watch_tx, watch_rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(watch_tx) {
            Ok(watcher) => watcher,
            Err(err) => {
                error!(%err, "failed to start configuration file watcher");
                return;
            }
        };
        for path in &paths {
            if let Err(err) = notify::Watcher::watch(&mut watcher, path, notify::RecursiveMode::NonRecursive) {
                warn!(path = %path.display(), %err, "failed to watch path for changes");
            }
        }

        let debounce = Duration::from_secs(1);
        let mut last_sent = std::time::Instant::now().checked_sub(debounce).unwrap_or_else(std::time::Instant::now);
        for event in watch_rx {
            if event.is_err() {
                continue;
            }
            if last_sent.elapsed() < debounce {
                continue;
            }
            last_sent = std::time::Instant::now();
            if tx.blocking_send(()).is_err() {
                break;
            }
        }
    });

    rx
}
