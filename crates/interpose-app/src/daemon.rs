//! The `serve` process.
//!
//! Owns the only [`StateCoordinator`] on the machine. The control API, the
//! quick toggle and `SIGUSR1` are all surfaces attached to it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use interpose_core::{
    CommandShell, PrivilegedShell, RuleController, SettingsStore, StateCoordinator,
};
use interpose_server::{AppState, Server, ServerConfig};
use interpose_storage::Database;
use interpose_tray::{QuickToggle, TileEvent};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Options for [`run`].
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Settings database; `None` uses the platform data directory.
    pub db_path: Option<PathBuf>,
    /// Privileged shell command line, e.g. `su` or `sudo -n sh`.
    pub shell: String,
    pub api: ServerConfig,
}

/// Runs the daemon until Ctrl-C or SIGTERM.
pub fn run(options: DaemonOptions) -> anyhow::Result<()> {
    let shell = CommandShell::parse(&options.shell)
        .with_context(|| format!("invalid --shell value {:?}", options.shell))?;
    info!(program = shell.program(), "using privileged shell");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(serve(options, Arc::new(shell), shutdown_signal()))
}

/// Starts every component, waits for `shutdown`, then stops them in order:
/// the coordinator first (draining the in-flight request and ending every
/// event stream), then the API server.
pub async fn serve<F>(
    options: DaemonOptions,
    shell: Arc<dyn PrivilegedShell>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let db = open_database(options.db_path.as_deref())?;
    let settings: Arc<dyn SettingsStore> = Arc::new(db);
    let rules = RuleController::new(shell);

    let coordinator = tokio::task::spawn_blocking(move || StateCoordinator::start(rules, settings))
        .await?
        .context("failed to start state coordinator")?;
    info!(state = %coordinator.current_state().describe(), "coordinator ready");

    let (tile, tile_events) = QuickToggle::attach(coordinator.clone())?;
    log_tile_events(tile_events)?;
    let toggle_task = tokio::spawn(toggle_on_signal(tile));

    let server = Server::new(options.api, AppState::new(coordinator.clone()))?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server_task = tokio::spawn(server.run_until(async move {
        let _ = stop_rx.await;
    }));

    let finished = tokio::select! {
        result = &mut server_task => Some(result),
        _ = shutdown => None,
    };

    info!("Interpose shutting down");
    let closing = coordinator.clone();
    tokio::task::spawn_blocking(move || closing.shutdown()).await?;
    toggle_task.abort();

    let result = match finished {
        Some(result) => result,
        None => {
            let _ = stop_tx.send(());
            server_task.await
        }
    };
    result??;

    Ok(())
}

fn open_database(path: Option<&Path>) -> anyhow::Result<Database> {
    let db = match path {
        Some(path) => Database::with_path(path),
        None => Database::new(),
    };
    db.context("failed to open settings database")
}

fn log_tile_events(events: Receiver<TileEvent>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("tile-events".into())
        .spawn(move || {
            for event in events {
                match event {
                    TileEvent::StatusChanged(status) => {
                        info!(%status, label = status.label(), "{}", status.tooltip())
                    }
                    TileEvent::Failed(error) => debug!(%error, "tile reported failure"),
                    TileEvent::Detached => break,
                }
            }
        })?;
    Ok(())
}

/// One-tap toggle without a GUI: `kill -USR1 <pid>`.
#[cfg(unix)]
async fn toggle_on_signal(tile: QuickToggle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut toggles = match signal(SignalKind::user_defined1()) {
        Ok(signal) => signal,
        Err(e) => {
            warn!(error = %e, "SIGUSR1 toggle unavailable");
            return;
        }
    };

    while toggles.recv().await.is_some() {
        match tile.click() {
            Ok(pending) => {
                tokio::spawn(async move {
                    match pending.await {
                        Ok(state) => info!(state = %state.describe(), "toggled by signal"),
                        Err(e) => warn!(error = %e, "signal toggle failed"),
                    }
                });
            }
            Err(e) => warn!(error = %e, "toggle signal ignored"),
        }
    }
}

#[cfg(not(unix))]
async fn toggle_on_signal(tile: QuickToggle) {
    std::future::pending::<()>().await;
    drop(tile);
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
