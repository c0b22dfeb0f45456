//! Live reload: watches the project directory and rebuilds server state.
//!
//! File system events are coalesced over [`DEBOUNCE`]; each settled batch
//! rediscovers resources, rereads the environment file, swaps the
//! [`RuntimeState`] and drops every cached handler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::dispatch::CachedLoader;
use crate::router::RouteError;
use crate::server::RuntimeState;

/// Quiet period after the last event before a reload runs.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Route(#[from] RouteError),
}

#[derive(Debug, Error)]
#[error("failed to watch {path}: {source}")]
pub struct WatchError {
    path: PathBuf,
    #[source]
    source: notify::Error,
}

/// Rebuilds `state` from disk and invalidates `loader`.
///
/// On error nothing is swapped: the server keeps serving the previous routes
/// and environment.
///
/// # Errors
///
/// Returns [`ReloadError`] if discovery, the environment file or the new
/// route table fail.
pub fn reload_project(state: &RuntimeState, loader: &CachedLoader, env_file: &Path) -> Result<(), ReloadError> {
    let mut config = (*state.config()).clone();
    config.discover_routes()?;
    config.load_env_file(env_file)?;
    let routes = config.routes.functions.len() + config.routes.assets.len();

    state.reload(config)?;
    loader.invalidate_all();
    info!(routes, "project reloaded");
    Ok(())
}

/// Keeps the watch alive; dropping it stops reloading.
pub struct ProjectWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ProjectWatcher {
    /// Starts watching the project's base directory.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError`] if the watcher cannot be created or the base
    /// directory cannot be watched.
    pub fn start(state: Arc<RuntimeState>, loader: Arc<CachedLoader>, env_file: PathBuf) -> Result<Self, WatchError> {
        let root = state.config().base_dir.clone();
        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();

        let to_watch_error = |source| WatchError {
            path: root.clone(),
            source,
        };
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(to_watch_error)?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(to_watch_error)?;
        info!(root = %root.display(), "watching for changes");

        let task = tokio::spawn(watch_loop(rx, state, loader, env_file));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_loop(
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    state: Arc<RuntimeState>,
    loader: Arc<CachedLoader>,
    env_file: PathBuf,
) {
    while let Some(event) = rx.recv().await {
        if !is_change(event) {
            continue;
        }

        // Editors write in bursts; wait until the directory settles.
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        if let Err(err) = reload_project(&state, &loader, &env_file) {
            warn!(error = %err, "reload failed, keeping previous routes");
        }
    }
}

fn is_change(event: notify::Result<notify::Event>) -> bool {
    match event {
        Ok(event) => {
            debug!(kind = ?event.kind, paths = ?event.paths, "file system event");
            !event.kind.is_access()
        }
        Err(err) => {
            warn!(error = %err, "watch error");
            false
        }
    }
}
