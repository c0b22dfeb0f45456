//! Turning a function file into a [`Handler`].
//!
//! Loading is an explicit, cached step. [`CachedLoader`] keeps loaded
//! handlers according to a [`ReloadPolicy`]: in live mode every request loads
//! afresh so on-disk edits show up immediately, otherwise a handler is
//! loaded once and kept.
//!
//! Two sources ship:
//!
//! - [`RegistryLoader`]: handlers compiled into the host binary, registered
//!   under the file path of the function they implement.
//! - [`ProgramLoader`]: the function file is an executable that speaks JSON
//!   over stdin/stdout (see [`ProgramHandler`]).

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::error::HandlerError;
use super::handler::{Callback, Completion, Handler, Payload};
use crate::context::{Event, ExecutionContext};
use crate::runtime::global_scope;

/// Why a function could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("function file {0} does not exist")]
    NotFound(PathBuf),

    #[error("{0} does not provide a handler")]
    MissingHandler(PathBuf),

    #[error("failed to load {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<LoadError> for HandlerError {
    fn from(err: LoadError) -> Self {
        Self::named("LoadError", err.to_string())
    }
}

/// Produces the handler for a function file.
pub trait HandlerLoader: Send + Sync {
    /// # Errors
    ///
    /// [`LoadError::NotFound`] when nothing exists at `path`,
    /// [`LoadError::MissingHandler`] when something does but it is not a
    /// handler, and [`LoadError::Io`] for anything else.
    fn load(&self, path: &Path) -> Result<Arc<dyn Handler>, LoadError>;
}

/// When a [`CachedLoader`] goes back to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPolicy {
    /// Load on every request.
    Live,
    /// Load once per file and keep it until invalidated.
    Cached,
}

impl ReloadPolicy {
    pub fn from_live(live: bool) -> Self {
        if live { Self::Live } else { Self::Cached }
    }
}

/// A [`HandlerLoader`] with an explicit cache in front of another loader.
pub struct CachedLoader {
    inner: Arc<dyn HandlerLoader>,
    policy: ReloadPolicy,
    cache: Mutex<HashMap<PathBuf, Arc<dyn Handler>>>,
}

impl CachedLoader {
    pub fn new(inner: Arc<dyn HandlerLoader>, policy: ReloadPolicy) -> Self {
        Self {
            inner,
            policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ReloadPolicy {
        self.policy
    }

    /// Drops every cached handler.
    pub fn invalidate_all(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if !cache.is_empty() {
            debug!(handlers = cache.len(), "handler cache cleared");
        }
        cache.clear();
    }

    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl HandlerLoader for CachedLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Handler>, LoadError> {
        if self.policy == ReloadPolicy::Live {
            return self.inner.load(path);
        }
        if let Some(handler) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Ok(Arc::clone(handler));
        }

        let handler = self.inner.load(path)?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), Arc::clone(&handler));
        Ok(handler)
    }
}

type HandlerFactory = Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

/// Handlers compiled into the binary, keyed by function file path.
///
/// Each load builds a fresh instance from the registered value, so live
/// mode gets a clean handler per request.
///
/// ```
/// use std::path::Path;
/// use twilio_run::dispatch::{HandlerLoader, RegistryLoader, callback_fn};
///
/// let registry = RegistryLoader::new();
/// registry.register(
///     "/project/functions/hello.rs",
///     callback_fn(|_context, _event, callback| {
///         let _ = callback.ok("Hello!");
///         Ok(())
///     }),
/// );
/// assert!(registry.load(Path::new("/project/functions/hello.rs")).is_ok());
/// ```
#[derive(Default)]
pub struct RegistryLoader {
    factories: RwLock<HashMap<PathBuf, HandlerFactory>>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for the function file at `path`, replacing any
    /// previous registration.
    pub fn register<H>(&self, path: impl Into<PathBuf>, handler: H)
    where
        H: Handler + Clone + 'static,
    {
        let factory: HandlerFactory = Arc::new(move || Arc::new(handler.clone()) as Arc<dyn Handler>);
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), factory);
    }
}

impl HandlerLoader for RegistryLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Handler>, LoadError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned();
        match factory {
            Some(factory) => Ok(factory()),
            None if path.exists() => Err(LoadError::MissingHandler(path.to_path_buf())),
            None => Err(LoadError::NotFound(path.to_path_buf())),
        }
    }
}

/// Runs function files as executables.
#[derive(Debug, Clone)]
pub struct ProgramLoader {
    base_dir: PathBuf,
}

impl ProgramLoader {
    /// Programs run with `base_dir` as their working directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl HandlerLoader for ProgramLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Handler>, LoadError> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(path.to_path_buf()));
            }
            Err(source) => {
                return Err(LoadError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if !metadata.is_file() || !is_executable(&metadata) {
            return Err(LoadError::MissingHandler(path.to_path_buf()));
        }
        Ok(Arc::new(ProgramHandler {
            program: path.to_path_buf(),
            base_dir: self.base_dir.clone(),
        }))
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// A handler backed by an executable.
///
/// The program gets one JSON line on stdin:
///
/// ```text
/// {"context": {...}, "event": {...}, "globals": {...}}
/// ```
///
/// where `globals` is the installed scope as rendered by
/// [`GlobalScope::to_json`](crate::runtime::GlobalScope::to_json), or `null`
/// if none is installed. It must print its completion as the last non-empty
/// line on stdout:
///
/// ```text
/// {"ok": {"type": "text", "value": "Hello"}}
/// {"err": {"name": "Error", "message": "nope"}}
/// ```
///
/// Earlier stdout lines and all stderr lines are logged.
#[derive(Debug, Clone)]
pub struct ProgramHandler {
    program: PathBuf,
    base_dir: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ProgramCompletion {
    Ok(Payload),
    Err(HandlerError),
}

impl Handler for ProgramHandler {
    fn handle(&self, context: ExecutionContext, event: Event, callback: Callback) -> Result<(), HandlerError> {
        let globals = global_scope().map_or(Value::Null, |scope| scope.to_json());
        let input = json!({
            "context": context.to_json(),
            "event": Value::Object(event),
            "globals": globals,
        });
        let program = self.clone();
        tokio::spawn(async move {
            let completion = program.run(input).await;
            let _ = callback.done(completion);
        });
        Ok(())
    }
}

impl ProgramHandler {
    async fn run(&self, input: Value) -> Completion {
        let program = self.program.display().to_string();
        let mut child = Command::new(&self.program)
            .current_dir(&self.base_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| HandlerError::named("SpawnError", format!("failed to start {program}: {err}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = input.to_string().into_bytes();
            line.push(b'\n');
            match stdin.write_all(&line).await {
                Ok(()) => {}
                // Programs that ignore their input may exit before reading it.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                Err(err) => return Err(err.into()),
            }
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            let program = program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "twilio_run::handler", %program, "{line}");
                }
            })
        });

        let mut last_line = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(previous) = last_line.replace(line) {
                    info!(target: "twilio_run::handler", %program, "{previous}");
                }
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        debug!(%program, %status, "program handler exited");

        let parsed = last_line
            .as_deref()
            .map(serde_json::from_str::<ProgramCompletion>);
        match parsed {
            Some(Ok(ProgramCompletion::Ok(payload))) => Ok(payload),
            Some(Ok(ProgramCompletion::Err(err))) => Err(err),
            _ if !status.success() => Err(HandlerError::named(
                "ProgramError",
                format!("{program} exited with {status}"),
            )),
            Some(Err(err)) => Err(HandlerError::named(
                "ProgramError",
                format!("{program} printed an invalid completion: {err}"),
            )),
            None => Err(HandlerError::named(
                "ProgramError",
                format!("{program} exited without printing a completion"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Counting(Arc<AtomicUsize>);

    impl HandlerLoader for Counting {
        fn load(&self, _path: &Path) -> Result<Arc<dyn Handler>, LoadError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(crate::dispatch::callback_fn(|_, _, callback| {
                let _ = callback.ok("hi");
                Ok(())
            })))
        }
    }

    #[test]
    fn cached_policy_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = CachedLoader::new(Arc::new(Counting(Arc::clone(&loads))), ReloadPolicy::Cached);
        let path = Path::new("/f");
        assert!(loader.load(path).is_ok());
        assert!(loader.load(path).is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(loader.cached(), 1);

        loader.invalidate_all();
        assert!(loader.load(path).is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn live_policy_always_reloads() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = CachedLoader::new(Arc::new(Counting(Arc::clone(&loads))), ReloadPolicy::Live);
        for _ in 0..3 {
            assert!(loader.load(Path::new("/f")).is_ok());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
        assert_eq!(loader.cached(), 0);
    }

    #[test]
    fn registry_distinguishes_missing_file_from_missing_handler() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("plain.txt");
        std::fs::write(&existing, "not a handler").unwrap();

        let registry = RegistryLoader::new();
        assert!(matches!(registry.load(&existing), Err(LoadError::MissingHandler(_))));
        assert!(matches!(
            registry.load(&dir.path().join("gone.rs")),
            Err(LoadError::NotFound(_))
        ));
    }

    #[test]
    fn program_loader_reports_not_found() {
        let loader = ProgramLoader::new("/");
        assert!(matches!(
            loader.load(Path::new("/no/such/function")),
            Err(LoadError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn program_loader_rejects_non_executables() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");
        std::fs::write(&file, "{}").unwrap();
        let loader = ProgramLoader::new(dir.path());
        assert!(matches!(loader.load(&file), Err(LoadError::MissingHandler(_))));
    }
}
