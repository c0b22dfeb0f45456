//! Process-isolated invocations.
//!
//! With `fork_process` enabled, each function request runs in a fresh worker
//! process: the parent ([`IsolatedRunner`]) spawns it, writes one
//! [`InvocationMessage`] line to its stdin and reads [`WorkerMessage`] lines
//! from its stdout until an error or a reply arrives. Then the worker is
//! killed. The worker ([`run_worker`]) starts cold: it rebuilds the route
//! table and global scope from the configuration it was sent.
//!
//! Wire format, one JSON object per line:
//!
//! ```text
//! parent -> worker  {"functionPath": "...", "event": {...}, "config": {...}, "path": "/hello"}
//! worker -> parent  {"debugMessage": "...", "debugArgs": [...]}
//!                   {"err": {"name": "...", "message": "...", "stack": "..."}}
//!                   {"reply": {"statusCode": 200, "headers": {...}, "body": "..."}}
//! ```

use std::backtrace::Backtrace;
use std::fmt;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::field::{Field, Visit};
use tracing::{debug, warn};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::ServerConfig;
use crate::context::{Event, construct_context};
use crate::dispatch::{HandlerError, HandlerLoader, invoke, panic_message};
use crate::router::RouteTable;
use crate::runtime::{PendingResponse, SerializedResponse, install_global_scope};

/// Subcommand the binary answers to as a worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// The message that starts a worker's single invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMessage {
    pub function_path: PathBuf,
    pub event: Event,
    pub config: ServerConfig,
    /// Public path of the function.
    pub path: String,
}

/// A message from a worker to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    #[serde(rename_all = "camelCase")]
    Debug {
        debug_message: String,
        #[serde(default)]
        debug_args: Vec<Value>,
    },
    Error {
        err: HandlerError,
    },
    Reply {
        reply: SerializedResponse,
    },
}

/// How a worker ended its invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Reply(SerializedResponse),
    Error(HandlerError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed invocation message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker exited without a result ({status})")]
    NoOutcome { status: String },
}

/// The command that starts a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// `None` runs the current executable.
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: Some(program.into()),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The current executable with the worker subcommand.
    pub fn current_exe() -> Self {
        Self {
            program: None,
            args: vec![WORKER_SUBCOMMAND.to_owned()],
        }
    }

    fn program(&self) -> io::Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe(),
        }
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::current_exe()
    }
}

/// Parent side: one worker process per invocation.
#[derive(Debug, Clone, Default)]
pub struct IsolatedRunner {
    command: WorkerCommand,
}

impl IsolatedRunner {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    /// Runs `invocation` in a new worker and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the worker cannot be started or talked to,
    /// or exits before sending an error or a reply.
    pub async fn run(&self, invocation: &InvocationMessage) -> Result<WorkerOutcome, WorkerError> {
        let program = self.command.program()?;
        let mut child = Command::new(&program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: program.clone(),
                source,
            })?;
        debug!(pid = child.id(), path = %invocation.path, "worker spawned");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin unavailable"))?;
        let mut line = serde_json::to_vec(invocation)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout unavailable"))?;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let outcome = match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Debug {
                    debug_message,
                    debug_args,
                }) => {
                    debug!(target: "twilio_run::worker", args = ?debug_args, "{debug_message}");
                    continue;
                }
                Ok(WorkerMessage::Error { err }) => WorkerOutcome::Error(err),
                Ok(WorkerMessage::Reply { reply }) => WorkerOutcome::Reply(reply),
                Err(_) => {
                    warn!(target: "twilio_run::worker", "unexpected worker output: {line}");
                    continue;
                }
            };
            if let Err(err) = child.kill().await {
                debug!(error = %err, "worker already gone");
            }
            return Ok(outcome);
        }

        let status = child.wait().await?;
        Err(WorkerError::NoOutcome {
            status: status.to_string(),
        })
    }
}

/// Child side: serves the invocation written to stdin and reports on stdout.
///
/// # Errors
///
/// Returns [`WorkerError`] if the invocation cannot be read or the outcome
/// cannot be written.
pub async fn run_worker(loader: Arc<dyn HandlerLoader>) -> Result<(), WorkerError> {
    install_fatal_hook();

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    let invocation: InvocationMessage = serde_json::from_str(&line)?;

    let message = serve(loader, invocation).await;
    emit(&message)?;
    Ok(())
}

async fn serve(loader: Arc<dyn HandlerLoader>, invocation: InvocationMessage) -> WorkerMessage {
    let InvocationMessage {
        function_path,
        event,
        config,
        path,
    } = invocation;

    let routes = RouteTable::new();
    if let Err(err) = routes.set_routes(config.routes.clone()) {
        return WorkerMessage::Error {
            err: HandlerError::named("RouteError", err.to_string()),
        };
    }
    install_global_scope(&config, &routes);

    let context = construct_context(&config, &path);
    let handler = match loader.load(&function_path) {
        Ok(handler) => handler,
        Err(err) => return WorkerMessage::Error { err: err.into() },
    };

    let timeout = config.handler_timeout_ms.map(Duration::from_millis);
    match invoke(handler, context, event, timeout).await {
        Ok(payload) => WorkerMessage::Reply {
            reply: PendingResponse::from(payload).serialize(),
        },
        Err(err) => WorkerMessage::Error { err },
    }
}

/// Writes one message line to stdout.
fn emit(message: &WorkerMessage) -> io::Result<()> {
    let line = serde_json::to_string(message)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()
}

/// Reports any panic to the parent as an error before the worker dies.
fn install_fatal_hook() {
    std::panic::set_hook(Box::new(|info| {
        let message = panic_message(info.payload());
        let location = info
            .location()
            .map(|location| format!(" at {location}"))
            .unwrap_or_default();
        let err = HandlerError::Exception {
            stack: Some(format!(
                "Panic: {message}{location}\n{}",
                Backtrace::force_capture()
            )),
            message,
            name: "Panic".to_owned(),
        };
        let _ = emit(&WorkerMessage::Error { err });
    }));
}

/// A [`Layer`] that sends every log event to the parent as a debug message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardLayer;

impl<S: tracing::Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = ForwardVisitor::default();
        event.record(&mut visitor);
        let message = WorkerMessage::Debug {
            debug_message: visitor.message,
            debug_args: visitor.args,
        };
        let _ = emit(&message);
    }
}

#[derive(Default)]
struct ForwardVisitor {
    message: String,
    args: Vec<Value>,
}

impl ForwardVisitor {
    fn push_arg(&mut self, field: &Field, value: String) {
        let mut arg = Map::new();
        arg.insert(field.name().to_owned(), Value::String(value));
        self.args.push(Value::Object(arg));
    }
}

impl Visit for ForwardVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.push_arg(field, value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_arg(field, format!("{value:?}"));
        }
    }
}

/// Installs the worker's subscriber: everything goes to the parent.
pub fn init_worker_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = Registry::default()
        .with(filter)
        .with(ForwardLayer)
        .try_init();
}
