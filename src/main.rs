use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use twilio_run::background::ProjectWatcher;
use twilio_run::config::{DEFAULT_ENV_FILE, ServerConfig};
use twilio_run::dispatch::{CachedLoader, Dispatcher, ProgramLoader, ReloadPolicy};
use twilio_run::server::{App, RuntimeState, Server};
use twilio_run::worker::{self, IsolatedRunner, WORKER_SUBCOMMAND, WorkerCommand};

#[derive(Debug, Parser)]
#[command(name = "twilio-run", version, about = "Run a functions project locally")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve a project directory over HTTP
    Start(StartCmd),

    /// Serve a single invocation read from stdin
    #[command(name = WORKER_SUBCOMMAND, hide = true)]
    Worker(WorkerCmd),
}

#[derive(Debug, Clone, Args)]
struct StartCmd {
    /// Project directory
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Public base URL; defaults to http://localhost:<port>
    #[arg(long)]
    url: Option<String>,

    /// Environment file, relative to the project directory
    #[arg(short, long, default_value = DEFAULT_ENV_FILE)]
    env: PathBuf,

    /// Reload handlers on every request and watch the project for changes
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    live: bool,

    /// Log every request
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    logs: bool,

    /// Run each function invocation in its own worker process
    #[arg(long)]
    fork_process: bool,

    /// Keep runtime-internal frames in error stack traces
    #[arg(long)]
    full_stack_traces: bool,

    /// Fail invocations that take longer than this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Functions directory, relative to the project directory
    #[arg(long)]
    functions_dir: Option<PathBuf>,

    /// Assets directory, relative to the project directory
    #[arg(long)]
    assets_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct WorkerCmd {
    /// Working directory for function programs
    #[arg(long, default_value = ".")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start(cmd) => cmd.handle().await,
        Command::Worker(cmd) => cmd.handle().await,
    }
}

impl StartCmd {
    fn config(&self) -> Result<(ServerConfig, PathBuf)> {
        let base_dir = self
            .dir
            .canonicalize()
            .with_context(|| format!("project directory {} not found", self.dir.display()))?;
        let url = self
            .url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port));

        let mut config = ServerConfig::new(&base_dir, url);
        config.live = self.live;
        config.logs = self.logs;
        config.fork_process = self.fork_process;
        config.full_stack_traces = self.full_stack_traces;
        config.handler_timeout_ms = self.timeout_ms;
        config.functions_dir = self.functions_dir.clone();
        config.assets_dir = self.assets_dir.clone();

        let env_file = base_dir.join(&self.env);
        config.load_env_file(&env_file)?;
        config.discover_routes()?;
        Ok((config, env_file))
    }

    async fn handle(self) -> Result<()> {
        init_logging();

        let (config, env_file) = self.config()?;
        let base_dir = config.base_dir.clone();
        info!(
            functions = config.routes.functions.len(),
            assets = config.routes.assets.len(),
            "project loaded"
        );

        let loader = Arc::new(CachedLoader::new(
            Arc::new(ProgramLoader::new(&base_dir)),
            ReloadPolicy::from_live(config.live),
        ));
        let state = Arc::new(RuntimeState::new(config).context("invalid project layout")?);

        let _watcher = if self.live {
            match ProjectWatcher::start(Arc::clone(&state), Arc::clone(&loader), env_file) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    warn!(error = %err, "live reload disabled");
                    None
                }
            }
        } else {
            None
        };

        let exe = std::env::current_exe().context("cannot locate own executable")?;
        let runner = IsolatedRunner::new(WorkerCommand::new(
            exe,
            [
                WORKER_SUBCOMMAND.to_owned(),
                "--dir".to_owned(),
                base_dir.display().to_string(),
            ],
        ));
        let app = Arc::new(App::new(state, Dispatcher::new(loader), runner));

        let server = Server::bind(format!("{}:{}", self.host, self.port)).await?;
        for path in app.state().routes().get_routes().keys() {
            info!(route = %path, "serving");
        }
        server
            .run(move |request| {
                let app = Arc::clone(&app);
                async move { app.handle(request).await }
            })
            .await?;
        Ok(())
    }
}

impl WorkerCmd {
    async fn handle(self) -> Result<()> {
        worker::init_worker_logging();
        worker::run_worker(Arc::new(ProgramLoader::new(self.dir))).await?;
        Ok(())
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
