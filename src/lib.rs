//! # twilio_run
//!
//! A local development runtime for serverless projects: a directory of
//! function handlers and static assets served over HTTP the way the hosted
//! platform would serve them.
//!
//! Requests are routed by exact path. Assets are read from disk (private
//! ones refused); functions are invoked with an [`ExecutionContext`], an
//! [`Event`] built from the request, and a completion [`Callback`], either
//! in-process or in a fresh worker process per request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use twilio_run::config::ServerConfig;
//! use twilio_run::dispatch::{CachedLoader, Dispatcher, ProgramLoader, ReloadPolicy};
//! use twilio_run::server::{App, RuntimeState, Server};
//! use twilio_run::worker::IsolatedRunner;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ServerConfig::new("./my-project", "http://localhost:3000");
//!     config.discover_routes()?;
//!
//!     let loader = Arc::new(CachedLoader::new(
//!         Arc::new(ProgramLoader::new("./my-project")),
//!         ReloadPolicy::Live,
//!     ));
//!     let state = Arc::new(RuntimeState::new(config)?);
//!     let app = Arc::new(App::new(state, Dispatcher::new(loader), IsolatedRunner::default()));
//!
//!     let server = Server::bind("127.0.0.1:3000").await?;
//!     server
//!         .run(move |request| {
//!             let app = Arc::clone(&app);
//!             async move { app.handle(request).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod http;
pub mod middleware;
pub mod resources;
pub mod router;
pub mod runtime;
pub mod security;
pub mod server;
pub mod worker;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::ServerConfig;
pub use context::{Event, ExecutionContext};
pub use dispatch::{Callback, Handler, HandlerError, Payload};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{App, RuntimeState, Server, ServerError};
