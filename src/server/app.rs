//! The HTTP front end: route resolution, assets and function dispatch.

use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, warn};

use crate::config::ServerConfig;
use crate::context::event_from_request;
use crate::dispatch::{Dispatcher, HandlerError, error_response, not_found};
use crate::http::{Request, Response, StatusCode};
use crate::middleware::{
    LoggerMiddleware, Middleware, MiddlewareHandler, Next, Pipeline, ResponseFuture, from_middleware,
};
use crate::resources::{Access, ResourceDescriptor};
use crate::router::{RouteEntry, RouteError, RouteKind, RouteTable};
use crate::runtime::install_global_scope;
use crate::security::CorsPreflight;
use crate::worker::{InvocationMessage, IsolatedRunner, WorkerOutcome};

/// Paths tried, in order, when `/` has no route of its own.
pub const INDEX_FALLBACKS: [&str; 2] = ["/index.html", "/assets/index.html"];

pub const PRIVATE_ASSET: &str = "This asset has been marked as private";
pub const ASSET_NOT_FOUND: &str = "Could not find asset";

/// Mutable server state: the configuration and the route table built from it.
///
/// Both are replaced wholesale on reload. A request keeps the snapshots it
/// took when it started.
#[derive(Debug)]
pub struct RuntimeState {
    config: RwLock<Arc<ServerConfig>>,
    routes: RouteTable,
}

impl RuntimeState {
    /// Builds the route table for `config` and installs the global scope.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if two resources claim the same path.
    pub fn new(config: ServerConfig) -> Result<Self, RouteError> {
        let routes = RouteTable::new();
        routes.set_routes(config.routes.clone())?;
        install_global_scope(&config, &routes);
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            routes,
        })
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Swaps in a new configuration, rebuilding routes and global scope.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] and keeps the current state if the new routes
    /// conflict.
    pub fn reload(&self, config: ServerConfig) -> Result<(), RouteError> {
        self.routes.set_routes(config.routes.clone())?;
        install_global_scope(&config, &self.routes);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        Ok(())
    }

    /// The route serving `path`, including the index fallbacks for `/`.
    pub fn resolve(&self, path: &str) -> Option<RouteEntry> {
        let routes = self.routes.get_routes();
        if let Some(entry) = routes.get(path) {
            return Some(entry.clone());
        }
        if path != "/" {
            return None;
        }
        INDEX_FALLBACKS
            .iter()
            .find_map(|fallback| routes.get(*fallback).cloned())
    }
}

/// The request handler behind the server.
///
/// Requests run through a middleware pipeline: request logging (when
/// enabled), CORS preflight, then the endpoint that serves assets and
/// functions.
pub struct App {
    state: Arc<RuntimeState>,
    dispatcher: Dispatcher,
    pipeline: Pipeline,
}

impl App {
    pub fn new(state: Arc<RuntimeState>, dispatcher: Dispatcher, runner: IsolatedRunner) -> Self {
        let endpoint = Endpoint {
            state: Arc::clone(&state),
            dispatcher: dispatcher.clone(),
            runner,
        };

        let mut middlewares: Vec<MiddlewareHandler> = Vec::new();
        if state.config().logs {
            middlewares.push(from_middleware(Arc::new(LoggerMiddleware)));
        }
        middlewares.push(from_middleware(Arc::new(CorsPreflight::new(Arc::clone(&state)))));
        middlewares.push(from_middleware(Arc::new(endpoint)));

        Self {
            state,
            dispatcher,
            pipeline: Pipeline::new(middlewares),
        }
    }

    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn handle(&self, request: Request) -> Response {
        self.pipeline.run(request).await
    }
}

#[derive(Clone)]
struct Endpoint {
    state: Arc<RuntimeState>,
    dispatcher: Dispatcher,
    runner: IsolatedRunner,
}

impl Middleware for Endpoint {
    fn handle(&self, request: Request, _next: Next) -> ResponseFuture {
        let endpoint = self.clone();
        Box::pin(async move { endpoint.serve(request).await })
    }
}

impl Endpoint {
    async fn serve(&self, request: Request) -> Response {
        let config = self.state.config();
        let Some(entry) = self.state.resolve(request.path()) else {
            return not_found();
        };

        match entry.kind {
            RouteKind::Asset => serve_asset(&entry.resource).await,
            RouteKind::Function if config.fork_process => self.fork(&entry, &request, &config).await,
            RouteKind::Function => self.dispatcher.dispatch(&entry, &request, &config).await,
        }
    }

    async fn fork(&self, entry: &RouteEntry, request: &Request, config: &ServerConfig) -> Response {
        let function_path = &entry.resource.file_path;
        if !function_path.exists() {
            warn!(file = %function_path.display(), "function file missing");
            return not_found();
        }

        let user_agent = request.headers().get("user-agent");
        let invocation = InvocationMessage {
            function_path: function_path.clone(),
            event: event_from_request(request),
            config: config.clone(),
            path: entry.path().to_owned(),
        };
        match self.runner.run(&invocation).await {
            Ok(WorkerOutcome::Reply(reply)) => reply.into_response(),
            Ok(WorkerOutcome::Error(err)) => error_response(err, user_agent, config.full_stack_traces),
            Err(err) => {
                error!(error = %err, path = %entry.path(), "worker failed");
                error_response(
                    HandlerError::named("WorkerError", err.to_string()),
                    user_agent,
                    config.full_stack_traces,
                )
            }
        }
    }
}

async fn serve_asset(resource: &ResourceDescriptor) -> Response {
    if resource.access == Access::Private {
        return Response::new(StatusCode::FORBIDDEN).body(PRIVATE_ASSET);
    }

    let content = match &resource.content {
        Some(content) => content.clone().into_bytes(),
        None => match tokio::fs::read(&resource.file_path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Response::new(StatusCode::NOT_FOUND).body(ASSET_NOT_FOUND);
            }
            Err(err) => {
                error!(file = %resource.file_path.display(), error = %err, "failed to read asset");
                return error_response(err.into(), None, false);
            }
        },
    };

    let content_type = mime_guess::from_path(&resource.path).first_or_octet_stream();
    Response::new(StatusCode::OK)
        .header("Content-Type", content_type.essence_str())
        .body_bytes(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resources;

    fn state(resources: Resources) -> RuntimeState {
        let mut config = ServerConfig::new("/p", "http://localhost:3000");
        config.routes = resources;
        RuntimeState::new(config).unwrap()
    }

    #[test]
    fn root_falls_back_to_index_assets() {
        let state = state(Resources::new(
            vec![],
            vec![ResourceDescriptor::new("/assets/index.html", "/p/assets/assets/index.html")],
        ));
        assert_eq!(state.resolve("/").unwrap().path(), "/assets/index.html");
        assert!(state.resolve("/other").is_none());
    }

    #[test]
    fn index_html_preferred_over_assets_index() {
        let state = state(Resources::new(
            vec![],
            vec![
                ResourceDescriptor::new("/assets/index.html", "/p/a"),
                ResourceDescriptor::new("/index.html", "/p/b"),
            ],
        ));
        assert_eq!(state.resolve("/").unwrap().path(), "/index.html");
    }

    #[test]
    fn failed_reload_keeps_state() {
        let state = state(Resources::new(vec![ResourceDescriptor::new("/a", "/p/a")], vec![]));
        let mut next = ServerConfig::new("/p", "http://localhost:4000");
        next.routes = Resources::new(
            vec![ResourceDescriptor::new("/b", "/p/b")],
            vec![ResourceDescriptor::new("/b", "/p/b.txt")],
        );
        assert!(state.reload(next).is_err());
        assert!(state.resolve("/a").is_some());
        assert_eq!(state.config().url, "http://localhost:3000");
    }

    #[tokio::test]
    async fn asset_responses() {
        let private = ResourceDescriptor::new("/secret.txt", "/p/secret.txt").with_access(Access::Private);
        let response = serve_asset(&private).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body_text(), PRIVATE_ASSET);

        let missing = ResourceDescriptor::new("/gone.txt", "/definitely/not/here.txt");
        let response = serve_asset(&missing).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body_text(), ASSET_NOT_FOUND);

        let inline = ResourceDescriptor::new("/style.css", "/p/style.css").with_content("a{}");
        let response = serve_asset(&inline).await;
        assert_eq!(response.headers().get("content-type"), Some("text/css"));
        assert_eq!(response.body_text(), "a{}");
    }
}
