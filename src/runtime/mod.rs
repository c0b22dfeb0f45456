//! The emulated sandbox handed to handler code.
//!
//! Hosted functions can reach a handful of well-known globals without
//! importing anything. Here they live in one [`GlobalScope`] value that is
//! built by [`install_global_scope`] and read back with [`global_scope`].
//! Nothing else writes to it: the server installs it at startup and again
//! after every reload, and a worker installs its own copy cold from the
//! configuration it was sent.
//!
//! The scope holds:
//!
//! - [`Twilio`]: constructors for responses, markup documents and clients.
//! - [`RuntimeResources`]: lookups of the project's assets and functions,
//!   plus Sync clients.
//! - the function name to file path map.
//! - an eagerly built [`ApiClient`] when the declared credentials look valid.

pub mod client;
pub mod response;
pub mod twiml;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::router::{RouteKind, RouteTable};
use crate::security::{CheckOptions, Credential, check_account_sid, check_auth_token};

pub use client::{ApiClient, ClientOptions, SyncClient, SyncOptions};
pub use response::{Body, HeaderMap, PendingResponse, SerializedResponse};
pub use twiml::{FaxResponse, MessagingResponse, Twiml, VoiceResponse};

/// The `Twilio` namespace: constructors handler code reaches for.
#[derive(Debug, Clone, Copy, Default)]
pub struct Twilio;

impl Twilio {
    /// A fresh [`PendingResponse`].
    pub fn response(&self) -> PendingResponse {
        PendingResponse::new()
    }

    pub fn voice_response(&self) -> VoiceResponse {
        VoiceResponse::new()
    }

    pub fn messaging_response(&self) -> MessagingResponse {
        MessagingResponse::new()
    }

    pub fn fax_response(&self) -> FaxResponse {
        FaxResponse::new()
    }

    /// A REST client for explicit credentials.
    pub fn client(&self, account_sid: &str, auth_token: &str, options: ClientOptions) -> ApiClient {
        ApiClient::new(account_sid, auth_token, options)
    }
}

/// A static asset visible to handler code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    pub path: PathBuf,
    content: Option<String>,
}

impl AssetHandle {
    /// Reads the asset's contents.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from reading the file.
    pub fn open(&self) -> io::Result<String> {
        match &self.content {
            Some(content) => Ok(content.clone()),
            None => fs::read_to_string(&self.path),
        }
    }
}

/// A function visible to handler code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHandle {
    pub path: PathBuf,
}

/// The `Runtime` namespace: lookups over the project's resources.
#[derive(Debug, Clone, Default)]
pub struct RuntimeResources {
    assets: BTreeMap<String, AssetHandle>,
    functions: BTreeMap<String, FunctionHandle>,
    client: Option<ApiClient>,
}

impl RuntimeResources {
    /// Assets keyed by public path.
    pub fn get_assets(&self) -> &BTreeMap<String, AssetHandle> {
        &self.assets
    }

    /// Functions keyed by name.
    pub fn get_functions(&self) -> &BTreeMap<String, FunctionHandle> {
        &self.functions
    }

    /// A Sync client for `options.service_name`, if credentials are available.
    pub fn get_sync(&self, options: SyncOptions) -> Option<SyncClient> {
        self.client
            .clone()
            .map(|client| SyncClient::new(client, options))
    }
}

/// Process-wide emulated globals.
#[derive(Debug, Clone, Default)]
pub struct GlobalScope {
    pub twilio: Twilio,
    pub runtime: RuntimeResources,
    /// Function name to file path.
    pub functions: HashMap<String, PathBuf>,
    pub client: Option<ApiClient>,
}

impl GlobalScope {
    /// Builds the scope for `config` and the current route table.
    pub fn build(config: &ServerConfig, routes: &RouteTable) -> Self {
        let client = eager_client(&config.env);

        let mut assets = BTreeMap::new();
        let mut functions = BTreeMap::new();
        let mut function_paths = HashMap::new();
        for entry in routes.get_routes().values() {
            let resource = &entry.resource;
            match entry.kind {
                RouteKind::Asset => {
                    assets.insert(
                        resource.path.clone(),
                        AssetHandle {
                            path: resource.file_path.clone(),
                            content: resource.content.clone(),
                        },
                    );
                }
                RouteKind::Function => {
                    functions.insert(
                        resource.name.clone(),
                        FunctionHandle {
                            path: resource.file_path.clone(),
                        },
                    );
                    function_paths.insert(resource.name.clone(), resource.file_path.clone());
                }
            }
        }

        Self {
            twilio: Twilio,
            runtime: RuntimeResources {
                assets,
                functions,
                client: client.clone(),
            },
            functions: function_paths,
            client,
        }
    }

    /// File path of the function called `name`.
    pub fn function_path(&self, name: &str) -> Option<&Path> {
        self.functions.get(name).map(PathBuf::as_path)
    }

    /// The scope as handed to program handlers:
    ///
    /// ```text
    /// {"assets":    {"/style.css": {"path": "/p/assets/style.css"}},
    ///  "functions": {"sms/reply": {"path": "/p/functions/sms/reply.sh"}},
    ///  "client":    {"accountSid": "AC..."} | null}
    /// ```
    ///
    /// The auth token never leaves the process; programs read it from their
    /// context like any other variable.
    pub fn to_json(&self) -> Value {
        let assets: Map<String, Value> = self
            .runtime
            .assets
            .iter()
            .map(|(path, asset)| (path.clone(), json!({"path": asset.path.to_string_lossy()})))
            .collect();
        let functions: Map<String, Value> = self
            .runtime
            .functions
            .iter()
            .map(|(name, function)| (name.clone(), json!({"path": function.path.to_string_lossy()})))
            .collect();
        let client = self
            .client
            .as_ref()
            .map(|client| json!({"accountSid": client.account_sid()}));
        json!({"assets": assets, "functions": functions, "client": client})
    }
}

fn eager_client(env: &BTreeMap<String, String>) -> Option<ApiClient> {
    let account_sid = env.get(Credential::AccountSid.env_var()).map(String::as_str);
    let auth_token = env.get(Credential::AuthToken.env_var()).map(String::as_str);
    let (Some(sid), Some(token)) = (account_sid, auth_token) else {
        debug!("no credentials declared, skipping API client");
        return None;
    };

    let options = CheckOptions::warn();
    let valid = matches!(check_account_sid(Some(sid), &options), Ok(true))
        && matches!(check_auth_token(Some(token), &options), Ok(true));
    if !valid {
        warn!("declared credentials are invalid, API client not available");
        return None;
    }
    Some(ApiClient::new(sid, token, ClientOptions::default()))
}

static GLOBAL_SCOPE: RwLock<Option<Arc<GlobalScope>>> = RwLock::new(None);

/// Builds and installs the process-wide [`GlobalScope`], replacing any
/// previous one.
pub fn install_global_scope(config: &ServerConfig, routes: &RouteTable) -> Arc<GlobalScope> {
    let scope = Arc::new(GlobalScope::build(config, routes));
    *GLOBAL_SCOPE.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&scope));
    debug!(
        functions = scope.functions.len(),
        assets = scope.runtime.assets.len(),
        "global scope installed"
    );
    scope
}

/// The installed scope, or `None` before the first install.
pub fn global_scope() -> Option<Arc<GlobalScope>> {
    GLOBAL_SCOPE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}
