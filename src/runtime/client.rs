//! Authenticated API clients exposed to handler code.
//!
//! These mirror what the hosted sandbox hands to functions: a REST client
//! authenticated with the account credentials and a client for the Sync
//! state service. They only carry credentials and endpoint details; issuing
//! requests is up to the caller's HTTP stack.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// User agent extension identifying calls made from the local runtime.
pub const USER_AGENT_EXTENSION: &str = concat!("twilio-run/", env!("CARGO_PKG_VERSION"));

const DEFAULT_DOMAIN: &str = "twilio.com";
const DEFAULT_SYNC_SERVICE: &str = "default";

/// Options accepted by `getTwilioClient`-style constructors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    /// Defer resource resolution until first use.
    #[serde(default)]
    pub lazy_loading: bool,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub edge: Option<String>,
    #[serde(default)]
    pub user_agent_extensions: Vec<String>,
}

/// A REST API client bound to one account.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiClient {
    account_sid: String,
    auth_token: String,
    options: ClientOptions,
}

// Keep the auth token out of logs.
impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("account_sid", &self.account_sid)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Builds a client. Credentials are expected to be validated already.
    pub fn new(account_sid: impl Into<String>, auth_token: impl Into<String>, mut options: ClientOptions) -> Self {
        if !options
            .user_agent_extensions
            .iter()
            .any(|ext| ext == USER_AGENT_EXTENSION)
        {
            options
                .user_agent_extensions
                .push(USER_AGENT_EXTENSION.to_owned());
        }
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            options,
        }
    }

    pub fn account_sid(&self) -> &str {
        &self.account_sid
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        let credentials = format!("{}:{}", self.account_sid, self.auth_token);
        format!("Basic {}", STANDARD.encode(credentials))
    }

    /// Base URL of a product API, honouring edge and region.
    ///
    /// ```
    /// use twilio_run::runtime::{ApiClient, ClientOptions};
    ///
    /// let client = ApiClient::new("AC00000000000000000000000000000000", "token", ClientOptions {
    ///     region: Some("ie1".into()),
    ///     edge: Some("dublin".into()),
    ///     ..ClientOptions::default()
    /// });
    /// assert_eq!(client.base_url("api"), "https://api.dublin.ie1.twilio.com");
    /// ```
    pub fn base_url(&self, product: &str) -> String {
        let region = match (&self.options.edge, &self.options.region) {
            (Some(edge), Some(region)) => format!(".{edge}.{region}"),
            (Some(edge), None) => format!(".{edge}.us1"),
            (None, Some(region)) => format!(".{region}"),
            (None, None) => String::new(),
        };
        format!("https://{product}{region}.{DEFAULT_DOMAIN}")
    }

    /// The `User-Agent` suffix sent with every request.
    pub fn user_agent_extensions(&self) -> String {
        self.options.user_agent_extensions.join(" ")
    }
}

/// Options for [`SyncClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    pub service_name: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SYNC_SERVICE.to_owned(),
        }
    }
}

/// A client for one Sync service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncClient {
    client: ApiClient,
    service_name: String,
}

impl SyncClient {
    pub fn new(client: ApiClient, options: SyncOptions) -> Self {
        Self {
            client,
            service_name: options.service_name,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// URL of the service resource.
    pub fn service_url(&self) -> String {
        format!("{}/v1/Services/{}", self.client.base_url("sync"), self.service_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "AC00000000000000000000000000000000";

    #[test]
    fn authorization_is_basic_auth() {
        let client = ApiClient::new(SID, "secret", ClientOptions::default());
        let expected = format!("Basic {}", STANDARD.encode(format!("{SID}:secret")));
        assert_eq!(client.authorization(), expected);
    }

    #[test]
    fn default_base_url() {
        let client = ApiClient::new(SID, "secret", ClientOptions::default());
        assert_eq!(client.base_url("api"), "https://api.twilio.com");
    }

    #[test]
    fn user_agent_extension_added_once() {
        let options = ClientOptions {
            user_agent_extensions: vec!["my-app/1.0".into(), USER_AGENT_EXTENSION.into()],
            ..ClientOptions::default()
        };
        let client = ApiClient::new(SID, "secret", options);
        assert_eq!(
            client.user_agent_extensions(),
            format!("my-app/1.0 {USER_AGENT_EXTENSION}")
        );
    }

    #[test]
    fn debug_hides_token() {
        let client = ApiClient::new(SID, "super-secret", ClientOptions::default());
        assert!(!format!("{client:?}").contains("super-secret"));
    }

    #[test]
    fn sync_client_defaults_to_default_service() {
        let client = ApiClient::new(SID, "secret", ClientOptions::default());
        let sync = SyncClient::new(client, SyncOptions::default());
        assert_eq!(sync.service_url(), "https://sync.twilio.com/v1/Services/default");
    }
}
