//! Per-invocation context handed to handlers.
//!
//! An [`ExecutionContext`] is built fresh for every invocation by
//! [`construct_context`]. It carries the project's declared environment
//! variables verbatim, plus two derived values injected only when the
//! environment does not already declare them:
//!
//! | Key           | Value                                   |
//! |---------------|-----------------------------------------|
//! | `PATH`        | the public path of the invoked function |
//! | `DOMAIN_NAME` | the server's base URL without scheme    |
//!
//! The event side lives in [`event`].

pub mod event;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ServerConfig;
use crate::runtime::{ApiClient, ClientOptions};
use crate::security::{CheckOptions, Credential, CredentialError, check_account_sid, check_auth_token};

pub use event::{Event, construct_event, construct_headers, event_from_request, parse_cookies};

const PATH_KEY: &str = "PATH";
const DOMAIN_NAME_KEY: &str = "DOMAIN_NAME";
const GET_CLIENT_FUNCTION: &str = "context.getTwilioClient()";

/// Environment and helpers visible to one handler invocation.
///
/// # Examples
///
/// ```
/// use twilio_run::config::ServerConfig;
/// use twilio_run::context::construct_context;
///
/// let mut config = ServerConfig::new("/project", "https://demo.example.com");
/// config.env.insert("GREETING".into(), "Ahoy".into());
///
/// let context = construct_context(&config, "/hello");
/// assert_eq!(context.get("GREETING"), Some("Ahoy"));
/// assert_eq!(context.path(), Some("/hello"));
/// assert_eq!(context.domain_name(), Some("demo.example.com"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    vars: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn path(&self) -> Option<&str> {
        self.get(PATH_KEY)
    }

    pub fn domain_name(&self) -> Option<&str> {
        self.get(DOMAIN_NAME_KEY)
    }

    /// An API client for the declared `ACCOUNT_SID` and `AUTH_TOKEN`.
    ///
    /// Credentials are validated here, not when the context is built, so a
    /// handler that never asks for a client never fails on them.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] if either credential is missing or
    /// malformed.
    pub fn get_twilio_client(&self, options: Option<ClientOptions>) -> Result<ApiClient, CredentialError> {
        let check = CheckOptions::strict(GET_CLIENT_FUNCTION);
        let account_sid = self.get(Credential::AccountSid.env_var());
        let auth_token = self.get(Credential::AuthToken.env_var());
        check_account_sid(account_sid, &check)?;
        check_auth_token(auth_token, &check)?;

        let mut options = options.unwrap_or_default();
        options.lazy_loading = true;
        Ok(ApiClient::new(
            account_sid.unwrap_or_default(),
            auth_token.unwrap_or_default(),
            options,
        ))
    }

    /// The context as the JSON object program handlers receive.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.vars
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect(),
        )
    }
}

/// Builds the context for an invocation of the function at `path`.
pub fn construct_context(config: &ServerConfig, path: &str) -> ExecutionContext {
    let mut vars = config.env.clone();
    vars.entry(PATH_KEY.to_owned())
        .or_insert_with(|| path.to_owned());
    vars.entry(DOMAIN_NAME_KEY.to_owned())
        .or_insert_with(|| config.domain_name().to_owned());
    ExecutionContext { vars }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ServerConfig {
        ServerConfig::new("/project", "http://localhost:3000")
    }

    #[test]
    fn injects_path_and_domain() {
        let context = construct_context(&config(), "/sms");
        assert_eq!(context.path(), Some("/sms"));
        assert_eq!(context.domain_name(), Some("localhost:3000"));
    }

    #[test]
    fn declared_env_wins_over_injection() {
        let mut config = config();
        config.env.insert("PATH".into(), "/usr/bin:/bin".into());
        config.env.insert("DOMAIN_NAME".into(), "custom.example.com".into());

        let context = construct_context(&config, "/sms");
        assert_eq!(context.path(), Some("/usr/bin:/bin"));
        assert_eq!(context.domain_name(), Some("custom.example.com"));
    }

    #[test]
    fn client_requires_credentials_only_when_asked() {
        let context = construct_context(&config(), "/sms");
        let err = context.get_twilio_client(None).unwrap_err();
        assert_eq!(err.function_name.as_deref(), Some(GET_CLIENT_FUNCTION));
    }

    #[test]
    fn client_forwards_options() {
        let mut config = config();
        config
            .env
            .insert("ACCOUNT_SID".into(), format!("AC{}", "1".repeat(32)));
        config.env.insert("AUTH_TOKEN".into(), "token".into());
        let context = construct_context(&config, "/sms");

        let client = context
            .get_twilio_client(Some(ClientOptions {
                region: Some("au1".into()),
                ..ClientOptions::default()
            }))
            .unwrap();
        assert!(client.options().lazy_loading);
        assert_eq!(client.base_url("api"), "https://api.au1.twilio.com");
    }

    #[test]
    fn to_json_is_flat_object() {
        let mut config = config();
        config.env.insert("A".into(), "1".into());
        let value = construct_context(&config, "/x").to_json();
        assert_eq!(
            value,
            json!({"A": "1", "PATH": "/x", "DOMAIN_NAME": "localhost:3000"})
        );
    }
}
