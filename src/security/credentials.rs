//! Structural validation of account credentials.
//!
//! The same check serves two purposes: a soft warning when the global scope
//! is installed at startup, and a hard failure inside
//! [`ExecutionContext::get_twilio_client`](crate::context::ExecutionContext::get_twilio_client).
//! [`CheckOptions`] selects between them; the returned `bool` is meaningful
//! either way.

use std::fmt;

use thiserror::Error;
use tracing::error;

/// Error kind carried by every [`CredentialError`].
pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";

const ACCOUNT_SID_PREFIX: &str = "AC";
const ACCOUNT_SID_LENGTH: usize = 34;

/// Which credential failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    AccountSid,
    AuthToken,
}

impl Credential {
    /// The environment variable the credential is read from.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::AccountSid => "ACCOUNT_SID",
            Self::AuthToken => "AUTH_TOKEN",
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AccountSid => "Account SID",
            Self::AuthToken => "Auth Token",
        })
    }
}

/// A missing or malformed credential, raised before any network use.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{kind}] {message}{}", in_function(.function_name.as_deref()))]
pub struct CredentialError {
    pub kind: &'static str,
    pub credential: Credential,
    pub message: String,
    /// The API the caller was using, for diagnostics.
    pub function_name: Option<String>,
}

fn in_function(function_name: Option<&str>) -> String {
    function_name
        .map(|name| format!(" (in {name})"))
        .unwrap_or_default()
}

/// What to do when a credential is invalid.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions<'a> {
    /// Log a remediation message.
    pub print_message: bool,
    /// Return `Err` instead of `Ok(false)`.
    pub raise_error: bool,
    pub function_name: Option<&'a str>,
}

impl<'a> CheckOptions<'a> {
    /// Log and fail, attributing the failure to `function_name`.
    pub fn strict(function_name: &'a str) -> Self {
        Self {
            print_message: true,
            raise_error: true,
            function_name: Some(function_name),
        }
    }

    /// Log only.
    pub fn warn() -> Self {
        Self {
            print_message: true,
            ..Self::default()
        }
    }
}

/// Validates an account SID: `AC` followed by 32 more characters.
///
/// # Errors
///
/// Returns [`CredentialError`] only when the SID is invalid and
/// `options.raise_error` is set.
///
/// # Examples
///
/// ```
/// use twilio_run::security::{CheckOptions, check_account_sid};
///
/// let sid = format!("AC{}", "0".repeat(32));
/// assert_eq!(check_account_sid(Some(&sid), &CheckOptions::default()), Ok(true));
/// assert_eq!(check_account_sid(Some("AC123"), &CheckOptions::default()), Ok(false));
/// assert!(check_account_sid(None, &CheckOptions::strict("getTwilioClient")).is_err());
/// ```
pub fn check_account_sid(value: Option<&str>, options: &CheckOptions<'_>) -> Result<bool, CredentialError> {
    let problem = match value {
        None | Some("") => Some("is missing".to_owned()),
        Some(sid) if !sid.starts_with(ACCOUNT_SID_PREFIX) => {
            Some(format!("must start with \"{ACCOUNT_SID_PREFIX}\""))
        }
        Some(sid) if sid.chars().count() != ACCOUNT_SID_LENGTH => {
            Some(format!("must be exactly {ACCOUNT_SID_LENGTH} characters long"))
        }
        Some(_) => None,
    };
    report(Credential::AccountSid, problem, options)
}

/// Validates an auth token: it must be present and non-empty.
///
/// # Errors
///
/// Returns [`CredentialError`] only when the token is invalid and
/// `options.raise_error` is set.
pub fn check_auth_token(value: Option<&str>, options: &CheckOptions<'_>) -> Result<bool, CredentialError> {
    let problem = match value.map(str::trim) {
        None | Some("") => Some("is missing".to_owned()),
        Some(_) => None,
    };
    report(Credential::AuthToken, problem, options)
}

fn report(
    credential: Credential,
    problem: Option<String>,
    options: &CheckOptions<'_>,
) -> Result<bool, CredentialError> {
    let Some(problem) = problem else {
        return Ok(true);
    };

    let message = format!(
        "The {credential} {problem}. Set {} in the project's .env file.",
        credential.env_var()
    );
    if options.print_message {
        error!(
            credential = %credential,
            function = options.function_name.unwrap_or("-"),
            "{message}"
        );
    }
    if options.raise_error {
        return Err(CredentialError {
            kind: INVALID_CREDENTIALS,
            credential,
            message,
            function_name: options.function_name.map(str::to_owned),
        });
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_sid() -> String {
        format!("AC{}", "a".repeat(32))
    }

    #[test]
    fn accepts_well_formed_sid() {
        assert_eq!(check_account_sid(Some(&valid_sid()), &CheckOptions::strict("t")), Ok(true));
    }

    #[test]
    fn rejects_wrong_length_prefix_and_missing() {
        let quiet = CheckOptions::default();
        assert_eq!(check_account_sid(Some("AC123"), &quiet), Ok(false));
        assert_eq!(check_account_sid(Some(&format!("AC{}", "a".repeat(33))), &quiet), Ok(false));
        assert_eq!(check_account_sid(Some(&format!("SK{}", "a".repeat(32))), &quiet), Ok(false));
        assert_eq!(check_account_sid(None, &quiet), Ok(false));
        assert_eq!(check_account_sid(Some(""), &quiet), Ok(false));
    }

    #[test]
    fn strict_mode_raises_tagged_error() {
        let err = check_account_sid(Some("ACshort"), &CheckOptions::strict("context.getTwilioClient()"))
            .unwrap_err();
        assert_eq!(err.kind, INVALID_CREDENTIALS);
        assert_eq!(err.credential, Credential::AccountSid);
        assert_eq!(err.function_name.as_deref(), Some("context.getTwilioClient()"));
        assert!(err.to_string().contains("34 characters"));
        assert!(err.to_string().contains("context.getTwilioClient()"));
    }

    #[test]
    fn print_only_never_raises() {
        assert_eq!(check_auth_token(None, &CheckOptions::warn()), Ok(false));
    }

    #[test]
    fn auth_token_presence() {
        let quiet = CheckOptions::default();
        assert_eq!(check_auth_token(Some("abc"), &quiet), Ok(true));
        assert_eq!(check_auth_token(Some("   "), &quiet), Ok(false));
        let err = check_auth_token(None, &CheckOptions::strict("f")).unwrap_err();
        assert_eq!(err.credential, Credential::AuthToken);
    }
}
