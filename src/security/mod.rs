//! Security concerns: credential checks, inbound header restrictions and CORS.

pub mod cors;
pub mod credentials;
pub mod headers;

pub use cors::{CORS_HEADERS, CorsPreflight, preflight_response};
pub use credentials::{CheckOptions, Credential, CredentialError, check_account_sid, check_auth_token};
pub use headers::is_restricted_header;
