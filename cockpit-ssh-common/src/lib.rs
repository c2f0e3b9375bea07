mod config;
mod credential;
mod error;
mod exit_code;
mod problem;
mod target;

pub use config::Config;
pub use credential::{Credential, SecretBytes};
pub use error::CommonError;
pub use exit_code::ExitCode;
pub use problem::Problem;
pub use target::Target;

/// Result of attempting a single SSH authentication method, as recorded in
/// `auth-method-results`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethodResult {
    NotProvided,
    NoServerSupport,
    NotTried,
    Succeeded,
    Denied,
    Partial,
    Again,
    Error,
}

impl AuthMethodResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethodResult::NotProvided => "not-provided",
            AuthMethodResult::NoServerSupport => "no-server-support",
            AuthMethodResult::NotTried => "not-tried",
            AuthMethodResult::Succeeded => "succeeded",
            AuthMethodResult::Denied => "denied",
            AuthMethodResult::Partial => "partial",
            AuthMethodResult::Again => "again",
            AuthMethodResult::Error => "error",
        }
    }
}

/// The fixed, ordered set of auth methods the relay attempts.
///
/// `hostbased` and `none` are recognized for reporting only (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    PublicKey,
    KeyboardInteractive,
    Password,
    GssapiMic,
    HostBased,
    None,
}

impl AuthMethod {
    pub fn description(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey => "public-key",
            AuthMethod::KeyboardInteractive | AuthMethod::Password => "password",
            AuthMethod::GssapiMic => "gssapi-mic",
            AuthMethod::HostBased => "host-based",
            AuthMethod::None => "none",
        }
    }
}

pub type SessionId = uuid::Uuid;
