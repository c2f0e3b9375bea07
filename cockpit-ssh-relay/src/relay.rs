//! The relay process shell (§4.G): the sequence a `cockpit-ssh` invocation
//! runs through from startup to exit.

use std::io;
use std::path::PathBuf;

use cockpit_ssh_common::{AuthMethod, AuthMethodResult, Credential, ExitCode, Target};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::*;

use crate::auth::AuthOutcome;
use crate::auth_fd::{Prompt, Verdict};
use crate::client::{self, ClientHandlerEvent, HostKeyDiagnostics, HostKeyPrompter};
use crate::env::RelayEnv;
use crate::hostkey::HostKeyExpectation;

/// Everything the relay needs to run one connection, gathered from the
/// environment and the broker's `open` parameters.
pub struct RelayOptions {
    pub target: Target,
    pub credential: Credential,
    pub bridge_command: String,
    pub host_key_expectation: HostKeyExpectation,
    pub allow_insecure_algos: bool,
    pub gssapi_ccache_path: Option<PathBuf>,
}

impl RelayOptions {
    pub fn from_env(env: &RelayEnv, target: Target, credential: Credential) -> Self {
        let host_key_expectation = match (&env.known_hosts_data, &env.known_hosts_file) {
            (Some(line), _) => HostKeyExpectation::ExplicitLine(line.clone()),
            (None, Some(path)) => HostKeyExpectation::FromKnownHosts {
                path: path.clone(),
                prompt_on_unknown: env.connect_to_unknown_hosts,
            },
            (None, None) => HostKeyExpectation::FromKnownHosts {
                path: crate::default_known_hosts_path(),
                prompt_on_unknown: env.connect_to_unknown_hosts,
            },
        };
        RelayOptions {
            target,
            credential,
            bridge_command: env.bridge_command.clone(),
            host_key_expectation,
            allow_insecure_algos: false,
            gssapi_ccache_path: env.gssapi_ccache_path.clone(),
        }
    }
}

/// Runs a single relay session to completion, writing auth-FD traffic
/// through `auth_fd_io` and shuttling bridge I/O through `local_stdio`.
pub async fn run<A, S>(
    options: RelayOptions,
    session_id: cockpit_ssh_common::SessionId,
    mut auth_fd_io: A,
    local_stdio: S,
) -> ExitCode
where
    A: AuthFdIo,
    S: AsyncRead + AsyncWrite + Unpin,
{
    match run_inner(options, session_id, &mut auth_fd_io, local_stdio).await {
        Ok(code) => code,
        Err(RelayError::Connection(error, diagnostics)) => {
            error!(?error, "connection failed");
            let verdict = Verdict {
                error: Some(connection_error_problem(&error).to_string()),
                host_key: diagnostics.line,
                host_fingerprint: diagnostics.fingerprint,
                ..Default::default()
            };
            let _ = auth_fd_io.send_verdict(&verdict).await;
            connection_error_exit_code(&error)
        }
        Err(RelayError::Auth(outcome, results, diagnostics)) => {
            let verdict = Verdict {
                error: Some("authentication-failed".to_owned()),
                auth_method_results: results
                    .into_iter()
                    .map(|(m, r)| (m.description().to_owned(), r))
                    .collect(),
                host_key: diagnostics.line,
                host_fingerprint: diagnostics.fingerprint,
                ..Default::default()
            };
            let _ = auth_fd_io.send_verdict(&verdict).await;
            match outcome {
                AuthOutcome::Terminated => ExitCode::Terminated,
                _ => ExitCode::AuthenticationFailed,
            }
        }
        Err(RelayError::Internal) => ExitCode::InternalError,
    }
}

enum RelayError {
    Connection(client::ConnectionError, HostKeyDiagnostics),
    Auth(AuthOutcome, Vec<(AuthMethod, AuthMethodResult)>, HostKeyDiagnostics),
    Internal,
}

fn connection_error_problem(error: &client::ConnectionError) -> &'static str {
    use client::ConnectionError::*;
    match error {
        HostKeyMismatch => "invalid-hostkey",
        UnknownHostKey => "unknown-hostkey",
        Resolve => "no-host",
        _ => "internal-error",
    }
}

fn connection_error_exit_code(error: &client::ConnectionError) -> ExitCode {
    use client::ConnectionError::*;
    match error {
        HostKeyMismatch | UnknownHostKey | Resolve => ExitCode::InternalError,
        _ => ExitCode::InternalError,
    }
}

/// Abstracts the auth-FD conversation so tests can substitute an in-memory
/// double for the real `SOCK_SEQPACKET` descriptor.
#[async_trait::async_trait]
pub trait AuthFdIo: Send {
    async fn prompt(&mut self, prompt: &Prompt) -> io::Result<String>;
    async fn send_verdict(&mut self, verdict: &Verdict) -> io::Result<()>;
}

/// Any auth-FD conversation can also answer a host-key prompt (§4.D): it's
/// just another prompt round trip.
#[async_trait::async_trait]
impl<T: AuthFdIo + ?Sized> HostKeyPrompter for T {
    async fn confirm_host_key(&mut self, fingerprint: &str) -> String {
        let prompt = Prompt {
            prompt: format!(
                "The authenticity of the host can't be established. Key fingerprint is {fingerprint}. Are you sure you want to continue connecting?"
            ),
            message: None,
            default: None,
            echo: true,
        };
        self.prompt(&prompt).await.unwrap_or_default()
    }
}

async fn run_inner<A, S>(
    options: RelayOptions,
    session_id: cockpit_ssh_common::SessionId,
    auth_fd_io: &mut A,
    local_stdio: S,
) -> Result<ExitCode, RelayError>
where
    A: AuthFdIo,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (connect_result, diagnostics) = client::connect(
        &options.target.host,
        options.target.port,
        options.host_key_expectation.clone(),
        session_id,
        options.allow_insecure_algos,
        &mut *auth_fd_io,
    )
    .await;
    let (mut handle, mut events) =
        connect_result.map_err(|error| RelayError::Connection(error, diagnostics.clone()))?;

    // Host-key prompts (§4.D) are answered inside `connect` itself, racing
    // the handshake against the auth-FD conversation; only diagnostic
    // events (`HostKeyReceived`/`Disconnect`) can still arrive here, so this
    // just drains them for logging.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ClientHandlerEvent::Disconnect = event {
                break;
            }
        }
    });

    let username = options.target.username_or("root");
    let mut auth = crate::auth::AuthSession::new();

    // Probe the server's actually-advertised auth methods before attempting
    // any of them (mirrors the `authenticate_none` pattern used to discover
    // `remaining_methods` ahead of a real attempt).
    let server_methods = match handle.authenticate_none(username.clone()).await {
        Ok(russh::client::AuthResult::Success) => None,
        Ok(russh::client::AuthResult::Failure { remaining_methods, .. }) => {
            Some(remaining_methods)
        }
        Err(error) => {
            return Err(RelayError::Connection(
                client::ConnectionError::Ssh(error),
                diagnostics,
            ))
        }
    };

    let Some(server_methods) = server_methods else {
        // The server authenticated us with no credential at all; nothing
        // left to attempt.
        warn!("server accepted authenticate_none; proceeding without a credential");
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|_| RelayError::Internal)?;
        channel
            .exec(true, options.bridge_command.as_bytes())
            .await
            .map_err(|_| RelayError::Internal)?;
        let verdict = Verdict {
            user: Some(username),
            host_key: diagnostics.line,
            host_fingerprint: diagnostics.fingerprint,
            ..Default::default()
        };
        auth_fd_io
            .send_verdict(&verdict)
            .await
            .map_err(|_| RelayError::Internal)?;
        let (local_in, local_out) = tokio::io::split(local_stdio);
        return client::run_io_loop(channel, local_in, local_out)
            .await
            .map_err(|_| RelayError::Internal);
    };

    let server_has_keyboard_interactive =
        server_methods.contains(&russh::MethodKind::KeyboardInteractive);
    let order = crate::auth::AuthSession::method_order(server_has_keyboard_interactive);

    for method in order {
        let availability = credential_availability(method, &options.credential, &server_methods);
        if auth.skip(method, &availability) {
            continue;
        }
        let attempt = attempt_method(
            &mut handle,
            &username,
            method,
            &options.credential,
            options.gssapi_ccache_path.as_deref(),
            auth_fd_io,
        )
        .await;
        if let Some(outcome) = auth.record(method, attempt) {
            if !matches!(outcome, AuthOutcome::Succeeded(_)) {
                return Err(RelayError::Auth(outcome, auth.results, diagnostics));
            }
            break;
        }
    }
    if auth.winner().is_none() {
        debug!(
            "server-advertised auth methods exhausted: {}",
            auth_methods_line(&server_methods)
        );
        return Err(RelayError::Auth(AuthOutcome::Denied, auth.results, diagnostics));
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|_| RelayError::Internal)?;
    channel
        .exec(true, options.bridge_command.as_bytes())
        .await
        .map_err(|_| RelayError::Internal)?;

    let verdict = Verdict {
        user: Some(username),
        auth_method_results: auth
            .results
            .into_iter()
            .map(|(m, r)| (m.description().to_owned(), r))
            .collect(),
        host_key: diagnostics.line,
        host_fingerprint: diagnostics.fingerprint,
        ..Default::default()
    };
    auth_fd_io
        .send_verdict(&verdict)
        .await
        .map_err(|_| RelayError::Internal)?;

    let (local_in, local_out) = tokio::io::split(local_stdio);
    client::run_io_loop(channel, local_in, local_out)
        .await
        .map_err(|_| RelayError::Internal)
}

fn credential_availability(
    method: AuthMethod,
    credential: &Credential,
    server_methods: &russh::MethodSet,
) -> crate::auth::MethodAvailability {
    // `AgentProxy` is deliberately excluded here even though §3 lists it as a
    // credential: no crate in this relay's dependency stack exposes an
    // ssh-agent signing primitive wired to `russh::client::Handle`'s
    // publickey auth path, so treating it as "available" would mean
    // recording a `denied` that never actually asked the agent anything.
    // Reporting `not-provided` is the honest representation and lets later
    // methods (keyboard-interactive, password) still run.
    let credential_available = match (method, credential) {
        (AuthMethod::PublicKey, Credential::PrivateKeyPem(_)) => true,
        (AuthMethod::Password | AuthMethod::KeyboardInteractive, Credential::Password(_)) => true,
        (AuthMethod::GssapiMic, Credential::GssapiToken(_)) => true,
        _ => false,
    };
    // `gssapi-mic` has no `russh::MethodKind` counterpart at all in this
    // dependency stack (see `attempt_gssapi` below), so the server can never
    // be recorded as supporting it.
    let server_supports = match method {
        AuthMethod::PublicKey => server_methods.contains(&russh::MethodKind::PublicKey),
        AuthMethod::KeyboardInteractive => {
            server_methods.contains(&russh::MethodKind::KeyboardInteractive)
        }
        AuthMethod::Password => server_methods.contains(&russh::MethodKind::Password),
        AuthMethod::GssapiMic => false,
    };
    crate::auth::MethodAvailability {
        server_supports,
        credential_available,
    }
}

/// Space-joined list of server-advertised method names, matching
/// `auth_methods_line()` in the original bridge's `ssh.c`.
fn auth_methods_line(server_methods: &russh::MethodSet) -> String {
    const KNOWN: [(russh::MethodKind, &str); 3] = [
        (russh::MethodKind::PublicKey, "publickey"),
        (russh::MethodKind::Password, "password"),
        (russh::MethodKind::KeyboardInteractive, "keyboard-interactive"),
    ];
    KNOWN
        .iter()
        .filter(|(kind, _)| server_methods.contains(kind))
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(" ")
}

async fn attempt_method<A: AuthFdIo>(
    handle: &mut russh::client::Handle<client::ClientHandler>,
    username: &str,
    method: AuthMethod,
    credential: &Credential,
    gssapi_ccache_path: Option<&std::path::Path>,
    auth_fd_io: &mut A,
) -> crate::auth::AttemptResult {
    use crate::auth::AttemptResult;
    if let (AuthMethod::GssapiMic, Credential::GssapiToken(token)) = (method, credential) {
        return attempt_gssapi(token, gssapi_ccache_path).await;
    }
    let outcome = match (method, credential) {
        (AuthMethod::Password, Credential::Password(secret)) => {
            attempt_password(handle, username, secret).await
        }
        (AuthMethod::KeyboardInteractive, Credential::Password(secret)) => {
            attempt_keyboard_interactive(handle, username, secret, auth_fd_io).await
        }
        (AuthMethod::PublicKey, Credential::PrivateKeyPem(pem)) => {
            attempt_public_key(handle, username, pem).await
        }
        _ => Ok(false),
    };
    match outcome {
        Ok(true) => AttemptResult::Succeeded,
        Ok(false) => AttemptResult::Denied,
        Err(error) => AttemptResult::Error(error.to_string()),
    }
}

/// Writes the delegated token into the per-process credential cache, then
/// clears it again regardless of outcome (§4.E). No `gssapi-with-mic`
/// primitive is available in this relay's dependency stack, so the attempt
/// itself always reports an honest error rather than silently denying.
async fn attempt_gssapi(
    token: &cockpit_ssh_common::SecretBytes,
    ccache_path: Option<&std::path::Path>,
) -> crate::auth::AttemptResult {
    use crate::auth::AttemptResult;
    let Some(path) = ccache_path else {
        return AttemptResult::Error("no GSSAPI credential cache path configured".to_owned());
    };
    if let Err(error) = tokio::fs::write(path, token.expose_secret()).await {
        warn!(?error, path = %path.display(), "failed to write GSSAPI credential cache");
        return AttemptResult::Error(format!("failed to write credential cache: {error}"));
    }
    let result = AttemptResult::Error("gssapi-with-mic is not implemented by this relay".to_owned());
    if let Err(error) = tokio::fs::remove_file(path).await {
        warn!(?error, path = %path.display(), "failed to clear GSSAPI credential cache");
    }
    result
}

async fn attempt_password(
    handle: &mut russh::client::Handle<client::ClientHandler>,
    username: &str,
    secret: &cockpit_ssh_common::SecretBytes,
) -> Result<bool, russh::Error> {
    let password = String::from_utf8_lossy(secret.expose_secret()).into_owned();
    let result = handle.authenticate_password(username.to_owned(), password).await?;
    Ok(matches!(result, russh::client::AuthResult::Success))
}

/// The first prompt is answered with the cached password; any further
/// prompts are forwarded to the peer over the auth FD (§4.E).
async fn attempt_keyboard_interactive<A: AuthFdIo>(
    handle: &mut russh::client::Handle<client::ClientHandler>,
    username: &str,
    secret: &cockpit_ssh_common::SecretBytes,
    auth_fd_io: &mut A,
) -> Result<bool, russh::Error> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username.to_owned(), None)
        .await?;
    let mut first = true;
    loop {
        match response {
            russh::client::KeyboardInteractiveAuthResponse::Success => return Ok(true),
            russh::client::KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            russh::client::KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let mut answers = Vec::with_capacity(prompts.len());
                for prompt in prompts {
                    let answer = if first {
                        first = false;
                        String::from_utf8_lossy(secret.expose_secret()).into_owned()
                    } else {
                        auth_fd_io
                            .prompt(&Prompt {
                                prompt: prompt.prompt.clone(),
                                message: None,
                                default: None,
                                echo: prompt.echo,
                            })
                            .await
                            .unwrap_or_default()
                    };
                    answers.push(answer);
                }
                response = handle.authenticate_keyboard_interactive_respond(answers).await?;
            }
        }
    }
}

async fn attempt_public_key(
    handle: &mut russh::client::Handle<client::ClientHandler>,
    username: &str,
    pem: &cockpit_ssh_common::SecretBytes,
) -> Result<bool, russh::Error> {
    let pem_text = String::from_utf8_lossy(pem.expose_secret()).into_owned();
    let Ok(key) = russh::keys::PrivateKey::from_openssh(&pem_text) else {
        return Ok(false);
    };
    let hash = if matches!(key.algorithm(), russh::keys::Algorithm::Rsa { .. }) {
        handle.best_supported_rsa_hash().await?.flatten()
    } else {
        None
    };
    let key_with_hash = russh::keys::key::PrivateKeyWithHashAlg::new(std::sync::Arc::new(key), hash);
    let result = handle
        .authenticate_publickey(username.to_owned(), key_with_hash)
        .await?;
    Ok(matches!(result, russh::client::AuthResult::Success))
}
