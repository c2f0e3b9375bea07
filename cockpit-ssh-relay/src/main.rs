//! `cockpit-ssh` entry point: parses its environment, connects to the
//! target, and runs the relay until the bridge process exits (§4.G).

use std::io;
use std::os::fd::FromRawFd;

use cockpit_ssh_common::{Credential, Target};
use cockpit_ssh_relay::auth_fd::{trim_reply, Prompt, Verdict};
use cockpit_ssh_relay::env::{AuthMessageType, RelayEnv};
use cockpit_ssh_relay::relay::{self, AuthFdIo, RelayOptions};
use tokio::net::UnixDatagram;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

struct SeqpacketAuthFd {
    socket: UnixDatagram,
}

#[async_trait::async_trait]
impl AuthFdIo for SeqpacketAuthFd {
    async fn prompt(&mut self, prompt: &Prompt) -> io::Result<String> {
        let bytes = serde_json::to_vec(prompt).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket.send(&bytes).await?;
        let mut buf = vec![0u8; 4096];
        let n = self.socket.recv(&mut buf).await?;
        Ok(cockpit_ssh_relay::auth_fd::decode_reply(&buf[..n]))
    }

    async fn send_verdict(&mut self, verdict: &Verdict) -> io::Result<()> {
        let bytes = serde_json::to_vec(verdict).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket.send(&bytes).await
    }
}

/// Reads the single unsolicited datagram the broker writes before any
/// prompt/verdict round trip begins (§4.G step 3), trimmed of trailing
/// NULs. Not sent for `none`/`bridge` auth types (§6.2).
async fn read_initial_auth_bytes(socket: &UnixDatagram) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 16 * 1024];
    let n = socket.recv(&mut buf).await?;
    Ok(trim_reply(&buf[..n]).to_vec())
}

/// Runs an external `SSH_ASKPASS`-style helper and returns its stdout as a
/// password, the legacy fallback for when no auth-FD credential arrived
/// (§11 supplemented feature, carried over from the original implementation's
/// askpass support).
async fn run_askpass(program: &str) -> io::Result<String> {
    let output = tokio::process::Command::new(program)
        .arg("Password: ")
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok(text.trim_end_matches(['\n', '\r']).to_owned())
}

async fn build_credential(
    auth_fd: &UnixDatagram,
    env: &RelayEnv,
    target: &mut Target,
) -> io::Result<Credential> {
    let credential = match env.auth_message_type {
        AuthMessageType::None => Credential::None,
        AuthMessageType::Bridge => Credential::Bridge,
        AuthMessageType::Basic => {
            let bytes = read_initial_auth_bytes(auth_fd).await?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let (user, credential) = Credential::parse_basic(&text);
            if target.user.is_none() {
                target.user = Some(user);
            }
            credential
        }
        AuthMessageType::Password | AuthMessageType::KeyboardInteractive => {
            Credential::Password(read_initial_auth_bytes(auth_fd).await?.into())
        }
        AuthMessageType::PrivateKey => {
            Credential::PrivateKeyPem(read_initial_auth_bytes(auth_fd).await?.into())
        }
        AuthMessageType::GssapiMic => {
            Credential::GssapiToken(read_initial_auth_bytes(auth_fd).await?.into())
        }
    };

    if matches!(credential, Credential::None) {
        if let Some(askpass) = &env.ssh_askpass {
            match run_askpass(askpass).await {
                Ok(password) => return Ok(Credential::Password(password.into())),
                Err(error) => {
                    tracing::warn!(?error, "SSH_ASKPASS invocation failed");
                }
            }
        }
    }
    Ok(credential)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let env = RelayEnv::from_process_env();
    let mut target = std::env::args()
        .nth(1)
        .map(|s| Target::parse(&s))
        .unwrap_or_else(|| Target::parse("localhost"));

    // Safety: `env.auth_fd` (default 3, `[Ssh-Login] authFD`/`COCKPIT_SSH_AUTH_FD`,
    // §6.3) is the broker-supplied SOCK_SEQPACKET auth descriptor by convention
    // (§4.B); the process contract guarantees it is open and of the right type
    // whenever auth type isn't "none".
    let auth_fd = unsafe { UnixDatagram::from_raw_fd(env.auth_fd) };

    let credential = match build_credential(&auth_fd, &env, &mut target).await {
        Ok(credential) => credential,
        Err(error) => {
            tracing::error!(?error, "failed to read initial auth-fd credential");
            std::process::exit(cockpit_ssh_common::ExitCode::InternalError.raw());
        }
    };

    let options = RelayOptions::from_env(&env, target, credential);
    let auth_io = SeqpacketAuthFd { socket: auth_fd };

    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    let exit_code = relay::run(options, Uuid::new_v4(), auth_io, stdio).await;

    std::process::exit(exit_code.raw());
}
