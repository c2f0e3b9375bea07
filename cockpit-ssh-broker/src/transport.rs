//! Spawns and drives one relay subprocess per session (§4.G/§4.H glue).
//!
//! Grounded on the teacher's `RemoteClient` task-plus-mpsc pattern
//! (`warpgate-protocol-ssh/src/client/mod.rs`: a background task owns the
//! connection and forwards `RCEvent`s to the session loop over an unbounded
//! channel); the process/fd plumbing itself has no counterpart in the
//! teacher (it never shells out to a subprocess), so it is grounded instead
//! on `libshpool`'s use of `libc` for raw fd work in its pty/process layer.

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cockpit_ssh_common::{Config, Credential, ExitCode, Target};
use cockpit_ssh_relay::auth_fd::{Prompt, Verdict};
use cockpit_ssh_relay::frame::{encode_frame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixDatagram;
use tokio::process::{Command, CommandExt};
use tokio::sync::mpsc;
use tracing::*;

use crate::error::BrokerError;

/// Everything the broker knows about an `open` that determines how its
/// relay subprocess should be invoked.
#[derive(Clone, Debug)]
pub struct SpawnParams {
    pub target: Target,
    pub credential: Credential,
    /// A full known-hosts line to pin, or `None` to use the system default
    /// known-hosts file (§6.2 `COCKPIT_SSH_KNOWN_HOSTS_DATA`/`_FILE`).
    pub host_key_line: Option<String>,
    pub bridge_command: Option<String>,
    pub connect_to_unknown_hosts: bool,
}

/// One decoded frame read back from a relay's stdout.
#[derive(Clone, Debug)]
pub struct RelayFrame {
    pub channel: String,
    pub payload: Bytes,
}

/// Everything the broker's main loop reacts to for one relay subprocess.
#[derive(Debug)]
pub enum RelayEvent {
    Frame(RelayFrame),
    /// A Bridge-credential auth prompt (§4.B); answer via
    /// [`RelayWriter::answer_prompt`]. Prompts never nest (§4.B).
    Prompt(Prompt),
    Verdict(Verdict),
    /// The relay process exited; carries the wait-status-derived
    /// [`ExitCode`] (authoritative over any auth-FD verdict, §7).
    Exited(ExitCode),
    /// Neither the process timeout nor the response timeout was met (§3,
    /// §5); the child has been killed and the session closes with problem
    /// `"timeout"`, same as a disconnect the relay reported on its own.
    TimedOut,
}

/// Sends frames into a relay's stdin, encoding them with the same codec the
/// relay uses to decode them (§4.A).
#[async_trait]
pub trait RelayWriter: Send {
    async fn send_frame(&mut self, channel: &str, payload: &[u8]) -> std::io::Result<()>;
    /// Answers an outstanding auth-FD prompt (Bridge credential mode, §4.B).
    async fn answer_prompt(&mut self, reply: &str) -> std::io::Result<()>;
}

/// Spawns relay subprocesses. Swappable so broker tests can substitute an
/// in-memory fake (`SPEC_FULL.md` §10.4).
#[async_trait]
pub trait RelaySpawner: Send + Sync {
    async fn spawn(
        &self,
        params: SpawnParams,
    ) -> Result<(Box<dyn RelayWriter>, mpsc::UnboundedReceiver<RelayEvent>), BrokerError>;
}

/// Spawns the real `cockpit-ssh` binary (§4.G), wiring its stdio and an
/// `AF_UNIX SOCK_DGRAM` auth FD (the connection-mode pair behaves like the
/// `SOCK_SEQPACKET` descriptor described in §4.B: one JSON object per
/// `send`/`recv`, message boundaries preserved).
pub struct ProcessRelaySpawner {
    pub binary_path: std::path::PathBuf,
    pub remote_peer: String,
    /// Kill the relay if it hasn't reported an auth result within this long
    /// of being spawned (`[Ssh-Login] timeout`, §3, §6.3).
    pub process_timeout: Duration,
    /// Kill the relay if a prompt goes unanswered this long; reset on every
    /// reply (`[Ssh-Login] response-timeout`, §3, §5, §6.3).
    pub response_timeout: Duration,
    /// File descriptor number the relay's auth conversation is dup2'd onto
    /// in the child (`[Ssh-Login] authFD`, §6.3).
    pub auth_fd_number: RawFd,
}

const DEFAULT_PROCESS_TIMEOUT_SECS: u32 = 30;
const DEFAULT_RESPONSE_TIMEOUT_SECS: u32 = 30;
const DEFAULT_AUTH_FD_NUMBER: u32 = 3;

impl ProcessRelaySpawner {
    pub fn new(binary_path: impl Into<std::path::PathBuf>) -> Self {
        ProcessRelaySpawner {
            binary_path: binary_path.into(),
            remote_peer: "localhost".to_owned(),
            process_timeout: Duration::from_secs(DEFAULT_PROCESS_TIMEOUT_SECS as u64),
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS as u64),
            auth_fd_number: DEFAULT_AUTH_FD_NUMBER as RawFd,
        }
    }

    /// Reads `[Ssh-Login] timeout`/`response-timeout`/`authFD` out of
    /// `cockpit.conf` (§6.3), mirroring the bounds `cockpit_ssh_transport_constructed`
    /// passes to its `CockpitAuthProcess`'s `pipe-timeout`/`idle-timeout`/`wanted-auth-fd`
    /// properties.
    pub fn from_config(binary_path: impl Into<std::path::PathBuf>, config: &Config) -> Self {
        let process_timeout =
            config.uint("Ssh-Login", "timeout", DEFAULT_PROCESS_TIMEOUT_SECS, 1, 900);
        let response_timeout = config.uint(
            "Ssh-Login",
            "response-timeout",
            DEFAULT_RESPONSE_TIMEOUT_SECS,
            1,
            900,
        );
        let auth_fd_number = config.uint("Ssh-Login", "authFD", DEFAULT_AUTH_FD_NUMBER, 3, 1024);
        ProcessRelaySpawner {
            process_timeout: Duration::from_secs(process_timeout as u64),
            response_timeout: Duration::from_secs(response_timeout as u64),
            auth_fd_number: auth_fd_number as RawFd,
            ..ProcessRelaySpawner::new(binary_path)
        }
    }
}

struct ProcessRelayWriter {
    stdin: tokio::process::ChildStdin,
    auth_fd: UnixDatagram,
}

#[async_trait]
impl RelayWriter for ProcessRelayWriter {
    async fn send_frame(&mut self, channel: &str, payload: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(&encode_frame(channel, payload)).await
    }

    async fn answer_prompt(&mut self, reply: &str) -> std::io::Result<()> {
        self.auth_fd.send(reply.as_bytes()).await?;
        Ok(())
    }
}

/// Closes file descriptors above the auth FD and dups it onto `wanted_fd` in
/// the child (`[Ssh-Login] authFD`, default 3), per §5's "file descriptors
/// above the auth FD are closed in the child between fork and exec".
///
/// # Safety
/// Runs between `fork` and `exec`; only async-signal-safe calls are used.
unsafe fn prepare_child_auth_fd(child_auth_fd: RawFd, wanted_fd: RawFd) {
    if child_auth_fd != wanted_fd {
        libc::dup2(child_auth_fd, wanted_fd);
        libc::close(child_auth_fd);
    }
    let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).max(0) as RawFd;
    for fd in (wanted_fd + 1)..max_fd {
        libc::close(fd);
    }
}

fn target_spec(target: &Target) -> String {
    match &target.user {
        Some(user) => format!("{user}@{}:{}", target.host, target.port),
        None => format!("{}:{}", target.host, target.port),
    }
}

/// The byte string written to the auth FD before the relay sends its first
/// prompt/verdict, mirroring what a human would type for each auth mode
/// (§4.G step 3, §6.2 `COCKPIT_AUTH_MESSAGE_TYPE`).
fn encode_initial_credential(credential: &Credential) -> Option<Vec<u8>> {
    match credential {
        Credential::Password(secret) => Some(secret.expose_secret().to_vec()),
        Credential::PrivateKeyPem(secret) => Some(secret.expose_secret().to_vec()),
        Credential::GssapiToken(secret) => Some(secret.expose_secret().to_vec()),
        Credential::AgentProxy | Credential::Bridge | Credential::None => None,
    }
}

/// The `COCKPIT_AUTH_MESSAGE_TYPE` value telling the relay how to parse the
/// bytes `encode_initial_credential` wrote, rather than leaving it to fall
/// back to `basic`'s `user:password` splitting (§6.2).
fn auth_message_type_env(credential: &Credential) -> &'static str {
    match credential {
        Credential::Password(_) => "password",
        Credential::PrivateKeyPem(_) => "private-key",
        Credential::GssapiToken(_) => "gssapi-mic",
        Credential::Bridge => "bridge",
        Credential::AgentProxy | Credential::None => "none",
    }
}

/// An auth-FD datagram is a verdict (vs. a prompt) once it carries either a
/// `user` or an `error` field (§4.B).
fn classify_auth_fd_message(value: &serde_json::Value) -> bool {
    value.get("prompt").is_none()
}

#[async_trait]
impl RelaySpawner for ProcessRelaySpawner {
    async fn spawn(
        &self,
        params: SpawnParams,
    ) -> Result<(Box<dyn RelayWriter>, mpsc::UnboundedReceiver<RelayEvent>), BrokerError> {
        let (parent_side, child_side) = StdUnixDatagram::pair().map_err(BrokerError::Spawn)?;
        let writer_side = parent_side.try_clone().map_err(BrokerError::Spawn)?;
        parent_side.set_nonblocking(true).map_err(BrokerError::Spawn)?;
        writer_side.set_nonblocking(true).map_err(BrokerError::Spawn)?;
        let child_raw_fd = child_side.as_raw_fd();

        let mut command = Command::new(&self.binary_path);
        command
            .arg(target_spec(&params.target))
            .env("COCKPIT_REMOTE_PEER", &self.remote_peer)
            .env(
                "COCKPIT_SSH_CONNECT_TO_UNKNOWN_HOSTS",
                if params.connect_to_unknown_hosts { "1" } else { "0" },
            )
            .env("COCKPIT_AUTH_MESSAGE_TYPE", auth_message_type_env(&params.credential))
            .env("COCKPIT_SSH_AUTH_FD", self.auth_fd_number.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(line) = &params.host_key_line {
            command.env("COCKPIT_SSH_KNOWN_HOSTS_DATA", line);
        }
        if let Some(bridge_command) = &params.bridge_command {
            command.env("COCKPIT_SSH_BRIDGE_COMMAND", bridge_command);
        }

        let wanted_auth_fd = self.auth_fd_number;
        // Safety: `pre_exec` runs the closure between fork and exec in the
        // child; it only calls `dup2`/`close`/`sysconf`, all async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                prepare_child_auth_fd(child_raw_fd, wanted_auth_fd);
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(BrokerError::Spawn)?;
        drop(child_side);
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| {
            BrokerError::other(std::io::Error::other("relay process has no stdin"))
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            BrokerError::other(std::io::Error::other("relay process has no stdout"))
        })?;
        let auth_fd_reader = UnixDatagram::from_std(parent_side).map_err(BrokerError::Spawn)?;
        let auth_fd_writer = UnixDatagram::from_std(writer_side).map_err(BrokerError::Spawn)?;

        let (tx, rx) = mpsc::unbounded_channel();

        let tx_stdout = tx.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        decoder.feed(&buf[..n]);
                        match decoder.decode_all() {
                            Ok(frames) => {
                                for frame in frames {
                                    let _ = tx_stdout.send(RelayEvent::Frame(RelayFrame {
                                        channel: frame.channel,
                                        payload: frame.payload,
                                    }));
                                }
                            }
                            Err(error) => {
                                warn!(?error, "corrupt frame from relay stdout");
                                break;
                            }
                        }
                    }
                    Err(error) => {
                        warn!(?error, "reading relay stdout failed");
                        break;
                    }
                }
            }
        });

        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel::<()>();
        let (exited_tx, exited_rx) = tokio::sync::oneshot::channel::<()>();

        let initial_credential = encode_initial_credential(&params.credential);
        let tx_auth = tx.clone();
        tokio::spawn(async move {
            if let Some(initial) = initial_credential {
                let _ = auth_fd_reader.send(&initial).await;
            }
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match auth_fd_reader.recv(&mut buf).await {
                    Ok(n) => {
                        let _ = activity_tx.send(());
                        let trimmed = cockpit_ssh_relay::auth_fd::trim_reply(&buf[..n]);
                        let Ok(value) = serde_json::from_slice::<serde_json::Value>(trimmed)
                        else {
                            warn!("malformed auth-fd datagram from relay");
                            continue;
                        };
                        if classify_auth_fd_message(&value) {
                            match serde_json::from_value::<Verdict>(value) {
                                Ok(verdict) => {
                                    let _ = tx_auth.send(RelayEvent::Verdict(verdict));
                                    break;
                                }
                                Err(error) => warn!(?error, "malformed verdict from relay"),
                            }
                        } else {
                            match serde_json::from_value::<Prompt>(value) {
                                Ok(prompt) => {
                                    let _ = tx_auth.send(RelayEvent::Prompt(prompt));
                                }
                                Err(error) => warn!(?error, "malformed prompt from relay"),
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            // Dropping `activity_tx` here closes the channel, telling the
            // watchdog the relay reported its final auth result (or the
            // auth FD broke on its own) and it can stop watching.
        });

        // Kills the relay and reports `TimedOut` if it never reports an
        // auth result within `process_timeout`, or if any single prompt
        // round trip exceeds `response_timeout` (§3, §5). Stops quietly
        // once `activity_rx` closes (verdict reported) or the child exits
        // on its own, whichever comes first.
        let tx_watchdog = tx.clone();
        let process_timeout = self.process_timeout;
        let response_timeout = self.response_timeout;
        tokio::spawn(async move {
            let process_deadline = tokio::time::Instant::now() + process_timeout;
            let mut response_deadline = tokio::time::Instant::now() + response_timeout;
            let mut exited_rx = exited_rx;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut exited_rx => return,
                    activity = activity_rx.recv() => {
                        match activity {
                            Some(()) => {
                                response_deadline = tokio::time::Instant::now() + response_timeout;
                            }
                            None => return,
                        }
                    }
                    _ = tokio::time::sleep_until(process_deadline) => {
                        if let Some(pid) = pid {
                            unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL); }
                        }
                        let _ = tx_watchdog.send(RelayEvent::TimedOut);
                        return;
                    }
                    _ = tokio::time::sleep_until(response_deadline) => {
                        if let Some(pid) = pid {
                            unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL); }
                        }
                        let _ = tx_watchdog.send(RelayEvent::TimedOut);
                        return;
                    }
                }
            }
        });

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let _ = exited_tx.send(());
                    let code = ExitCode::from_raw(status.code().unwrap_or(255));
                    let _ = tx.send(RelayEvent::Exited(code));
                }
                Err(error) => {
                    warn!(?error, "waiting on relay process failed");
                    let _ = tx.send(RelayEvent::Exited(ExitCode::InternalError));
                }
            }
        });

        let writer = ProcessRelayWriter {
            stdin,
            auth_fd: auth_fd_writer,
        };

        Ok((Box::new(writer), rx))
    }
}
