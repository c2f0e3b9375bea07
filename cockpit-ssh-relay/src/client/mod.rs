mod channel;
pub mod error;
mod handler;

use std::borrow::Cow;
use std::net::ToSocketAddrs;
use std::sync::Arc;

pub use channel::{run_io_loop, ExitOutcome};
pub use error::SshClientError;
pub use handler::{ClientHandler, ClientHandlerEvent, ClientHandlerError};

use cockpit_ssh_common::SessionId;
use russh::client::Handle;
use russh::{kex, Preferred};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::hostkey::{self, HostKeyExpectation};

/// Best-effort host-key diagnostics captured during the handshake (§4.D
/// step 2, §4.B `"host-key"`/`"host-fingerprint"`), regardless of whether
/// the handshake ultimately succeeds — the relay attaches these to its
/// final verdict even on a host-key rejection.
#[derive(Clone, Debug, Default)]
pub struct HostKeyDiagnostics {
    pub line: Option<String>,
    pub fingerprint: Option<String>,
}

/// Answers an unknown/prompt-required host key verdict with whatever the
/// peer decides (§4.D `PromptRequired`). Implemented for anything that can
/// hold an auth-FD conversation, so the relay's shell can pass its
/// `AuthFdIo` straight through without `connect` knowing about the auth FD.
#[async_trait::async_trait]
pub trait HostKeyPrompter: Send {
    async fn confirm_host_key(&mut self, fingerprint: &str) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not resolve target address")]
    Resolve,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Key(#[from] russh::keys::Error),
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error("host key mismatch")]
    HostKeyMismatch,
    #[error("host key is unknown")]
    UnknownHostKey,
    #[error("internal error")]
    Internal,
}

/// Connects and verifies the host key, returning the authenticated-session
/// handle along with the event stream the handler emits (host-key
/// diagnostics). Any `PromptRequired` verdict (§4.D) is answered by driving
/// `prompter` concurrently with the handshake — the handler's
/// `check_server_key` blocks on the reply, so nothing else may own the
/// event channel until this returns.
pub async fn connect(
    host: &str,
    port: u16,
    expectation: HostKeyExpectation,
    session_id: SessionId,
    allow_insecure_algos: bool,
    prompter: &mut dyn HostKeyPrompter,
) -> (
    Result<(Handle<ClientHandler>, UnboundedReceiver<ClientHandlerEvent>), ConnectionError>,
    HostKeyDiagnostics,
) {
    let mut diagnostics = HostKeyDiagnostics::default();
    let address_str = format!("{host}:{port}");
    let address = match address_str
        .to_socket_addrs()
        .map_err(ConnectionError::Io)
        .and_then(|mut it| it.next().ok_or(ConnectionError::Resolve))
    {
        Ok(address) => address,
        Err(error) => return (Err(error), diagnostics),
    };

    let algos = if allow_insecure_algos {
        Preferred {
            kex: Cow::Borrowed(&[
                kex::CURVE25519,
                kex::CURVE25519_PRE_RFC_8731,
                kex::ECDH_SHA2_NISTP256,
                kex::ECDH_SHA2_NISTP384,
                kex::ECDH_SHA2_NISTP521,
                kex::DH_G16_SHA512,
                kex::DH_G14_SHA256,
                kex::DH_G1_SHA1,
                kex::EXTENSION_SUPPORT_AS_CLIENT,
                kex::EXTENSION_SUPPORT_AS_SERVER,
                kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
                kex::EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
            ]),
            ..<_>::default()
        }
    } else {
        Preferred::default()
    };

    let config = Arc::new(russh::client::Config {
        preferred: algos,
        ..Default::default()
    });

    let (event_tx, mut event_rx) = unbounded_channel();
    let handler = ClientHandler {
        host: host.to_owned(),
        port,
        expectation,
        event_tx,
        session_id,
    };

    let connect_fut = russh::client::connect(config, address, handler);
    tokio::pin!(connect_fut);

    let result = loop {
        tokio::select! {
            biased;
            Some(event) = event_rx.recv() => {
                match event {
                    ClientHandlerEvent::HostKeyReceived(key) => {
                        diagnostics.line = Some(hostkey::known_hosts_line(host, port, &key));
                        diagnostics.fingerprint = Some(hostkey::md5_fingerprint(&key));
                    }
                    ClientHandlerEvent::HostKeyPrompt { fingerprint, reply } => {
                        let answer = prompter.confirm_host_key(&fingerprint).await;
                        let _ = reply.send(answer);
                    }
                    ClientHandlerEvent::Disconnect => {}
                }
            }
            result = &mut connect_fut => {
                break result.map_err(|error| match error {
                    ClientHandlerError::HostKeyMismatch => ConnectionError::HostKeyMismatch,
                    ClientHandlerError::UnknownHostKey => ConnectionError::UnknownHostKey,
                    ClientHandlerError::Ssh(e) => ConnectionError::Ssh(e),
                    ClientHandlerError::Internal => ConnectionError::Internal,
                });
            }
        }
    };

    (result.map(|handle| (handle, event_rx)), diagnostics)
}
