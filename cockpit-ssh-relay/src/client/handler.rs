use russh::keys::PublicKey;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::*;

use crate::hostkey::{self, HostKeyExpectation, HostKeyVerdict};
use cockpit_ssh_common::SessionId;

/// Emitted by [`ClientHandler`] for the relay process shell to react to.
#[derive(Debug)]
pub enum ClientHandlerEvent {
    HostKeyReceived(PublicKey),
    /// The key needs a prompt round-trip; reply with the peer's answer.
    HostKeyPrompt {
        fingerprint: String,
        reply: oneshot::Sender<String>,
    },
    Disconnect,
}

pub struct ClientHandler {
    pub host: String,
    pub port: u16,
    pub expectation: HostKeyExpectation,
    pub event_tx: UnboundedSender<ClientHandlerEvent>,
    pub session_id: SessionId,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientHandlerError {
    #[error("host key mismatch")]
    HostKeyMismatch,
    #[error("unknown host key")]
    UnknownHostKey,
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error("internal error")]
    Internal,
}

impl russh::client::Handler for ClientHandler {
    type Error = ClientHandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let _ = self
            .event_tx
            .send(ClientHandlerEvent::HostKeyReceived(server_public_key.clone()));

        let verdict = hostkey::verify(&self.expectation, &self.host, self.port, server_public_key)
            .map_err(|_| ClientHandlerError::Internal)?;

        match verdict {
            HostKeyVerdict::Accepted => Ok(true),
            HostKeyVerdict::InvalidHostKey => {
                warn!(session=%self.session_id, "host key changed");
                Err(ClientHandlerError::HostKeyMismatch)
            }
            HostKeyVerdict::UnknownHostKey => {
                warn!(session=%self.session_id, "host key is unknown");
                Err(ClientHandlerError::UnknownHostKey)
            }
            HostKeyVerdict::PromptRequired { fingerprint } => {
                let (tx, rx) = oneshot::channel();
                self.event_tx
                    .send(ClientHandlerEvent::HostKeyPrompt {
                        fingerprint: fingerprint.clone(),
                        reply: tx,
                    })
                    .map_err(|_| ClientHandlerError::Internal)?;
                let reply = rx.await.map_err(|_| ClientHandlerError::Internal)?;
                Ok(hostkey::confirm_prompted(&fingerprint, &reply))
            }
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        let _ = self.event_tx.send(ClientHandlerEvent::Disconnect);
        debug!(session=%self.session_id, "client handler dropped");
    }
}
