//! Auth state machine (§4.E).

use cockpit_ssh_common::{AuthMethod, AuthMethodResult};

/// Terminal outcome of the whole auth attempt sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Succeeded(AuthMethod),
    Denied,
    Terminated,
    InternalError,
}

const METHOD_ORDER: [AuthMethod; 3] = [
    AuthMethod::PublicKey,
    AuthMethod::KeyboardInteractive,
    AuthMethod::GssapiMic,
];

/// Substrings that mark a raw error message as disconnection-like (§4.E).
const DISCONNECT_MARKERS: [&str; 4] = [
    "disconnected",
    "SSH_MSG_DISCONNECT",
    "Socket error: Success",
    "Socket error: Connection reset by peer",
];

pub fn is_disconnection_message(message: &str) -> bool {
    DISCONNECT_MARKERS.iter().any(|m| message.contains(m))
}

/// What the caller supplies before an attempt: whether the server advertised
/// the method and whether a credential is available for it.
pub struct MethodAvailability {
    pub server_supports: bool,
    pub credential_available: bool,
}

/// A single attempt's low-level result, before mapping to [`AuthMethodResult`].
pub enum AttemptResult {
    Succeeded,
    Denied,
    Partial,
    Again,
    /// A raw error message, classified via [`is_disconnection_message`].
    Error(String),
}

/// Tracks recorded results across the fixed method ordering and decides when
/// to stop.
#[derive(Default)]
pub struct AuthSession {
    pub results: Vec<(AuthMethod, AuthMethodResult)>,
    winner: Option<AuthMethod>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The order remaining methods should be attempted in, given a server
    /// that lacks keyboard-interactive (falls back to password).
    pub fn method_order(server_has_keyboard_interactive: bool) -> Vec<AuthMethod> {
        METHOD_ORDER
            .iter()
            .map(|m| {
                if *m == AuthMethod::KeyboardInteractive && !server_has_keyboard_interactive {
                    AuthMethod::Password
                } else {
                    *m
                }
            })
            .collect()
    }

    pub fn winner(&self) -> Option<AuthMethod> {
        self.winner
    }

    /// Records `not-provided`/`no-server-support` up front, skipping the
    /// attempt entirely.
    pub fn skip(&mut self, method: AuthMethod, availability: &MethodAvailability) -> bool {
        if self.winner.is_some() {
            self.results.push((method, AuthMethodResult::NotTried));
            return true;
        }
        if !availability.server_supports {
            self.results
                .push((method, AuthMethodResult::NoServerSupport));
            return true;
        }
        if !availability.credential_available {
            self.results.push((method, AuthMethodResult::NotProvided));
            return true;
        }
        false
    }

    /// Records the result of an attempt that was actually made, returning
    /// `Some(outcome)` when the whole auth sequence should stop.
    pub fn record(&mut self, method: AuthMethod, result: AttemptResult) -> Option<AuthOutcome> {
        match result {
            AttemptResult::Succeeded => {
                self.results.push((method, AuthMethodResult::Succeeded));
                self.winner = Some(method);
                Some(AuthOutcome::Succeeded(method))
            }
            AttemptResult::Denied => {
                self.results.push((method, AuthMethodResult::Denied));
                None
            }
            AttemptResult::Partial => {
                self.results.push((method, AuthMethodResult::Partial));
                None
            }
            AttemptResult::Again => {
                self.results.push((method, AuthMethodResult::Again));
                None
            }
            AttemptResult::Error(message) => {
                self.results.push((method, AuthMethodResult::Error));
                if is_disconnection_message(&message) {
                    Some(AuthOutcome::Terminated)
                } else {
                    Some(AuthOutcome::InternalError)
                }
            }
        }
    }

    /// Called once every method has either been attempted or skipped with no
    /// winner found.
    pub fn exhausted(&self) -> AuthOutcome {
        AuthOutcome::Denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_password_without_keyboard_interactive() {
        let order = AuthSession::method_order(false);
        assert_eq!(order[1], AuthMethod::Password);
    }

    #[test]
    fn keeps_keyboard_interactive_when_supported() {
        let order = AuthSession::method_order(true);
        assert_eq!(order[1], AuthMethod::KeyboardInteractive);
    }

    #[test]
    fn success_short_circuits_remaining_methods_as_not_tried() {
        let mut session = AuthSession::new();
        let outcome = session.record(AuthMethod::PublicKey, AttemptResult::Succeeded);
        assert_eq!(outcome, Some(AuthOutcome::Succeeded(AuthMethod::PublicKey)));

        let skipped = session.skip(
            AuthMethod::Password,
            &MethodAvailability {
                server_supports: true,
                credential_available: true,
            },
        );
        assert!(skipped);
        assert_eq!(
            session.results.last(),
            Some(&(AuthMethod::Password, AuthMethodResult::NotTried))
        );
    }

    #[test]
    fn denied_continues_to_next_method() {
        let mut session = AuthSession::new();
        let outcome = session.record(AuthMethod::PublicKey, AttemptResult::Denied);
        assert_eq!(outcome, None);
        assert_eq!(
            session.results.last(),
            Some(&(AuthMethod::PublicKey, AuthMethodResult::Denied))
        );
    }

    #[test]
    fn disconnection_like_error_terminates() {
        let mut session = AuthSession::new();
        let outcome = session.record(
            AuthMethod::PublicKey,
            AttemptResult::Error("Socket error: Connection reset by peer".to_owned()),
        );
        assert_eq!(outcome, Some(AuthOutcome::Terminated));
    }

    #[test]
    fn other_error_is_internal_error() {
        let mut session = AuthSession::new();
        let outcome = session.record(
            AuthMethod::PublicKey,
            AttemptResult::Error("some other failure".to_owned()),
        );
        assert_eq!(outcome, Some(AuthOutcome::InternalError));
    }

    #[test]
    fn no_credential_records_not_provided() {
        let mut session = AuthSession::new();
        let skipped = session.skip(
            AuthMethod::PublicKey,
            &MethodAvailability {
                server_supports: true,
                credential_available: false,
            },
        );
        assert!(skipped);
        assert_eq!(
            session.results.last(),
            Some(&(AuthMethod::PublicKey, AuthMethodResult::NotProvided))
        );
    }
}
