//! Broker-side session bookkeeping (§3 `Session`, §4.H).

use std::collections::{HashSet, VecDeque};

use cockpit_ssh_common::AuthMethodResult;

use crate::control::ControlMessage;

/// Decides whether an `open` forces session isolation (§4.H "Open handling").
///
/// Triggers: an explicit `session == "private"`, a `host-key` expectation
/// (it pins a specific key to this one connection), a non-default user, or
/// any credential that isn't safely shareable across channels. The legacy
/// `temp-session` field is honoured the way `cockpitsshservice.c` does: once
/// `session == "shared"` has *not* been requested, `temp-session` defaults to
/// forcing a private session unless explicitly set to `false`.
pub fn wants_private_session(open: &ControlMessage, default_user: &str) -> bool {
    if open.str_field("session") == Some("private") {
        return true;
    }
    if open.str_field("host-key").is_some() {
        return true;
    }
    if let Some(user) = open.str_field("user") {
        if user != default_user {
            return true;
        }
    }
    if open.str_field("password").is_some() {
        return true;
    }
    if open.str_field("session") != Some("shared") {
        if let Some(temp) = open.bool_field("temp-session") {
            if temp {
                return true;
            }
        }
    }
    false
}

/// One tracked relay session (§3 `Session`).
pub struct Session {
    pub host: String,
    pub private: bool,
    pub channels: HashSet<String>,
    pub authorizes: HashSet<String>,
    pub init_received: bool,
    pub sent_done: bool,
    pub thawing: u32,
    pub frozen_queue: VecDeque<ControlMessage>,
    pub checksum: Option<String>,
    pub host_key: Option<String>,
    pub host_fingerprint: Option<String>,
    pub auth_method_results: Vec<(String, AuthMethodResult)>,
}

impl Session {
    pub fn new(host: String, private: bool) -> Self {
        Session {
            host,
            private,
            channels: HashSet::new(),
            authorizes: HashSet::new(),
            init_received: false,
            sent_done: false,
            thawing: 0,
            frozen_queue: VecDeque::new(),
            checksum: None,
            host_key: None,
            host_fingerprint: None,
            auth_method_results: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Whether a control message for `channel` must wait for `init` (§3
    /// invariant). `init` and `authorize` are never frozen.
    pub fn must_freeze(&self, command: &str) -> bool {
        !self.init_received && command != "init" && command != "authorize"
    }

    /// Accepts a re-entrant `open` for an already-known channel during
    /// thawing, per DESIGN NOTES §9's documented asymmetry: normally this is
    /// rejected, but replay of frozen messages tolerates it.
    pub fn allows_duplicate_open(&self, channel: &str) -> bool {
        self.thawing > 0 && self.channels.contains(channel)
    }
}
