//! The session broker's event loop (§4.H).
//!
//! Grounded on the teacher's `Session` actor
//! (`warpgate-core/src/session.rs`/`state.rs`): a `HashMap` arena of live
//! sessions keyed by handle, fed by a `tokio::select!` loop that multiplexes
//! an upstream transport against N background tasks, one per relay
//! subprocess, each reporting back over its own `mpsc` channel.

use std::collections::HashMap;

use cockpit_ssh_common::{Config, Credential, ExitCode, Target};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::*;

use crate::control::{init_message, ControlMessage};
use crate::error::BrokerError;
use crate::session::{wants_private_session, Session};
use crate::transport::{RelayEvent, RelaySpawner, RelayWriter, SpawnParams};
use cockpit_ssh_relay::frame::{encode_frame, Frame, FrameDecoder};

const PROTOCOL_VERSION: u64 = 1;

/// Default for how long a now-empty shared session is kept alive in case
/// another channel opens against the same host before the relay is torn
/// down (§4.H "Close handling", §5 "the idle timer is cancelled on any new
/// channel add"), absent a `[Ssh-Login] idle-timeout` override.
const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 30;

struct RelaySession {
    session: Session,
    writer: Box<dyn RelayWriter>,
}

/// One internal event fed into the broker's own `select!` arm, tagging
/// which relay it came from.
enum BrokerInternalEvent {
    Upstream(std::io::Result<Option<Frame>>),
    Relay(uuid::Uuid, Option<RelayEvent>),
    IdleTimeout(uuid::Uuid),
}

/// Drives one upstream connection, spawning and multiplexing relay
/// subprocesses for it until the upstream closes.
pub struct Broker<S> {
    spawner: S,
    default_user: String,
    bridge_command: Option<String>,
    connect_to_unknown_hosts: bool,
    idle_timeout: std::time::Duration,
    sessions: HashMap<uuid::Uuid, RelaySession>,
    by_host: HashMap<String, uuid::Uuid>,
    by_channel: HashMap<String, uuid::Uuid>,
    authorize_cookies: HashMap<String, uuid::Uuid>,
    idle_timers: HashMap<uuid::Uuid, tokio_util_delay::DelayHandle>,
    idle_tx: Option<mpsc::UnboundedSender<uuid::Uuid>>,
}

mod tokio_util_delay {
    //! A minimal cancellable single-shot delay, since the workspace pulls
    //! in `tokio` without `time`'s `DelayQueue` equivalent from
    //! `tokio-util`. Cancellation is by generation counter: a fired timer
    //! whose generation no longer matches is a stale no-op.
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    pub struct DelayHandle {
        generation: Arc<AtomicU64>,
    }

    impl DelayHandle {
        /// Starts (or restarts) the delay, invalidating any earlier firing.
        pub fn arm(
            id: uuid::Uuid,
            duration: std::time::Duration,
            tx: tokio::sync::mpsc::UnboundedSender<uuid::Uuid>,
        ) -> Self {
            let generation = Arc::new(AtomicU64::new(1));
            let handle = DelayHandle {
                generation: generation.clone(),
            };
            let expected = generation.load(Ordering::SeqCst);
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if generation.load(Ordering::SeqCst) == expected {
                    let _ = tx.send(id);
                }
            });
            handle
        }

        pub fn cancel(&self) {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl<S: RelaySpawner> Broker<S> {
    pub fn new(spawner: S, default_user: impl Into<String>) -> Self {
        Broker {
            spawner,
            default_user: default_user.into(),
            bridge_command: None,
            connect_to_unknown_hosts: false,
            idle_timeout: std::time::Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS as u64),
            sessions: HashMap::new(),
            by_host: HashMap::new(),
            by_channel: HashMap::new(),
            authorize_cookies: HashMap::new(),
            idle_timers: HashMap::new(),
            idle_tx: None,
        }
    }

    pub fn with_bridge_command(mut self, command: impl Into<String>) -> Self {
        self.bridge_command = Some(command.into());
        self
    }

    pub fn with_connect_to_unknown_hosts(mut self, allow: bool) -> Self {
        self.connect_to_unknown_hosts = allow;
        self
    }

    /// Reads `[Ssh-Login] idle-timeout` out of `cockpit.conf` (§6.3),
    /// mirroring `ProcessRelaySpawner::from_config`'s use of `Config::uint`.
    pub fn with_idle_timeout_from_config(mut self, config: &Config) -> Self {
        let secs = config.uint(
            "Ssh-Login",
            "idle-timeout",
            DEFAULT_IDLE_TIMEOUT_SECS,
            1,
            900,
        );
        self.idle_timeout = std::time::Duration::from_secs(secs as u64);
        self
    }

    /// Runs the broker against one upstream transport until it is closed or
    /// returns an I/O error. Every still-live session is killed on exit.
    pub async fn run<R, W>(&mut self, mut upstream_in: R, mut upstream_out: W) -> Result<(), BrokerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<uuid::Uuid>();
        self.idle_tx = Some(idle_tx);
        let mut decoder = FrameDecoder::new();
        let mut pending_frames = std::collections::VecDeque::new();
        let mut read_buf = [0u8; 8192];
        // Relay event receivers, polled round-robin alongside the upstream.
        let mut relay_rx: HashMap<uuid::Uuid, mpsc::UnboundedReceiver<RelayEvent>> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                id = idle_rx.recv() => match id {
                    Some(id) => BrokerInternalEvent::IdleTimeout(id),
                    None => break,
                },
                result = read_one_frame(&mut upstream_in, &mut decoder, &mut pending_frames, &mut read_buf) => {
                    BrokerInternalEvent::Upstream(result)
                }
                (id, event) = recv_any_relay(&mut relay_rx), if !relay_rx.is_empty() => {
                    BrokerInternalEvent::Relay(id, event)
                }
            };

            match event {
                BrokerInternalEvent::Upstream(Ok(None)) => break,
                BrokerInternalEvent::Upstream(Ok(Some(frame))) if frame.channel.is_empty() => {
                    match ControlMessage::parse(&frame.payload) {
                        Ok(message) => {
                            self.handle_upstream(message, &mut upstream_out, &mut relay_rx)
                                .await?;
                        }
                        Err(error) => warn!(?error, "malformed control message from upstream"),
                    }
                }
                BrokerInternalEvent::Upstream(Ok(Some(frame))) => {
                    self.forward_channel_data(frame).await?;
                }
                BrokerInternalEvent::Upstream(Err(error)) => return Err(error.into()),
                BrokerInternalEvent::Relay(id, Some(event)) => {
                    self.handle_relay_event(id, event, &mut upstream_out).await?;
                }
                BrokerInternalEvent::Relay(id, None) => {
                    relay_rx.remove(&id);
                }
                BrokerInternalEvent::IdleTimeout(id) => {
                    self.close_session(id, None, &mut upstream_out).await?;
                    relay_rx.remove(&id);
                }
            }
        }

        let ids: Vec<_> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close_session(id, None, &mut upstream_out).await?;
        }
        Ok(())
    }

    async fn handle_upstream<W: AsyncWrite + Unpin>(
        &mut self,
        message: ControlMessage,
        upstream_out: &mut W,
        relay_rx: &mut HashMap<uuid::Uuid, mpsc::UnboundedReceiver<RelayEvent>>,
    ) -> Result<(), BrokerError> {
        match message.command() {
            Some("open") => self.handle_open(message, relay_rx).await,
            Some("close") => self.handle_close_from_upstream(message, upstream_out).await,
            Some("kill") => self.handle_kill(message, upstream_out).await,
            Some("authorize") => self.handle_authorize_from_upstream(message).await,
            Some("ping") => Ok(()),
            _ => self.forward_to_owning_session(message).await,
        }
    }

    async fn handle_open(
        &mut self,
        open: ControlMessage,
        relay_rx: &mut HashMap<uuid::Uuid, mpsc::UnboundedReceiver<RelayEvent>>,
    ) -> Result<(), BrokerError> {
        let Some(channel) = open.channel().map(str::to_owned) else {
            warn!("open without a channel id, dropping");
            return Ok(());
        };
        if let Some(&existing) = self.by_channel.get(&channel) {
            if !self
                .sessions
                .get(&existing)
                .map(|s| s.session.allows_duplicate_open(&channel))
                .unwrap_or(false)
            {
                warn!(%channel, "open for an already-open channel, dropping");
                return Ok(());
            }
        }

        let host = open.str_field("host").unwrap_or("localhost").to_owned();
        let private = wants_private_session(&open, &self.default_user);

        let session_id = if !private {
            self.by_host.get(&host).copied()
        } else {
            None
        };

        let session_id = match session_id {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4();
                let mut target = Target::parse(&host);
                if let Some(user) = open.str_field("user") {
                    target.user = Some(user.to_owned());
                }
                let credential = open_credential(&open);
                let params = SpawnParams {
                    target,
                    credential,
                    host_key_line: open.str_field("host-key").map(str::to_owned),
                    bridge_command: self.bridge_command.clone(),
                    connect_to_unknown_hosts: self.connect_to_unknown_hosts,
                };
                let (mut writer, rx) = self.spawner.spawn(params).await?;
                writer
                    .send_frame("", &init_message(PROTOCOL_VERSION).to_bytes())
                    .await?;
                relay_rx.insert(id, rx);
                self.sessions.insert(
                    id,
                    RelaySession {
                        session: Session::new(host.clone(), private),
                        writer,
                    },
                );
                if !private {
                    self.by_host.insert(host.clone(), id);
                }
                id
            }
        };

        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.session.channels.insert(channel.clone());
        }
        self.by_channel.insert(channel.clone(), session_id);
        self.cancel_idle_timer(session_id);

        self.dispatch_to_session(session_id, open).await
    }

    async fn handle_close_from_upstream<W: AsyncWrite + Unpin>(
        &mut self,
        message: ControlMessage,
        upstream_out: &mut W,
    ) -> Result<(), BrokerError> {
        let Some(channel) = message.channel().map(str::to_owned) else {
            return Ok(());
        };
        let Some(&session_id) = self.by_channel.get(&channel) else {
            return Ok(());
        };
        self.dispatch_to_session(session_id, message).await?;
        self.by_channel.remove(&channel);

        let (now_empty, private) = match self.sessions.get_mut(&session_id) {
            Some(entry) => {
                entry.session.channels.remove(&channel);
                (entry.session.is_empty(), entry.session.private)
            }
            None => return Ok(()),
        };

        if now_empty {
            if private {
                self.close_session(session_id, None, upstream_out).await?;
            } else {
                self.arm_idle_timer(session_id);
            }
        }
        Ok(())
    }

    async fn handle_kill<W: AsyncWrite + Unpin>(
        &mut self,
        message: ControlMessage,
        upstream_out: &mut W,
    ) -> Result<(), BrokerError> {
        let host = message.str_field("host");
        let targets: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, entry)| host.map(|h| entry.session.host == h).unwrap_or(true))
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.close_session(id, Some(cockpit_ssh_common::Problem::Terminated), upstream_out)
                .await?;
        }
        Ok(())
    }

    async fn handle_authorize_from_upstream(&mut self, message: ControlMessage) -> Result<(), BrokerError> {
        let Some(cookie) = message.str_field("cookie").map(str::to_owned) else {
            warn!("authorize reply without a cookie, dropping");
            return Ok(());
        };
        let Some(&session_id) = self.authorize_cookies.get(&cookie) else {
            warn!(%cookie, "authorize reply for unknown cookie, dropping");
            return Ok(());
        };
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.session.authorizes.remove(&cookie);
            entry.writer.send_frame("", &message.to_bytes()).await?;
        }
        self.authorize_cookies.remove(&cookie);
        Ok(())
    }

    async fn forward_to_owning_session(&mut self, message: ControlMessage) -> Result<(), BrokerError> {
        let Some(channel) = message.channel().map(str::to_owned) else {
            return Ok(());
        };
        if let Some(&session_id) = self.by_channel.get(&channel) {
            self.dispatch_to_session(session_id, message).await?;
        }
        Ok(())
    }

    /// Forwards raw payload bytes for an already-open channel straight to
    /// its relay's stdin (§4.A: data frames, as opposed to the empty-channel
    /// control frames handled by `dispatch_to_session`).
    async fn forward_channel_data(&mut self, frame: Frame) -> Result<(), BrokerError> {
        let Some(&session_id) = self.by_channel.get(&frame.channel) else {
            return Ok(());
        };
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.writer.send_frame(&frame.channel, &frame.payload).await?;
        }
        Ok(())
    }

    /// Forwards or freezes a control message per the session's `init`
    /// state (§3 invariant, §4.H "Init handshake").
    async fn dispatch_to_session(
        &mut self,
        session_id: uuid::Uuid,
        message: ControlMessage,
    ) -> Result<(), BrokerError> {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Ok(());
        };
        let command = message.command().unwrap_or_default().to_owned();
        if entry.session.must_freeze(&command) {
            entry.session.frozen_queue.push_back(message);
            return Ok(());
        }
        entry.writer.send_frame("", &message.to_bytes()).await?;
        Ok(())
    }

    async fn handle_relay_event<W: AsyncWrite + Unpin>(
        &mut self,
        session_id: uuid::Uuid,
        event: RelayEvent,
        upstream_out: &mut W,
    ) -> Result<(), BrokerError> {
        match event {
            RelayEvent::Frame(frame) => {
                if frame.channel.is_empty() {
                    self.handle_relay_control_frame(session_id, &frame.payload)
                        .await?;
                } else {
                    upstream_out
                        .write_all(&encode_frame(&frame.channel, &frame.payload))
                        .await?;
                }
                Ok(())
            }
            RelayEvent::Prompt(_) => {
                // Bridge-credential prompts are answered by whatever drove the
                // `open` (e.g. an interactive upstream); the broker itself
                // only owns Bridge-mode relays indirectly and has no peer to
                // ask, so it is surfaced purely via tracing for now.
                debug!(%session_id, "relay requested a credential prompt");
                Ok(())
            }
            RelayEvent::Verdict(verdict) => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.session.host_key = verdict.host_key;
                    entry.session.host_fingerprint = verdict.host_fingerprint;
                    entry.session.auth_method_results =
                        verdict.auth_method_results.into_iter().collect();
                }
                Ok(())
            }
            RelayEvent::Exited(code) => {
                self.close_session(session_id, code.problem(), upstream_out)
                    .await
            }
            RelayEvent::TimedOut => {
                self.close_session(
                    session_id,
                    Some(cockpit_ssh_common::Problem::Timeout),
                    upstream_out,
                )
                .await
            }
        }
    }

    async fn handle_relay_control_frame(
        &mut self,
        session_id: uuid::Uuid,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let message = ControlMessage::parse(payload)?;
        match message.command() {
            Some("init") => {
                let checksum = message.str_field("checksum").map(str::to_owned);
                let frozen = if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.session.init_received = true;
                    entry.session.checksum = checksum;
                    std::mem::take(&mut entry.session.frozen_queue)
                } else {
                    return Ok(());
                };
                if !frozen.is_empty() {
                    if let Some(entry) = self.sessions.get_mut(&session_id) {
                        entry.session.thawing = frozen.len() as u32;
                    }
                    for queued in frozen {
                        self.dispatch_to_session(session_id, queued).await?;
                    }
                    if let Some(entry) = self.sessions.get_mut(&session_id) {
                        entry.session.thawing = 0;
                    }
                }
                Ok(())
            }
            Some("authorize") => {
                if let Some(cookie) = message.str_field("cookie").map(str::to_owned) {
                    if let Some(entry) = self.sessions.get_mut(&session_id) {
                        entry.session.authorizes.insert(cookie.clone());
                    }
                    self.authorize_cookies.insert(cookie, session_id);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn close_session<W: AsyncWrite + Unpin>(
        &mut self,
        session_id: uuid::Uuid,
        problem: Option<cockpit_ssh_common::Problem>,
        upstream_out: &mut W,
    ) -> Result<(), BrokerError> {
        let Some(mut entry) = self.sessions.remove(&session_id) else {
            return Ok(());
        };
        if entry.session.sent_done {
            return Ok(());
        }
        entry.session.sent_done = true;

        if self.by_host.get(&entry.session.host) == Some(&session_id) {
            self.by_host.remove(&entry.session.host);
        }
        self.idle_timers.remove(&session_id).map(|h| h.cancel());

        for channel in entry.session.channels.drain() {
            self.by_channel.remove(&channel);
            let mut close = ControlMessage::new("close").with("channel", channel);
            if let Some(problem) = problem {
                close.set("problem", problem.as_str());
            }
            if let Some(host_key) = &entry.session.host_key {
                close.set("host-key", host_key.clone());
            }
            if let Some(fingerprint) = &entry.session.host_fingerprint {
                close.set("host-fingerprint", fingerprint.clone());
            }
            if !entry.session.auth_method_results.is_empty() {
                let results: serde_json::Map<_, _> = entry
                    .session
                    .auth_method_results
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or_default()))
                    .collect();
                close.set("auth-method-results", serde_json::Value::Object(results));
            }
            upstream_out.write_all(&encode_frame("", &close.to_bytes())).await?;
        }

        for cookie in entry.session.authorizes.drain() {
            self.authorize_cookies.remove(&cookie);
        }

        Ok(())
    }

    fn arm_idle_timer(&mut self, session_id: uuid::Uuid) {
        let Some(idle_tx) = self.idle_tx.clone() else {
            return;
        };
        let handle = tokio_util_delay::DelayHandle::arm(session_id, self.idle_timeout, idle_tx);
        self.idle_timers.insert(session_id, handle);
    }

    fn cancel_idle_timer(&mut self, session_id: uuid::Uuid) {
        if let Some(handle) = self.idle_timers.remove(&session_id) {
            handle.cancel();
        }
    }
}

async fn read_one_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    pending: &mut std::collections::VecDeque<Frame>,
    buf: &mut [u8],
) -> std::io::Result<Option<Frame>> {
    loop {
        if let Some(frame) = pending.pop_front() {
            return Ok(Some(frame));
        }
        let frames = decoder.decode_all().map_err(std::io::Error::other)?;
        if !frames.is_empty() {
            pending.extend(frames);
            continue;
        }
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(None);
        }
        decoder.feed(&buf[..n]);
    }
}

async fn recv_any_relay(
    receivers: &mut HashMap<uuid::Uuid, mpsc::UnboundedReceiver<RelayEvent>>,
) -> (uuid::Uuid, Option<RelayEvent>) {
    use futures::stream::{FuturesUnordered, StreamExt};

    let mut polls: FuturesUnordered<_> = receivers
        .iter_mut()
        .map(|(id, rx)| {
            let id = *id;
            Box::pin(async move { (id, rx.recv().await) })
        })
        .collect();
    polls.next().await.expect("receivers is non-empty")
}

fn open_credential(open: &ControlMessage) -> Credential {
    if let Some(password) = open.str_field("password") {
        return Credential::Password(password.to_owned().into());
    }
    Credential::Bridge
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use cockpit_ssh_common::AuthMethodResult;
    use cockpit_ssh_relay::auth_fd::Verdict;

    /// Records every frame a session's relay writer was asked to send, so
    /// tests can assert on what the broker forwarded without a real
    /// subprocess (mirrors `SpawnParams`/`RelayWriter`'s seam, §10.4).
    struct FakeWriter {
        sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    #[async_trait::async_trait]
    impl RelayWriter for FakeWriter {
        async fn send_frame(&mut self, channel: &str, payload: &[u8]) -> std::io::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.to_owned(), payload.to_vec()));
            Ok(())
        }

        async fn answer_prompt(&mut self, _reply: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FakeRelay {
        sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    #[derive(Default)]
    struct FakeSpawner {
        params: Arc<Mutex<Vec<SpawnParams>>>,
        relays: Arc<Mutex<Vec<FakeRelay>>>,
    }

    #[async_trait::async_trait]
    impl RelaySpawner for FakeSpawner {
        async fn spawn(
            &self,
            params: SpawnParams,
        ) -> Result<(Box<dyn RelayWriter>, mpsc::UnboundedReceiver<RelayEvent>), BrokerError> {
            self.params.lock().unwrap().push(params);
            let sent = Arc::new(Mutex::new(Vec::new()));
            self.relays.lock().unwrap().push(FakeRelay { sent: sent.clone() });
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok((Box::new(FakeWriter { sent }), rx))
        }
    }

    fn new_broker() -> Broker<FakeSpawner> {
        Broker::new(FakeSpawner::default(), "admin")
    }

    fn sent_commands(sent: &Arc<Mutex<Vec<(String, Vec<u8>)>>>) -> Vec<(String, Option<String>)> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|(channel, payload)| {
                let command = ControlMessage::parse(payload)
                    .ok()
                    .and_then(|m| m.command().map(str::to_owned));
                (channel.clone(), command)
            })
            .collect()
    }

    #[tokio::test]
    async fn opening_two_channels_on_the_same_host_shares_one_session() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();

        let open_a = ControlMessage::new("open")
            .with("channel", "4")
            .with("host", "example.com");
        let open_b = ControlMessage::new("open")
            .with("channel", "5")
            .with("host", "example.com");

        broker.handle_open(open_a, &mut relay_rx).await.unwrap();
        broker.handle_open(open_b, &mut relay_rx).await.unwrap();

        assert_eq!(broker.sessions.len(), 1, "one shared session, not two");
        assert_eq!(relay_rx.len(), 1);
        assert_eq!(broker.spawner.params.lock().unwrap().len(), 1, "one relay spawned");

        let session_id = *broker.by_host.get("example.com").unwrap();
        let session = &broker.sessions.get(&session_id).unwrap().session;
        assert!(session.channels.contains("4"));
        assert!(session.channels.contains("5"));
    }

    #[tokio::test]
    async fn host_key_pin_forces_a_private_unshared_session() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();

        let open_a = ControlMessage::new("open")
            .with("channel", "4")
            .with("host", "example.com")
            .with("host-key", "example.com ssh-rsa AAAA");
        let open_b = ControlMessage::new("open")
            .with("channel", "5")
            .with("host", "example.com")
            .with("host-key", "example.com ssh-rsa AAAA");

        broker.handle_open(open_a, &mut relay_rx).await.unwrap();
        broker.handle_open(open_b, &mut relay_rx).await.unwrap();

        assert_eq!(broker.sessions.len(), 2, "private sessions are never shared");
        assert!(
            !broker.by_host.contains_key("example.com"),
            "private sessions never appear in by_host"
        );
        assert_eq!(broker.spawner.params.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn open_is_frozen_until_relays_init_arrives_then_replayed() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();

        let open = ControlMessage::new("open")
            .with("channel", "4")
            .with("host", "example.com");
        broker.handle_open(open, &mut relay_rx).await.unwrap();

        let session_id = *broker.by_host.get("example.com").unwrap();
        let sent = broker.spawner.relays.lock().unwrap()[0].sent.clone();

        // Only the broker's own init greeting has gone out; the `open`
        // itself is queued behind it pending the relay's own init reply.
        assert_eq!(sent_commands(&sent), vec![("".to_owned(), Some("init".to_owned()))]);
        assert!(!broker.sessions[&session_id].session.frozen_queue.is_empty());

        let relay_init = ControlMessage::new("init").with("version", 1u64).to_bytes();
        broker
            .handle_relay_control_frame(session_id, &relay_init)
            .await
            .unwrap();

        assert!(broker.sessions[&session_id].session.init_received);
        assert!(broker.sessions[&session_id].session.frozen_queue.is_empty());
        let commands = sent_commands(&sent);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1], ("".to_owned(), Some("open".to_owned())));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_last_channel_of_a_shared_session_arms_an_idle_timer_not_an_immediate_close() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        broker.idle_tx = Some(idle_tx);

        let open = ControlMessage::new("open")
            .with("channel", "4")
            .with("host", "example.com");
        broker.handle_open(open, &mut relay_rx).await.unwrap();
        let session_id = *broker.by_host.get("example.com").unwrap();

        let mut out = Vec::new();
        let close = ControlMessage::new("close").with("channel", "4");
        broker.handle_close_from_upstream(close, &mut out).await.unwrap();

        assert!(out.is_empty(), "a shared session close defers to the idle timer");
        assert!(broker.sessions.contains_key(&session_id), "not torn down yet");
        assert!(broker.idle_timers.contains_key(&session_id));

        tokio::time::advance(broker.idle_timeout + std::time::Duration::from_millis(10)).await;
        let fired = idle_rx.recv().await.unwrap();
        assert_eq!(fired, session_id);
    }

    #[tokio::test]
    async fn closing_the_last_channel_of_a_private_session_closes_it_immediately() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();

        let open = ControlMessage::new("open")
            .with("channel", "4")
            .with("host", "example.com")
            .with("session", "private");
        broker.handle_open(open, &mut relay_rx).await.unwrap();
        let session_id = *broker
            .sessions
            .keys()
            .next()
            .copied()
            .expect("one session");

        let mut out = Vec::new();
        let close = ControlMessage::new("close").with("channel", "4");
        broker.handle_close_from_upstream(close, &mut out).await.unwrap();

        assert!(!broker.sessions.contains_key(&session_id), "private session closes at once");
        let mut decoder = FrameDecoder::new();
        decoder.feed(&out);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 1);
        let msg = ControlMessage::parse(&frames[0].payload).unwrap();
        assert_eq!(msg.command(), Some("close"));
        assert_eq!(msg.channel(), Some("4"));
    }

    #[tokio::test]
    async fn kill_host_closes_every_channel_with_terminated() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();

        for channel in ["a", "b", "c"] {
            let open = ControlMessage::new("open")
                .with("channel", channel)
                .with("host", "localhost");
            broker.handle_open(open, &mut relay_rx).await.unwrap();
        }

        let mut out = Vec::new();
        let kill = ControlMessage::new("kill").with("host", "localhost");
        broker.handle_kill(kill, &mut out).await.unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&out);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 3);
        let mut channels: Vec<_> = frames
            .iter()
            .map(|f| {
                let msg = ControlMessage::parse(&f.payload).unwrap();
                assert_eq!(msg.command(), Some("close"));
                assert_eq!(msg.str_field("problem"), Some("terminated"));
                msg.channel().unwrap().to_owned()
            })
            .collect();
        channels.sort();
        assert_eq!(channels, vec!["a", "b", "c"]);
        assert!(broker.sessions.is_empty());
        assert!(broker.by_host.is_empty());
    }

    #[tokio::test]
    async fn relay_exit_carries_verdict_diagnostics_into_the_synthesized_close() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();

        let open = ControlMessage::new("open")
            .with("channel", "4")
            .with("host", "example.com");
        broker.handle_open(open, &mut relay_rx).await.unwrap();
        let session_id = *broker.by_host.get("example.com").unwrap();

        let mut out = Vec::new();
        let verdict = Verdict {
            host_key: Some("example.com ssh-rsa AAAA".to_owned()),
            host_fingerprint: Some("aa:bb:cc".to_owned()),
            auth_method_results: [("password".to_owned(), AuthMethodResult::Denied)]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        broker
            .handle_relay_event(session_id, RelayEvent::Verdict(verdict), &mut out)
            .await
            .unwrap();
        broker
            .handle_relay_event(
                session_id,
                RelayEvent::Exited(ExitCode::AuthenticationFailed),
                &mut out,
            )
            .await
            .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&out);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 1);
        let msg = ControlMessage::parse(&frames[0].payload).unwrap();
        assert_eq!(msg.command(), Some("close"));
        assert_eq!(msg.str_field("problem"), Some("authentication-failed"));
        assert_eq!(msg.str_field("host-key"), Some("example.com ssh-rsa AAAA"));
        assert_eq!(msg.str_field("host-fingerprint"), Some("aa:bb:cc"));
        assert_eq!(
            msg.0.get("auth-method-results").and_then(|v| v.get("password")),
            Some(&serde_json::Value::String("denied".to_owned()))
        );
        assert!(broker.sessions.is_empty());
    }

    #[tokio::test]
    async fn relay_timed_out_closes_session_with_timeout_problem() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();

        let open = ControlMessage::new("open")
            .with("channel", "5")
            .with("host", "example.com");
        broker.handle_open(open, &mut relay_rx).await.unwrap();
        let session_id = *broker.by_host.get("example.com").unwrap();

        let mut out = Vec::new();
        broker
            .handle_relay_event(session_id, RelayEvent::TimedOut, &mut out)
            .await
            .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&out);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 1);
        let msg = ControlMessage::parse(&frames[0].payload).unwrap();
        assert_eq!(msg.command(), Some("close"));
        assert_eq!(msg.str_field("problem"), Some("timeout"));
        assert!(broker.sessions.is_empty());
    }

    #[tokio::test]
    async fn authorize_reply_is_routed_back_to_the_relay_that_issued_the_cookie() {
        let mut broker = new_broker();
        let mut relay_rx = HashMap::new();

        let open = ControlMessage::new("open")
            .with("channel", "4")
            .with("host", "example.com");
        broker.handle_open(open, &mut relay_rx).await.unwrap();
        let session_id = *broker.by_host.get("example.com").unwrap();
        let sent = broker.spawner.relays.lock().unwrap()[0].sent.clone();

        let downstream_challenge = ControlMessage::new("authorize")
            .with("cookie", "c1")
            .with("challenge", "crypt1:xyz")
            .to_bytes();
        broker
            .handle_relay_control_frame(session_id, &downstream_challenge)
            .await
            .unwrap();
        assert!(broker.authorize_cookies.contains_key("c1"));

        let reply = ControlMessage::new("authorize")
            .with("cookie", "c1")
            .with("response", "secret");
        broker.handle_authorize_from_upstream(reply).await.unwrap();

        assert!(!broker.authorize_cookies.contains_key("c1"), "cookie consumed");
        let commands = sent_commands(&sent);
        assert!(commands
            .iter()
            .any(|(channel, command)| channel.is_empty() && command.as_deref() == Some("authorize")));
    }

    #[tokio::test]
    async fn unknown_authorize_cookie_is_dropped_without_panicking() {
        let mut broker = new_broker();
        let reply = ControlMessage::new("authorize").with("cookie", "ghost");
        broker.handle_authorize_from_upstream(reply).await.unwrap();
        assert!(broker.authorize_cookies.is_empty());
    }

    struct TempConfigFile {
        path: std::path::PathBuf,
    }

    impl TempConfigFile {
        fn new(contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "cockpit-ssh-broker-test-{}-{:?}",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ));
            std::fs::write(&path, contents).unwrap();
            Self { path }
        }
    }

    impl Drop for TempConfigFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn idle_timeout_defaults_to_30_seconds() {
        let broker = new_broker();
        assert_eq!(broker.idle_timeout, std::time::Duration::from_secs(30));
    }

    #[test]
    fn idle_timeout_reads_ssh_login_section() {
        let file = TempConfigFile::new("[Ssh-Login]\nidle-timeout=5\n");
        let config = cockpit_ssh_common::Config::load(file.path.to_str().unwrap());
        let broker = new_broker().with_idle_timeout_from_config(&config);
        assert_eq!(broker.idle_timeout, std::time::Duration::from_secs(5));
    }

    #[test]
    fn idle_timeout_clamps_out_of_range_value() {
        let file = TempConfigFile::new("[Ssh-Login]\nidle-timeout=10000\n");
        let config = cockpit_ssh_common::Config::load(file.path.to_str().unwrap());
        let broker = new_broker().with_idle_timeout_from_config(&config);
        assert_eq!(broker.idle_timeout, std::time::Duration::from_secs(900));
    }
}
