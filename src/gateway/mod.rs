//! Connection lifecycle for the event gateway.
//!
//! One task owns the socket and everything scheduled around it: the
//! hello/identify handshake, heartbeats and their acknowledgement
//! watchdog, resumption after drops, outbound payload budgeting, and
//! the fan-out of inbound dispatches. The rest of the crate talks to
//! that task through a [`Shard`] handle.

pub mod frame;
mod heartbeat;
mod limiter;
mod session;

pub use self::{
    frame::{CloseCode, GatewayFrame, Opcode},
    session::ConnectionStage,
};

use self::{heartbeat::Heartbeat, limiter::PayloadLimiter, session::Session};
use crate::{
    cache::Cache,
    chunk::ChunkCoordinator,
    config::Config,
    constants::{
        CHUNK_BATCH_INTERVAL,
        CHUNK_CYCLE_INTERVAL,
        DEFAULT_GATEWAY_URL,
        GATEWAY_SEND_WINDOW,
        GATEWAY_VERSION,
        INVALID_SESSION_DELAY,
        RECONNECT_DELAY,
        RESUMABLE_CLOSE_CODE,
        SHUTDOWN_CLOSE_CODE,
        UNAVAILABLE_GUILD_TIMEOUT,
    },
    dispatch::{Dispatcher, HandlerMap},
    error::Error,
    events::Event,
    http::Http,
    model::{Guild, GuildMembersChunk, Hello, Ready, UnavailableGuild, VoiceServerUpdate, VoiceState},
    voice::{self, Negotiator, VoiceBackend},
    ws::{self, WsStream},
};
use flume::{Receiver, Sender};
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;

pub(crate) enum ShardMessage {
    Send(GatewayFrame),
    Close { graceful: bool },
}

/// Handle used to talk to the running connection task.
#[derive(Clone)]
pub(crate) struct Shard {
    tx: Sender<ShardMessage>,
}

impl Shard {
    pub(crate) fn send(&self, frame: GatewayFrame) -> Result<(), Error> {
        self.tx
            .send(ShardMessage::Send(frame))
            .map_err(|_| Error::NotConnected)
    }

    pub(crate) fn close(&self, graceful: bool) -> Result<(), Error> {
        self.tx
            .send(ShardMessage::Close { graceful })
            .map_err(|_| Error::NotConnected)
    }
}

enum LoopOutcome {
    Reconnect,
    Critical(CloseCode),
    Shutdown,
}

enum FrameAction {
    Continue,
    Reconnect,
}

/// The connection task itself.
pub(crate) struct ShardRunner {
    config: Config,
    rx: Receiver<ShardMessage>,
    events: Sender<Event>,
    cache: Arc<dyn Cache>,
    dispatcher: Dispatcher,
    chunker: ChunkCoordinator,
    negotiator: Arc<Negotiator>,
    backend: Option<Arc<dyn VoiceBackend>>,
    http: Http,
    latency: Arc<RwLock<Option<Duration>>>,
    outbox: VecDeque<GatewayFrame>,
    stage: Arc<RwLock<ConnectionStage>>,
    session: Session,
    heartbeat: Option<Heartbeat>,
    limiter: PayloadLimiter,
    gateway_url: Option<Url>,
    reconnects: usize,
    fallback_deadline: Option<Instant>,
    /// Deferred re-handshake after an invalidated session, with whether
    /// the gateway allowed a resume.
    rehandshake: Option<(Instant, bool)>,
}

impl ShardRunner {
    pub(crate) fn new(
        config: Config,
        events: Sender<Event>,
        cache: Arc<dyn Cache>,
        handlers: HandlerMap,
        negotiator: Arc<Negotiator>,
        backend: Option<Arc<dyn VoiceBackend>>,
        latency: Arc<RwLock<Option<Duration>>>,
        stage: Arc<RwLock<ConnectionStage>>,
    ) -> (Shard, Self) {
        let (tx, rx) = flume::unbounded();

        let runner = Self {
            http: Http::new(config.token.clone()),
            dispatcher: Dispatcher::new(handlers),
            chunker: ChunkCoordinator::new(config.chunk_guilds),
            config,
            rx,
            events,
            cache,
            negotiator,
            backend,
            latency,
            stage,
            outbox: VecDeque::new(),
            session: Session::new(),
            heartbeat: None,
            limiter: PayloadLimiter::new(),
            gateway_url: None,
            reconnects: 0,
            fallback_deadline: None,
            rehandshake: None,
        };

        (Shard { tx }, runner)
    }

    fn stage(&self) -> ConnectionStage {
        *self.stage.read()
    }

    fn set_stage(&self, stage: ConnectionStage) {
        *self.stage.write() = stage;
    }

    /// Runs until shut down or until the gateway refuses the
    /// connection outright.
    #[instrument(skip(self))]
    pub(crate) async fn run(mut self) {
        loop {
            let url = match self.resolve_gateway_url().await {
                Ok(url) => url,
                Err(e) => {
                    error!("Could not build a gateway url: {}", e);
                    self.emit(Event::GatewayError(e));
                    return;
                },
            };

            self.set_stage(ConnectionStage::Connecting);
            let mut ws = match WsStream::connect(url).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("Failed to connect to the gateway: {:?}", e);
                    self.set_stage(ConnectionStage::Disconnected);
                    if self.wait_or_close(RECONNECT_DELAY).await {
                        self.emit(Event::Closed);
                        return;
                    }
                    continue;
                },
            };

            match self.drive(&mut ws).await {
                LoopOutcome::Reconnect => {
                    self.teardown_for_reconnect();
                    if self.wait_or_close(RECONNECT_DELAY).await {
                        self.emit(Event::Closed);
                        return;
                    }
                },
                LoopOutcome::Critical(code) => {
                    error!("Gateway rejected the connection: {}.", code);
                    self.emit(Event::GatewayError(Error::CriticalClose(code)));
                    return;
                },
                LoopOutcome::Shutdown => {
                    info!("Gateway connection shut down.");
                    self.emit(Event::Closed);
                    return;
                },
            }
        }
    }

    /// Picks the socket URL: the configured override, then the cached
    /// bootstrap answer, then a fresh bootstrap query.
    async fn resolve_gateway_url(&mut self) -> Result<Url, Error> {
        if let Some(url) = &self.config.gateway_url {
            return build_gateway_url(url);
        }

        if let Some(url) = &self.gateway_url {
            return Ok(url.clone());
        }

        let base = match self.http.bot_gateway().await {
            Ok(gateway) => {
                if let Some(limit) = gateway.session_start_limit {
                    if limit.remaining <= self.config.session_start_threshold {
                        let wait = limit.reset_delay();
                        warn!(
                            "Session starts nearly exhausted ({} of {} left); sleeping {:?} until the window resets.",
                            limit.remaining, limit.total, wait,
                        );
                        time::sleep(wait).await;
                    }
                }
                gateway.url
            },
            Err(e) => {
                warn!("Gateway bootstrap failed: {}. Falling back to the default endpoint.", e);
                DEFAULT_GATEWAY_URL.to_string()
            },
        };

        let url = build_gateway_url(&base)?;
        self.gateway_url = Some(url.clone());
        Ok(url)
    }

    /// Services one socket until it is lost, recycled, or shut down.
    async fn drive(&mut self, ws: &mut WsStream) -> LoopOutcome {
        let mut window =
            time::interval_at(Instant::now() + GATEWAY_SEND_WINDOW, GATEWAY_SEND_WINDOW);
        let mut cycle =
            time::interval_at(Instant::now() + CHUNK_CYCLE_INTERVAL, CHUNK_CYCLE_INTERVAL);
        let mut batch =
            time::interval_at(Instant::now() + CHUNK_BATCH_INTERVAL, CHUNK_BATCH_INTERVAL);

        loop {
            if let Err(e) = self.flush_outbox(ws).await {
                return self.classify_ws_error(&e);
            }

            let next_beat = self.heartbeat.as_ref().map(Heartbeat::next_beat);
            let ack_deadline = self.heartbeat.as_ref().and_then(Heartbeat::ack_deadline);
            let rehandshake_at = self.rehandshake.map(|(at, _)| at);
            let connected = self.stage().is_connected();

            tokio::select! {
                biased;

                () = time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                    let outcome = self.on_missed_ack();
                    close_socket(ws, RESUMABLE_CLOSE_CODE, "heartbeat ack overdue").await;
                    return outcome;
                },
                () = time::sleep_until(next_beat.unwrap_or_else(Instant::now)), if next_beat.is_some() => {
                    self.beat();
                },
                () = time::sleep_until(rehandshake_at.unwrap_or_else(Instant::now)), if rehandshake_at.is_some() => {
                    self.finish_rehandshake();
                },
                _ = window.tick() => {
                    self.release_deferred();
                },
                _ = cycle.tick(), if connected => {
                    self.chunker.kick_cycle();
                },
                _ = batch.tick(), if connected => {
                    self.send_chunk_batch();
                    self.check_ready().await;
                },
                () = time::sleep_until(self.fallback_deadline.unwrap_or_else(Instant::now)), if self.fallback_deadline.is_some() => {
                    let abandoned = self.chunker.abandon_unavailable();
                    warn!("{} guilds never became available; continuing without them.", abandoned);
                    self.fallback_deadline = None;
                    self.check_ready().await;
                },
                msg = self.rx.recv_async() => match msg {
                    Ok(ShardMessage::Send(frame)) => self.enqueue(frame, false),
                    Ok(ShardMessage::Close { graceful }) => {
                        self.set_stage(ConnectionStage::Closing);
                        if graceful {
                            close_socket(ws, SHUTDOWN_CLOSE_CODE, "").await;
                        }
                        return LoopOutcome::Shutdown;
                    },
                    Err(_) => {
                        self.set_stage(ConnectionStage::Closing);
                        close_socket(ws, SHUTDOWN_CLOSE_CODE, "").await;
                        return LoopOutcome::Shutdown;
                    },
                },
                frame = ws.recv_frame() => match frame {
                    Ok(Some(frame)) => match self.handle_frame(frame).await {
                        FrameAction::Continue => {},
                        FrameAction::Reconnect => {
                            close_socket(ws, RESUMABLE_CLOSE_CODE, "reconnect requested").await;
                            return LoopOutcome::Reconnect;
                        },
                    },
                    Ok(None) => {},
                    Err(e) => return self.classify_ws_error(&e),
                },
            }
        }
    }

    /// Applies one inbound frame to the connection state machine.
    async fn handle_frame(&mut self, frame: GatewayFrame) -> FrameAction {
        if let Some(sequence) = frame.s {
            self.session.observe(sequence);
        }

        match frame.op {
            Opcode::Hello => {
                let hello: Hello = match serde_json::from_value(frame.d) {
                    Ok(hello) => hello,
                    Err(e) => {
                        warn!("Undecodable hello payload: {}.", e);
                        return FrameAction::Reconnect;
                    },
                };

                self.heartbeat = Some(Heartbeat::new(Duration::from_millis(
                    hello.heartbeat_interval,
                )));
                self.begin_handshake();
            },
            Opcode::Heartbeat => {
                // The gateway wants a beat right now, schedule or not.
                if let Some(heartbeat) = self.heartbeat.as_mut() {
                    heartbeat.fire_forced();
                }
                let sequence = self.session.sequence();
                self.enqueue(GatewayFrame::heartbeat(sequence), true);
                self.emit(Event::Heartbeat { sequence });
            },
            Opcode::HeartbeatAck => {
                if let Some(latency) = self.heartbeat.as_mut().and_then(Heartbeat::ack) {
                    trace!("Heartbeat acknowledged in {:?}.", latency);
                    *self.latency.write() = Some(latency);
                    self.emit(Event::HeartbeatAck { latency });
                }
            },
            Opcode::Reconnect => {
                info!("Gateway requested a reconnect.");
                return FrameAction::Reconnect;
            },
            Opcode::InvalidSession => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                warn!("Session invalidated by the gateway (resumable: {}).", resumable);

                // The handshake replay waits off to the side; beats and
                // inbound traffic keep flowing meanwhile.
                self.rehandshake = Some((Instant::now() + INVALID_SESSION_DELAY, resumable));
            },
            Opcode::Dispatch => {
                let name = match frame.t {
                    Some(name) => name,
                    None => {
                        debug!("Dispatch frame without an event name.");
                        return FrameAction::Continue;
                    },
                };
                self.handle_dispatch(&name, frame.d).await;
            },
            other => {
                trace!("Ignoring unexpected frame: {}.", other);
            },
        }

        FrameAction::Continue
    }

    /// Routes one named dispatch through the readiness, voice, and
    /// handler machinery.
    async fn handle_dispatch(&mut self, name: &str, payload: Value) {
        match name {
            "READY" => self.handle_ready(&payload),
            "RESUMED" => {
                info!("Session resumed after {} reconnects.", self.reconnects);
                self.set_stage(ConnectionStage::Connected);
                self.reconnects = 0;
                self.emit(Event::Reconnected);
            },
            "GUILD_CREATE" => match serde_json::from_value::<Guild>(payload.clone()) {
                Ok(guild) => self.chunker.on_guild_create(self.cache.as_ref(), guild),
                Err(e) => warn!("Undecodable GUILD_CREATE payload: {}.", e),
            },
            "GUILD_DELETE" => match serde_json::from_value::<UnavailableGuild>(payload.clone()) {
                Ok(stub) => self.chunker.on_guild_delete(self.cache.as_ref(), stub),
                Err(e) => warn!("Undecodable GUILD_DELETE payload: {}.", e),
            },
            "GUILD_MEMBERS_CHUNK" =>
                match serde_json::from_value::<GuildMembersChunk>(payload.clone()) {
                    Ok(chunk) => self.chunker.on_members_chunk(self.cache.as_ref(), chunk),
                    Err(e) => warn!("Undecodable GUILD_MEMBERS_CHUNK payload: {}.", e),
                },
            "VOICE_STATE_UPDATE" => self.handle_voice_state(&payload),
            "VOICE_SERVER_UPDATE" => self.handle_voice_server(&payload),
            _ => {},
        }

        let produced = self
            .dispatcher
            .dispatch(self.cache.as_ref(), name, payload)
            .await;
        for event in produced {
            self.emit(event);
        }

        self.check_ready().await;
    }

    fn handle_ready(&mut self, payload: &Value) {
        let ready: Ready = match serde_json::from_value(payload.clone()) {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Undecodable READY payload: {}.", e);
                return;
            },
        };

        info!(
            "Session {} opened as user {}; {} guilds to come.",
            ready.session_id,
            ready.user.id,
            ready.guilds.len(),
        );

        self.session.start(ready.session_id.clone());
        self.negotiator.set_user(ready.user.id);
        self.dispatcher.set_own_user(ready.user.id);
        self.dispatcher.on_new_session();
        self.chunker.on_ready(&ready.guilds);

        self.fallback_deadline = if self.chunker.awaiting_unavailable() {
            Some(Instant::now() + UNAVAILABLE_GUILD_TIMEOUT)
        } else {
            None
        };

        self.set_stage(ConnectionStage::Connected);
        self.reconnects = 0;
    }

    fn handle_voice_state(&mut self, payload: &Value) {
        let state: VoiceState = match serde_json::from_value(payload.clone()) {
            Ok(state) => state,
            Err(e) => {
                debug!("Undecodable VOICE_STATE_UPDATE payload: {}.", e);
                return;
            },
        };

        // Other users' movements never feed join bookkeeping.
        if self.negotiator.user() != Some(state.user_id) {
            return;
        }

        let guild = match state.guild_id {
            Some(guild) => guild,
            None => return,
        };

        match state.channel_id {
            Some(channel) => {
                if let Some((credentials, tx)) =
                    self.negotiator
                        .apply_state_update(guild, state.session_id, channel)
                {
                    voice::spawn_connect(
                        self.backend.clone(),
                        self.negotiator.clone(),
                        credentials,
                        tx,
                    );
                }
            },
            None => {
                info!("Voice session for guild {} ended by the gateway.", guild);
                self.negotiator.drop_guild(guild);
                if let Some(backend) = self.backend.clone() {
                    tokio::spawn(async move { backend.disconnect(guild).await });
                }
            },
        }
    }

    fn handle_voice_server(&mut self, payload: &Value) {
        let update: VoiceServerUpdate = match serde_json::from_value(payload.clone()) {
            Ok(update) => update,
            Err(e) => {
                debug!("Undecodable VOICE_SERVER_UPDATE payload: {}.", e);
                return;
            },
        };

        let guild = match update.guild_id {
            Some(guild) => guild,
            None => return,
        };

        if let Some((credentials, tx)) =
            self.negotiator
                .apply_server_update(guild, update.endpoint, update.token)
        {
            voice::spawn_connect(
                self.backend.clone(),
                self.negotiator.clone(),
                credentials,
                tx,
            );
        }
    }

    /// Fires readiness once every announced guild and member request
    /// has been accounted for.
    async fn check_ready(&mut self) {
        if !self.stage().is_connected() {
            return;
        }

        if !self.chunker.poll_ready() {
            return;
        }

        // Replay the traffic held back during startup before telling
        // anyone we are ready.
        for (name, payload) in self.dispatcher.mark_ready() {
            let produced = self
                .dispatcher
                .dispatch(self.cache.as_ref(), &name, payload)
                .await;
            for event in produced {
                self.emit(event);
            }
        }

        self.fallback_deadline = None;
        let guild_count = self.chunker.known_guilds();
        info!("Ready with {} guilds.", guild_count);
        self.emit(Event::Ready { guild_count });
    }

    fn begin_handshake(&mut self) {
        if self.session.can_resume() {
            self.send_resume();
        } else {
            self.session.reset();
            self.send_identify();
        }
    }

    /// Replays the handshake once the invalid-session delay has passed.
    fn finish_rehandshake(&mut self) {
        let resumable = match self.rehandshake.take() {
            Some((_, resumable)) => resumable,
            None => return,
        };

        if resumable && self.session.can_resume() {
            self.send_resume();
        } else {
            self.session.reset();
            self.send_identify();
        }
    }

    fn send_identify(&mut self) {
        debug!("Identifying for a fresh session.");
        self.set_stage(ConnectionStage::Identifying);
        self.enqueue(
            GatewayFrame::identify(&self.config.token, self.config.intents, self.config.shard),
            true,
        );
    }

    fn send_resume(&mut self) {
        let (id, sequence) = match (self.session.id(), self.session.sequence()) {
            (Some(id), Some(sequence)) => (id.to_owned(), sequence),
            _ => return self.send_identify(),
        };

        debug!("Resuming session {} from sequence {}.", id, sequence);
        self.set_stage(ConnectionStage::Resuming);
        self.enqueue(GatewayFrame::resume(&self.config.token, &id, sequence), true);
    }

    /// Sends a scheduled beat, unless one is already unanswered.
    fn beat(&mut self) {
        let heartbeat = match self.heartbeat.as_mut() {
            Some(heartbeat) => heartbeat,
            None => return,
        };

        if heartbeat.fire() {
            let sequence = self.session.sequence();
            self.enqueue(GatewayFrame::heartbeat(sequence), true);
            self.emit(Event::Heartbeat { sequence });
        }
    }

    /// Abandons a socket whose beat went unanswered for a full
    /// interval. The schedule dies with the socket; the session
    /// survives for the resume that follows.
    fn on_missed_ack(&mut self) -> LoopOutcome {
        warn!("Heartbeat went unacknowledged for a full interval; recycling the connection.");
        self.heartbeat = None;
        LoopOutcome::Reconnect
    }

    fn send_chunk_batch(&mut self) {
        let guild_ids = self.chunker.take_batch();
        if guild_ids.is_empty() {
            return;
        }

        debug!("Requesting members for {} guilds.", guild_ids.len());
        self.enqueue(GatewayFrame::request_guild_members(&guild_ids), false);
    }

    fn enqueue(&mut self, frame: GatewayFrame, forced: bool) {
        if let Some(frame) = self.limiter.admit(frame, forced) {
            self.outbox.push_back(frame);
        }
    }

    fn release_deferred(&mut self) {
        for frame in self.limiter.on_reset() {
            self.outbox.push_back(frame);
        }
    }

    async fn flush_outbox(&mut self, ws: &mut WsStream) -> ws::Result<()> {
        while let Some(frame) = self.outbox.pop_front() {
            ws.send_frame(&frame).await?;
        }

        Ok(())
    }

    /// Decides what a socket failure means for the session.
    fn classify_ws_error(&mut self, error: &ws::Error) -> LoopOutcome {
        if let ws::Error::WsClosed(Some(frame)) = error {
            let raw = u16::from(frame.code);
            if let Some(code) = CloseCode::from_u16(raw) {
                warn!("Gateway closed the connection: {}.", code);

                if code.is_critical() {
                    return LoopOutcome::Critical(code);
                }

                if code.invalidates_session() {
                    self.session.reset();
                }

                return LoopOutcome::Reconnect;
            }

            debug!("Gateway closed with code {}: {:?}.", raw, frame.reason);
            return LoopOutcome::Reconnect;
        }

        debug!("Error sending/receiving ws {:?}.", error);
        LoopOutcome::Reconnect
    }

    fn teardown_for_reconnect(&mut self) {
        self.reconnects += 1;
        debug!("Tearing down socket (reconnect {}).", self.reconnects);
        self.set_stage(ConnectionStage::Disconnected);
        self.heartbeat = None;
        self.limiter.clear();
        self.outbox.clear();
        self.fallback_deadline = None;
        self.rehandshake = None;
    }

    /// Sleeps out the reconnect delay, watching for shutdown requests.
    /// Returns whether a shutdown arrived.
    async fn wait_or_close(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;

        loop {
            tokio::select! {
                () = time::sleep_until(deadline) => return false,
                msg = self.rx.recv_async() => match msg {
                    Ok(ShardMessage::Close { .. }) | Err(_) => return true,
                    // Sends without a socket have nowhere to go.
                    Ok(ShardMessage::Send(_)) => {},
                },
            }
        }
    }

    fn emit(&self, event: Event) {
        drop(self.events.send(event));
    }
}

async fn close_socket(ws: &mut WsStream, code: u16, reason: &'static str) {
    if let Err(e) = ws.close(code, reason).await {
        debug!("Failed to close the gateway socket: {:?}.", e);
    }
}

fn build_gateway_url(base: &str) -> Result<Url, Error> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .append_pair("v", &GATEWAY_VERSION.to_string())
        .append_pair("encoding", "json");

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::MemoryCache,
        constants::GATEWAY_SEND_LIMIT,
        id::{ChannelId, GuildId},
    };
    use serde_json::json;
    use std::collections::HashMap;
    use tokio_tungstenite::tungstenite::protocol::{
        frame::coding::CloseCode as WsCloseCode,
        CloseFrame,
    };

    fn test_runner() -> (ShardRunner, Receiver<Event>) {
        let (events_tx, events_rx) = flume::unbounded();
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let (_shard, runner) = ShardRunner::new(
            Config::new("Bot test"),
            events_tx,
            Arc::new(MemoryCache::new()),
            handlers,
            Arc::new(Negotiator::new()),
            None,
            Arc::new(RwLock::new(None)),
            Arc::new(RwLock::new(ConnectionStage::Disconnected)),
        );

        (runner, events_rx)
    }

    fn hello_frame(interval_ms: u64) -> GatewayFrame {
        GatewayFrame {
            op: Opcode::Hello,
            d: json!({ "heartbeat_interval": interval_ms }),
            s: None,
            t: None,
        }
    }

    fn dispatch(name: &str, sequence: u64, d: Value) -> GatewayFrame {
        GatewayFrame {
            op: Opcode::Dispatch,
            d,
            s: Some(sequence),
            t: Some(name.to_owned()),
        }
    }

    fn ready_payload(guilds: Value) -> Value {
        json!({
            "v": 6,
            "user": { "id": "42" },
            "session_id": "sess",
            "guilds": guilds,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn hello_starts_heartbeats_and_identifies() {
        let (mut runner, _events) = test_runner();

        runner.handle_frame(hello_frame(45_000)).await;

        assert!(runner.heartbeat.is_some());
        assert_eq!(runner.stage(), ConnectionStage::Identifying);
        let identify = runner.outbox.pop_front().expect("identify queued");
        assert_eq!(identify.op, Opcode::Identify);
        assert_eq!(identify.d["token"], "Bot test");
    }

    #[tokio::test(start_paused = true)]
    async fn hello_resumes_when_a_session_survives() {
        let (mut runner, _events) = test_runner();

        runner
            .handle_frame(dispatch("READY", 3, ready_payload(json!([]))))
            .await;
        runner.teardown_for_reconnect();

        runner.handle_frame(hello_frame(45_000)).await;

        assert_eq!(runner.stage(), ConnectionStage::Resuming);
        let resume = runner.outbox.pop_front().expect("resume queued");
        assert_eq!(resume.op, Opcode::Resume);
        assert_eq!(resume.d["session_id"], "sess");
        assert_eq!(resume.d["seq"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ready_completes_immediately() {
        let (mut runner, events) = test_runner();

        runner
            .handle_frame(dispatch("READY", 1, ready_payload(json!([]))))
            .await;

        assert!(runner.stage().is_connected());
        assert!(runner.session.can_resume());
        assert!(runner.fallback_deadline.is_none());
        let fired: Vec<Event> = events.drain().collect();
        assert!(matches!(fired.as_slice(), [Event::Ready { guild_count: 0 }]));
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_waits_for_announced_guilds() {
        let (mut runner, events) = test_runner();

        runner
            .handle_frame(dispatch(
                "READY",
                1,
                ready_payload(json!([{ "id": "100", "unavailable": true }])),
            ))
            .await;

        assert!(runner.fallback_deadline.is_some());
        assert_eq!(events.drain().count(), 0);

        runner
            .handle_frame(dispatch("GUILD_CREATE", 2, json!({ "id": "100" })))
            .await;

        let fired: Vec<Event> = events.drain().collect();
        assert!(matches!(fired.as_slice(), [Event::Ready { guild_count: 1 }]));
        assert!(runner.fallback_deadline.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_restores_the_connected_stage() {
        let (mut runner, events) = test_runner();

        runner
            .handle_frame(dispatch("READY", 3, ready_payload(json!([]))))
            .await;
        runner.teardown_for_reconnect();
        assert_eq!(runner.reconnects, 1);
        runner.handle_frame(hello_frame(45_000)).await;

        runner
            .handle_frame(dispatch("RESUMED", 4, json!({})))
            .await;

        assert!(runner.stage().is_connected());
        assert_eq!(runner.reconnects, 0);
        let fired: Vec<Event> = events.drain().collect();
        assert!(matches!(fired.last(), Some(Event::Reconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_op_recycles_the_connection() {
        let (mut runner, _events) = test_runner();

        let action = runner
            .handle_frame(GatewayFrame {
                op: Opcode::Reconnect,
                d: Value::Null,
                s: None,
                t: None,
            })
            .await;

        assert!(matches!(action, FrameAction::Reconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn unresumable_invalid_session_forces_identify() {
        let (mut runner, _events) = test_runner();
        runner
            .handle_frame(dispatch("READY", 5, ready_payload(json!([]))))
            .await;
        assert!(runner.session.can_resume());

        runner
            .handle_frame(GatewayFrame {
                op: Opcode::InvalidSession,
                d: json!(false),
                s: None,
                t: None,
            })
            .await;

        // Nothing is queued until the imposed delay runs out.
        assert!(runner.outbox.is_empty());
        let (at, resumable) = runner.rehandshake.expect("re-handshake scheduled");
        assert_eq!(at - Instant::now(), INVALID_SESSION_DELAY);
        assert!(!resumable);

        runner.finish_rehandshake();
        assert!(!runner.session.can_resume());
        assert_eq!(runner.stage(), ConnectionStage::Identifying);
        assert_eq!(runner.outbox.back().expect("handshake queued").op, Opcode::Identify);
    }

    #[tokio::test(start_paused = true)]
    async fn resumable_invalid_session_retries_the_resume() {
        let (mut runner, _events) = test_runner();
        runner
            .handle_frame(dispatch("READY", 5, ready_payload(json!([]))))
            .await;

        runner
            .handle_frame(GatewayFrame {
                op: Opcode::InvalidSession,
                d: json!(true),
                s: None,
                t: None,
            })
            .await;

        assert!(runner.outbox.is_empty());
        runner.finish_rehandshake();

        assert!(runner.session.can_resume());
        assert_eq!(runner.stage(), ConnectionStage::Resuming);
        assert_eq!(runner.outbox.back().expect("handshake queued").op, Opcode::Resume);
    }

    #[tokio::test(start_paused = true)]
    async fn socket_loss_cancels_a_scheduled_rehandshake() {
        let (mut runner, _events) = test_runner();

        runner
            .handle_frame(GatewayFrame {
                op: Opcode::InvalidSession,
                d: json!(false),
                s: None,
                t: None,
            })
            .await;
        assert!(runner.rehandshake.is_some());

        runner.teardown_for_reconnect();
        assert!(runner.rehandshake.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn server_heartbeat_requests_jump_the_queue() {
        let (mut runner, events) = test_runner();
        runner
            .handle_frame(dispatch("READY", 9, ready_payload(json!([]))))
            .await;
        let _ = events.drain().count();

        runner
            .handle_frame(GatewayFrame {
                op: Opcode::Heartbeat,
                d: Value::Null,
                s: None,
                t: None,
            })
            .await;

        let beat = runner.outbox.back().expect("beat queued");
        assert_eq!(beat.op, Opcode::Heartbeat);
        assert_eq!(beat.d, json!(9));
        let fired: Vec<Event> = events.drain().collect();
        assert!(matches!(
            fired.as_slice(),
            [Event::Heartbeat { sequence: Some(9) }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_acks_record_latency() {
        let (mut runner, events) = test_runner();
        runner.handle_frame(hello_frame(45_000)).await;

        runner.beat();
        time::advance(Duration::from_millis(250)).await;
        runner
            .handle_frame(GatewayFrame {
                op: Opcode::HeartbeatAck,
                d: Value::Null,
                s: None,
                t: None,
            })
            .await;

        assert_eq!(*runner.latency.read(), Some(Duration::from_millis(250)));
        let fired: Vec<Event> = events.drain().collect();
        assert!(matches!(
            fired.last(),
            Some(Event::HeartbeatAck { latency }) if *latency == Duration::from_millis(250)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_acks_recycle_the_socket_within_one_interval() {
        let (mut runner, _events) = test_runner();
        runner.handle_frame(hello_frame(45_000)).await;
        runner
            .handle_frame(dispatch("READY", 1, ready_payload(json!([]))))
            .await;

        runner.beat();
        let deadline = runner
            .heartbeat
            .as_ref()
            .and_then(Heartbeat::ack_deadline)
            .expect("beat in flight");
        assert_eq!(deadline - Instant::now(), Duration::from_millis(45_000));

        time::advance(Duration::from_millis(45_000)).await;
        assert!(Instant::now() >= deadline);

        assert!(matches!(runner.on_missed_ack(), LoopOutcome::Reconnect));
        assert!(runner.heartbeat.is_none());
        assert!(runner.session.can_resume());
    }

    #[tokio::test(start_paused = true)]
    async fn voice_dispatch_pair_completes_a_join() {
        let (mut runner, _events) = test_runner();
        runner
            .handle_frame(dispatch("READY", 1, ready_payload(json!([]))))
            .await;

        let rx = runner.negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        runner
            .handle_frame(dispatch(
                "VOICE_STATE_UPDATE",
                2,
                json!({
                    "guild_id": "1",
                    "channel_id": "2",
                    "user_id": "42",
                    "session_id": "vsess",
                }),
            ))
            .await;
        runner
            .handle_frame(dispatch(
                "VOICE_SERVER_UPDATE",
                3,
                json!({
                    "guild_id": "1",
                    "token": "tok",
                    "endpoint": "eu-west42",
                }),
            ))
            .await;

        let credentials = rx.recv_async().await.unwrap().unwrap();
        assert_eq!(credentials.endpoint, "eu-west42");
        assert_eq!(credentials.session_id, "vsess");
        assert_eq!(credentials.channel_id, ChannelId(2));
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_voice_states_are_ignored() {
        let (mut runner, _events) = test_runner();
        runner
            .handle_frame(dispatch("READY", 1, ready_payload(json!([]))))
            .await;

        let rx = runner.negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        runner
            .handle_frame(dispatch(
                "VOICE_STATE_UPDATE",
                2,
                json!({
                    "guild_id": "1",
                    "channel_id": "2",
                    "user_id": "999",
                    "session_id": "other",
                }),
            ))
            .await;
        runner
            .handle_frame(dispatch(
                "VOICE_SERVER_UPDATE",
                3,
                json!({ "guild_id": "1", "token": "tok", "endpoint": "eu" }),
            ))
            .await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn session_scrubbing_close_codes_force_identify() {
        let (mut runner, _events) = test_runner();
        runner
            .handle_frame(dispatch("READY", 1, ready_payload(json!([]))))
            .await;
        assert!(runner.session.can_resume());

        let outcome = runner.classify_ws_error(&ws::Error::WsClosed(Some(CloseFrame {
            code: WsCloseCode::from(4009),
            reason: "".into(),
        })));

        assert!(matches!(outcome, LoopOutcome::Reconnect));
        assert!(!runner.session.can_resume());
    }

    #[tokio::test(start_paused = true)]
    async fn critical_close_codes_stop_the_runner() {
        let (mut runner, _events) = test_runner();

        let outcome = runner.classify_ws_error(&ws::Error::WsClosed(Some(CloseFrame {
            code: WsCloseCode::from(4004),
            reason: "".into(),
        })));

        assert!(matches!(
            outcome,
            LoopOutcome::Critical(CloseCode::AuthenticationFailed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ordinary_socket_errors_keep_the_session() {
        let (mut runner, _events) = test_runner();
        runner
            .handle_frame(dispatch("READY", 1, ready_payload(json!([]))))
            .await;

        let outcome = runner.classify_ws_error(&ws::Error::WsClosed(None));

        assert!(matches!(outcome, LoopOutcome::Reconnect));
        assert!(runner.session.can_resume());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_traffic_defers_until_the_window_resets() {
        let (mut runner, _events) = test_runner();

        for _ in 0..120 {
            runner.enqueue(
                GatewayFrame::presence_update(json!({ "status": "online" })),
                false,
            );
        }
        assert_eq!(runner.outbox.len(), GATEWAY_SEND_LIMIT);

        runner.release_deferred();
        assert_eq!(runner.outbox.len(), 120);
    }

    #[test]
    fn gateway_urls_carry_version_and_encoding() {
        let url = build_gateway_url("wss://gateway.discord.gg").unwrap();
        assert_eq!(url.as_str(), "wss://gateway.discord.gg/?v=6&encoding=json");

        assert!(matches!(
            build_gateway_url("not a url"),
            Err(Error::InvalidGatewayUrl(_))
        ));
    }
}
