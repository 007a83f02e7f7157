use crate::{
    cache::{Cache, MemoryCache},
    config::Config,
    dispatch::{DispatchHandler, HandlerMap},
    error::{Error, JoinError, JoinResult},
    events::{self, EventHandler},
    gateway::{ConnectionStage, GatewayFrame, Shard, ShardRunner},
    id::{ChannelId, GuildId},
    join::Join,
    model::Presence,
    voice::{Negotiator, VoiceBackend},
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

/// The gateway client: owns the connection task and maps guild state
/// into voice negotiations.
///
/// A client is built from a [`Config`], optionally given a [`Cache`]
/// and a [`VoiceBackend`], and then [connected]. One client drives one
/// gateway connection; once [closed], a client is spent and a fresh
/// one must be built to reconnect.
///
/// [connected]: Client::connect
/// [closed]: Client::close
pub struct Client {
    config: Config,
    cache: Arc<dyn Cache>,
    handlers: HandlerMap,
    event_handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    negotiator: Arc<Negotiator>,
    backend: Option<Arc<dyn VoiceBackend>>,
    shard: OnceCell<Shard>,
    latency: Arc<RwLock<Option<Duration>>>,
    stage: Arc<RwLock<ConnectionStage>>,
}

impl Client {
    /// Creates a client from the given configuration, backed by a
    /// fresh [`MemoryCache`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cache: Arc::new(MemoryCache::new()),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_handlers: Arc::new(RwLock::new(Vec::new())),
            negotiator: Arc::new(Negotiator::new()),
            backend: None,
            shard: OnceCell::new(),
            latency: Arc::new(RwLock::new(None)),
            stage: Arc::new(RwLock::new(ConnectionStage::Disconnected)),
        }
    }

    /// Replaces the entity cache backing this client.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the media transport handed completed voice negotiations.
    ///
    /// Without a backend, [`join`] still performs the full gateway
    /// negotiation and resolves with the gathered credentials.
    ///
    /// [`join`]: Client::join
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn VoiceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Registers a handler for a named dispatch.
    ///
    /// Handlers may be registered at any time, including after
    /// [`connect`]; dispatches with no registered handler are ignored.
    /// Registering a second handler under the same name replaces the
    /// first.
    ///
    /// [`connect`]: Client::connect
    pub fn register_handler<N>(&self, name: N, handler: Arc<dyn DispatchHandler>)
    where
        N: Into<String>,
    {
        self.handlers.write().insert(name.into(), handler);
    }

    /// Subscribes a handler to the client's emitted [`Event`]s.
    ///
    /// [`Event`]: crate::events::Event
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_handlers.write().push(handler);
    }

    /// Spawns the connection task.
    ///
    /// Returns immediately; the handshake proceeds in the background
    /// and completion is observable as [`Event::Ready`]. Must be
    /// called within the context of a tokio runtime.
    ///
    /// [`Event::Ready`]: crate::events::Event::Ready
    pub fn connect(&self) -> Result<(), Error> {
        let (events_tx, events_rx) = flume::unbounded();
        let (shard, runner) = ShardRunner::new(
            self.config.clone(),
            events_tx,
            Arc::clone(&self.cache),
            Arc::clone(&self.handlers),
            Arc::clone(&self.negotiator),
            self.backend.clone(),
            Arc::clone(&self.latency),
            Arc::clone(&self.stage),
        );

        self.shard
            .set(shard)
            .map_err(|_| Error::AlreadyConnected)?;

        tokio::spawn(events::runner(
            events_rx,
            Arc::clone(&self.event_handlers),
        ));
        tokio::spawn(runner.run());

        Ok(())
    }

    /// Shuts the connection down.
    ///
    /// A graceful close tells the gateway to discard the session; a
    /// non-graceful one abandons the socket as a crash would. Safe to
    /// call at any time and any number of times; [`Event::Closed`] is
    /// emitted at most once.
    ///
    /// [`Event::Closed`]: crate::events::Event::Closed
    pub fn close(&self, graceful: bool) {
        if let Some(shard) = self.shard.get() {
            drop(shard.close(graceful));
        }
    }

    /// Joins a voice channel, negotiating credentials over the gateway.
    ///
    /// The returned [`Join`] future resolves once the gateway has
    /// answered with both halves of the voice handshake and any
    /// configured [`VoiceBackend`] has accepted them, subject to
    /// [`Config::join_timeout`].
    ///
    /// The channel must be known to the cache as a voice channel of
    /// the given guild, and the guild must not already hold a voice
    /// session.
    #[inline]
    pub fn join<C, G>(&self, guild_id: G, channel_id: C) -> JoinResult<Join>
    where
        C: Into<ChannelId>,
        G: Into<GuildId>,
    {
        self._join(guild_id.into(), channel_id.into())
    }

    fn _join(&self, guild_id: GuildId, channel_id: ChannelId) -> JoinResult<Join> {
        check_join_target(self.cache.as_ref(), guild_id, channel_id)?;

        let shard = self.shard.get().ok_or(JoinError::NotConnected)?;
        let rx = self.negotiator.begin(guild_id, channel_id)?;

        let update = GatewayFrame::voice_state_update(guild_id, Some(channel_id), false, false);
        if shard.send(update).is_err() {
            self.negotiator.drop_guild(guild_id);
            return Err(JoinError::NotConnected);
        }

        Ok(Join::new(rx.into_recv_async(), self.config.join_timeout))
    }

    /// Leaves the guild's voice channel, if any.
    ///
    /// Cancels a negotiation still in flight (its [`Join`] future
    /// resolves to [`JoinError::Dropped`]) and tells any configured
    /// backend to disconnect. An `Err` means the gateway could not be
    /// told and leaving should be retried once reconnected.
    #[inline]
    pub fn leave<G: Into<GuildId>>(&self, guild_id: G) -> JoinResult<()> {
        self._leave(guild_id.into())
    }

    fn _leave(&self, guild_id: GuildId) -> JoinResult<()> {
        let shard = self.shard.get().ok_or(JoinError::NotConnected)?;

        if self.negotiator.drop_guild(guild_id).is_some() {
            if let Some(backend) = self.backend.clone() {
                tokio::spawn(async move { backend.disconnect(guild_id).await });
            }
        }

        let update = GatewayFrame::voice_state_update(guild_id, None, false, false);
        shard.send(update).map_err(|_| JoinError::NotConnected)
    }

    /// Publishes a new presence for the session.
    pub fn update_presence(&self, presence: &Presence) -> Result<(), Error> {
        let shard = self.shard.get().ok_or(Error::NotConnected)?;
        let payload = serde_json::to_value(presence)?;

        shard.send(GatewayFrame::presence_update(payload))
    }

    /// Most recently measured heartbeat round-trip time.
    pub fn latency(&self) -> Option<Duration> {
        *self.latency.read()
    }

    /// Current stage of the gateway connection.
    pub fn stage(&self) -> ConnectionStage {
        *self.stage.read()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("stage", &self.stage())
            .field("connected", &self.shard.get().is_some())
            .finish()
    }
}

fn check_join_target(
    cache: &dyn Cache,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> JoinResult<()> {
    let channel = match cache.channel(channel_id) {
        Some(channel) => channel,
        None => return Err(JoinError::NotVoice),
    };

    if !channel.is_voice() || channel.guild_id != Some(guild_id) {
        return Err(JoinError::NotVoice);
    }

    Ok(())
}
