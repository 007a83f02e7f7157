use crate::intents::Intents;
use std::{fmt, time::Duration};

/// Configuration for a gateway [`Client`].
///
/// [`Client`]: crate::Client
#[derive(Clone)]
#[non_exhaustive]
pub struct Config {
    /// Bot token used to identify to the gateway.
    ///
    /// Sent verbatim in the identify payload and as the `Authorization`
    /// header of REST calls.
    pub token: String,
    /// Event groups to subscribe to.
    ///
    /// Defaults to `None`, leaving the subscription decision to the
    /// server.
    pub intents: Option<Intents>,
    /// Shard coordinates as `(shard_id, shard_count)`.
    ///
    /// Defaults to `None`, identifying as an unsharded client.
    pub shard: Option<(u64, u64)>,
    /// Whether member lists of large guilds are requested in the
    /// background after connecting.
    ///
    /// Defaults to `true`.
    pub chunk_guilds: bool,
    /// Gateway URL override.
    ///
    /// When unset, the URL is fetched from the REST API on connect.
    pub gateway_url: Option<String>,
    /// Minimum number of session starts that must remain available
    /// before this client consumes one.
    ///
    /// When the advertised remainder sits at or below this value, the
    /// client sleeps out the reset window instead of identifying.
    /// Defaults to `0`.
    pub session_start_threshold: u64,
    /// Time allowed for a voice channel join to complete before the
    /// returned future resolves with a timeout.
    ///
    /// Defaults to 10 seconds. If set to `None`, joins will never time
    /// out.
    pub join_timeout: Option<Duration>,
}

impl Config {
    /// Creates a configuration for the given bot token, with defaults
    /// for every other option.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            intents: None,
            shard: None,
            chunk_guilds: true,
            gateway_url: None,
            session_start_threshold: 0,
            join_timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Sets this `Config`'s intent subscription.
    #[must_use]
    pub fn intents(mut self, intents: Intents) -> Self {
        self.intents = Some(intents);
        self
    }

    /// Sets this `Config`'s shard coordinates.
    #[must_use]
    pub fn shard(mut self, shard_id: u64, shard_count: u64) -> Self {
        self.shard = Some((shard_id, shard_count));
        self
    }

    /// Sets whether large guilds have their member lists requested in
    /// the background.
    #[must_use]
    pub fn chunk_guilds(mut self, chunk_guilds: bool) -> Self {
        self.chunk_guilds = chunk_guilds;
        self
    }

    /// Sets a fixed gateway URL, skipping the REST lookup on connect.
    #[must_use]
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    /// Sets the session start headroom kept in reserve.
    #[must_use]
    pub fn session_start_threshold(mut self, threshold: u64) -> Self {
        self.session_start_threshold = threshold;
        self
    }

    /// Sets this `Config`'s timeout for joining a voice channel.
    #[must_use]
    pub fn join_timeout(mut self, join_timeout: Option<Duration>) -> Self {
        self.join_timeout = join_timeout;
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token", &"<secret>")
            .field("intents", &self.intents)
            .field("shard", &self.shard)
            .field("chunk_guilds", &self.chunk_guilds)
            .field("gateway_url", &self.gateway_url)
            .field("session_start_threshold", &self.session_start_threshold)
            .field("join_timeout", &self.join_timeout)
            .finish()
    }
}
