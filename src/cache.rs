use crate::{
    id::{ChannelId, GuildId},
    model::{Channel, Guild},
};
use dashmap::DashMap;

/// Storage backing the client's view of guilds and channels.
///
/// The client keeps this view current from gateway traffic. Lookups
/// hand out clones so that callers never hold a lock across their own
/// work.
pub trait Cache: Send + Sync {
    /// Stores a guild, replacing any previous entry with the same ID.
    fn put_guild(&self, guild: Guild);

    /// Fetches a guild by ID.
    fn guild(&self, id: GuildId) -> Option<Guild>;

    /// Stores a channel, replacing any previous entry with the same ID.
    fn put_channel(&self, channel: Channel);

    /// Fetches a channel by ID.
    fn channel(&self, id: ChannelId) -> Option<Channel>;

    /// Drops a guild, returning whether it was present.
    fn remove_guild(&self, id: GuildId) -> bool;
}

/// In-process [`Cache`] held in concurrent hash maps.
#[derive(Debug, Default)]
pub struct MemoryCache {
    guilds: DashMap<GuildId, Guild>,
    channels: DashMap<ChannelId, Channel>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of guilds currently cached.
    #[must_use]
    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }
}

impl Cache for MemoryCache {
    fn put_guild(&self, guild: Guild) {
        self.guilds.insert(guild.id, guild);
    }

    fn guild(&self, id: GuildId) -> Option<Guild> {
        self.guilds.get(&id).map(|g| g.clone())
    }

    fn put_channel(&self, channel: Channel) {
        self.channels.insert(channel.id, channel);
    }

    fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.get(&id).map(|c| c.clone())
    }

    fn remove_guild(&self, id: GuildId) -> bool {
        self.guilds.remove(&id).is_some()
    }
}
