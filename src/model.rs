//! Wire models for gateway payloads.
//!
//! These are deliberately partial views of Discord's objects. Only the
//! fields the client actually routes on are decoded; everything else is
//! carried through untouched as raw JSON for [`DispatchHandler`]s.
//!
//! [`DispatchHandler`]: crate::dispatch::DispatchHandler

use crate::{
    constants::CHANNEL_KIND_VOICE,
    id::{ChannelId, GuildId, UserId},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Payload of the gateway's first frame on any new socket.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Hello {
    /// Heartbeat period assigned by the gateway, in milliseconds.
    pub heartbeat_interval: u64,
}

/// Payload of the `READY` dispatch, acknowledging an identify.
#[derive(Clone, Debug, Deserialize)]
pub struct Ready {
    /// Gateway protocol version the server settled on.
    #[serde(default)]
    pub v: Option<u8>,
    /// The bot's own user.
    pub user: User,
    /// Session token used to resume this session after a drop.
    pub session_id: String,
    /// Guilds the bot belongs to, all initially unavailable.
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

/// Stub guild reference sent in `READY` and in outage `GUILD_DELETE`s.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct UnavailableGuild {
    /// ID of the guild.
    pub id: GuildId,
    /// Whether the guild is merely unavailable (as opposed to left).
    #[serde(default)]
    pub unavailable: bool,
}

/// A guild as delivered by `GUILD_CREATE`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Guild {
    /// ID of the guild.
    pub id: GuildId,
    /// Guild name.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the guild is currently unavailable due to an outage.
    #[serde(default)]
    pub unavailable: bool,
    /// Whether the member list was truncated for being over the
    /// identify threshold.
    #[serde(default)]
    pub large: bool,
    /// Total member count, if the gateway provided one.
    #[serde(default)]
    pub member_count: Option<u64>,
    /// Members included inline. Truncated for large guilds.
    #[serde(default)]
    pub members: Vec<Member>,
    /// Channels of the guild.
    #[serde(default)]
    pub channels: Vec<Channel>,
    /// Voice states of members currently in voice channels.
    #[serde(default)]
    pub voice_states: Vec<VoiceState>,
}

/// A guild channel.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Channel {
    /// ID of the channel.
    pub id: ChannelId,
    /// Numeric channel kind.
    #[serde(default, rename = "type")]
    pub kind: u8,
    /// Guild the channel belongs to. Absent inside `GUILD_CREATE`,
    /// where the parent guild is implied.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Channel name.
    #[serde(default)]
    pub name: Option<String>,
}

impl Channel {
    /// Whether this channel can host a voice connection.
    #[must_use]
    pub fn is_voice(&self) -> bool {
        self.kind == CHANNEL_KIND_VOICE
    }
}

/// A guild member.
#[derive(Clone, Debug, Deserialize)]
pub struct Member {
    /// The user behind this membership.
    pub user: User,
    /// Per-guild nickname, if set.
    #[serde(default)]
    pub nick: Option<String>,
}

/// A user.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct User {
    /// ID of the user.
    pub id: UserId,
    /// Username, if included in the payload.
    #[serde(default)]
    pub username: Option<String>,
    /// Whether the user is a bot.
    #[serde(default)]
    pub bot: bool,
}

/// Payload of `GUILD_MEMBERS_CHUNK`, answering a member request.
#[derive(Clone, Debug, Deserialize)]
pub struct GuildMembersChunk {
    /// Guild the chunk belongs to.
    pub guild_id: GuildId,
    /// Members in this chunk.
    #[serde(default)]
    pub members: Vec<Member>,
}

/// The slice of `MESSAGE_CREATE` needed for mention detection.
#[derive(Clone, Debug, Deserialize)]
pub struct Message {
    /// Channel the message was sent in.
    pub channel_id: ChannelId,
    /// Guild the message was sent in, absent for DMs.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Author of the message.
    #[serde(default)]
    pub author: Option<User>,
    /// Users mentioned by the message.
    #[serde(default)]
    pub mentions: Vec<User>,
    /// Text content.
    #[serde(default)]
    pub content: Option<String>,
}

/// A user's voice connection state within a guild.
#[derive(Clone, Debug, Deserialize)]
pub struct VoiceState {
    /// Guild this state applies to.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Voice channel the user occupies, `None` once disconnected.
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    /// User the state belongs to.
    pub user_id: UserId,
    /// Voice session token for this user.
    pub session_id: String,
}

/// Payload of `VOICE_SERVER_UPDATE`, granting access to a voice server.
#[derive(Clone, Deserialize)]
pub struct VoiceServerUpdate {
    /// Guild the voice server was allocated for.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Token used to authenticate against the voice server.
    pub token: String,
    /// Hostname of the allocated voice server. May be absent while the
    /// server is still being assigned.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl fmt::Debug for VoiceServerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceServerUpdate")
            .field("guild_id", &self.guild_id)
            .field("token", &"<secret>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Presence payload sent via [`Client::update_presence`].
///
/// [`Client::update_presence`]: crate::Client::update_presence
#[derive(Clone, Debug, Serialize)]
pub struct Presence {
    /// Status string, e.g. `"online"`, `"idle"`, or `"dnd"`.
    pub status: String,
    /// Whether the client should be shown as AFK.
    pub afk: bool,
    /// Unix time (ms) the client went idle, if it did.
    pub since: Option<u64>,
    /// Activity object, passed through verbatim.
    pub game: Option<Value>,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            status: "online".into(),
            afk: false,
            since: None,
            game: None,
        }
    }
}
