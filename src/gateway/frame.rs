//! Wire-level framing for the gateway socket.

use crate::{
    constants::LARGE_THRESHOLD,
    id::{ChannelId, GuildId},
    intents::Intents,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;

/// Gateway operation codes.
///
/// Every frame on the socket carries one of these in its `op` field.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    /// Server-sent event carrying a named payload.
    Dispatch = 0,
    /// Keepalive, sent by either side.
    Heartbeat = 1,
    /// Client handshake opening a fresh session.
    Identify = 2,
    /// Client presence change.
    PresenceUpdate = 3,
    /// Client request to move between voice channels.
    VoiceStateUpdate = 4,
    /// Client handshake continuing an interrupted session.
    Resume = 6,
    /// Server request that the client tear down and reconnect.
    Reconnect = 7,
    /// Client request for the member lists of one or more guilds.
    RequestGuildMembers = 8,
    /// Server notice that the presented session cannot be used.
    InvalidSession = 9,
    /// First server frame on a fresh socket.
    Hello = 10,
    /// Server acknowledgement of a client heartbeat.
    HeartbeatAck = 11,
}

impl Opcode {
    /// Creates an `Opcode` from a raw integer value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Returns the raw integer value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the name of this op code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::PresenceUpdate => "PresenceUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestGuildMembers => "RequestGuildMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }
}

impl Serialize for Opcode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Opcode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid op code: {value}")))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// A single frame on the gateway socket.
///
/// `s` and `t` are only populated on server dispatches; client frames omit
/// them on the wire.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GatewayFrame {
    /// Operation code.
    pub op: Opcode,
    /// Payload data.
    #[serde(default)]
    pub d: Value,
    /// Sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Dispatch event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    fn op_only(op: Opcode, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }

    /// Builds a keepalive carrying the last seen sequence number.
    #[must_use]
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::op_only(Opcode::Heartbeat, sequence.map_or(Value::Null, Value::from))
    }

    /// Builds the identify handshake opening a fresh session.
    #[must_use]
    pub fn identify(token: &str, intents: Option<Intents>, shard: Option<(u64, u64)>) -> Self {
        let mut d = json!({
            "token": token,
            "properties": {
                "$os": std::env::consts::OS,
                "$browser": "skylark",
                "$device": "skylark",
            },
            "compress": false,
            "large_threshold": LARGE_THRESHOLD,
        });

        if let Some(intents) = intents {
            d["intents"] = Value::from(intents.bits());
        }

        if let Some((index, count)) = shard {
            d["shard"] = json!([index, count]);
        }

        Self::op_only(Opcode::Identify, d)
    }

    /// Builds the resume handshake continuing an interrupted session.
    #[must_use]
    pub fn resume(token: &str, session_id: &str, sequence: u64) -> Self {
        Self::op_only(
            Opcode::Resume,
            json!({
                "token": token,
                "session_id": session_id,
                "seq": sequence,
            }),
        )
    }

    /// Builds a voice state update moving the client into a channel, or out
    /// of voice entirely when `channel_id` is `None`.
    #[must_use]
    pub fn voice_state_update(
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Self {
        Self::op_only(
            Opcode::VoiceStateUpdate,
            json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        )
    }

    /// Builds a member request for a batch of guilds.
    #[must_use]
    pub fn request_guild_members(guild_ids: &[GuildId]) -> Self {
        Self::op_only(
            Opcode::RequestGuildMembers,
            json!({
                "guild_id": guild_ids,
                "query": "",
                "limit": 0,
            }),
        )
    }

    /// Builds a presence update.
    #[must_use]
    pub fn presence_update(presence: Value) -> Self {
        Self::op_only(Opcode::PresenceUpdate, presence)
    }
}

/// Close codes the gateway attaches when ending a connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u16)]
pub enum CloseCode {
    /// Unknown error on the server's side.
    UnknownError = 4000,
    /// The client sent an invalid op code.
    UnknownOpcode = 4001,
    /// The client sent a payload the server could not decode.
    DecodeError = 4002,
    /// The client sent a payload before identifying.
    NotAuthenticated = 4003,
    /// The token presented during identification was rejected.
    AuthenticationFailed = 4004,
    /// The client identified twice on one connection.
    AlreadyAuthenticated = 4005,
    /// The sequence sent with a resume was invalid.
    InvalidSequence = 4007,
    /// The client sent payloads too quickly.
    RateLimited = 4008,
    /// The session has been held open too long without a valid heartbeat.
    SessionTimeout = 4009,
    /// An invalid shard tuple was sent during identification.
    InvalidShard = 4010,
    /// The account is in too many guilds for a single connection.
    ShardingRequired = 4011,
    /// The requested gateway version is unsupported.
    InvalidApiVersion = 4012,
}

impl CloseCode {
    /// Creates a `CloseCode` from a raw u16 value.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimeout),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            _ => None,
        }
    }

    /// Returns the raw u16 value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether reconnecting after this close can never succeed.
    ///
    /// A critical close is surfaced to the consumer instead of retried; the
    /// token, shard layout, or traffic pattern must change first.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::RateLimited
                | Self::InvalidShard
                | Self::ShardingRequired
        )
    }

    /// Whether the session this connection carried is discarded by the
    /// close, forcing the next handshake to identify from scratch.
    #[must_use]
    pub const fn invalidates_session(self) -> bool {
        matches!(self, Self::InvalidSequence | Self::SessionTimeout)
    }

    /// Returns a human-readable description of this close code.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "unknown error",
            Self::UnknownOpcode => "unknown op code",
            Self::DecodeError => "payload decode error",
            Self::NotAuthenticated => "not authenticated",
            Self::AuthenticationFailed => "authentication failed",
            Self::AlreadyAuthenticated => "already authenticated",
            Self::InvalidSequence => "invalid resume sequence",
            Self::RateLimited => "rate limited",
            Self::SessionTimeout => "session timed out",
            Self::InvalidShard => "invalid shard",
            Self::ShardingRequired => "sharding required",
            Self::InvalidApiVersion => "invalid API version",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}
