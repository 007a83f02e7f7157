//! Constants affecting gateway function and API handling.

use std::time::Duration;

/// The gateway protocol version requested by the library.
pub const GATEWAY_VERSION: u8 = 6;

/// Base URL of the REST API, used for the one-shot gateway bootstrap query.
pub const API_BASE_URL: &str = "https://discord.com/api/v6";

/// Gateway endpoint used when the bootstrap query fails or is skipped.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Hard server-side cap on payloads sent per rate-limit window.
///
/// Connections exceeding this are closed with a rate-limit code.
pub const GATEWAY_SEND_HARD_LIMIT: usize = 120;

/// Payloads the library allows itself per window.
///
/// Held below [`GATEWAY_SEND_HARD_LIMIT`] so that heartbeats and handshake
/// frames always have room.
pub const GATEWAY_SEND_LIMIT: usize = 115;

/// Length of the gateway's payload rate-limit window.
pub const GATEWAY_SEND_WINDOW: Duration = Duration::from_secs(60);

/// Delay applied before reconnecting after a recoverable connection loss.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Pause mandated by the protocol before answering an invalid-session frame.
pub const INVALID_SESSION_DELAY: Duration = Duration::from_secs(2);

/// Time allowed for unavailable guilds to become available during startup
/// before readiness bookkeeping abandons them.
pub const UNAVAILABLE_GUILD_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between checks for guilds awaiting a member request cycle.
pub const CHUNK_CYCLE_INTERVAL: Duration = Duration::from_secs(5);

/// Spacing between member request batches within one cycle.
pub const CHUNK_BATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum guild ids carried by a single member request.
pub const CHUNK_BATCH_SIZE: usize = 50;

/// Member count past which the gateway stops sending offline members,
/// making a guild "large".
pub const LARGE_THRESHOLD: u64 = 250;

/// Wire channel kind denoting a guild voice channel.
pub const CHANNEL_KIND_VOICE: u8 = 2;

/// Close code sent when abandoning a socket whose session should survive.
///
/// Closing with a normal (1000/1001) code tells the gateway to discard the
/// session, so resumable teardowns use a code from the private range.
pub(crate) const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Close code for an operator-requested shutdown.
pub(crate) const SHUTDOWN_CLOSE_CODE: u16 = 1000;
