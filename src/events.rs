//! Lifecycle events fired by the client, and the handler trait used to
//! observe them.

use crate::{
    error::Error,
    id::{ChannelId, GuildId},
};
use async_trait::async_trait;
use flume::Receiver;
use parking_lot::RwLock;
use serde_json::Value;
use std::{sync::Arc, time::Duration};

/// An event fired on the client's lifecycle or by inbound dispatches.
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// The session finished connecting and every reachable guild has
    /// been accounted for.
    Ready {
        /// Number of guilds known at the time readiness fired.
        guild_count: usize,
    },
    /// A dropped session was resumed without replaying the handshake.
    Reconnected,
    /// A heartbeat was sent to the gateway.
    Heartbeat {
        /// Sequence number carried by the heartbeat.
        sequence: Option<u64>,
    },
    /// The gateway acknowledged a heartbeat.
    HeartbeatAck {
        /// Round trip time between the heartbeat and its ack.
        latency: Duration,
    },
    /// The connection failed in a way the client will not retry.
    GatewayError(Error),
    /// The connection was shut down on request.
    Closed,
    /// A dispatch was processed by its registered handler.
    Dispatch {
        /// Dispatch name the handler was registered under.
        name: String,
        /// Event payload produced by the handler.
        event: Value,
        /// Prior state the handler reported as replaced, if any.
        previous: Option<Value>,
    },
    /// A handled message dispatch mentioned the bot's own user.
    Mention {
        /// Channel the message was sent in.
        channel_id: ChannelId,
        /// Guild the message was sent in, absent for DMs.
        guild_id: Option<GuildId>,
    },
}

/// User-supplied hook observing [`Event`]s.
///
/// Handlers run sequentially on the event fan-out task, so they should
/// hand heavy work off to their own tasks.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Respond to one event.
    async fn act(&self, event: &Event);
}

pub(crate) async fn runner(
    rx: Receiver<Event>,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
) {
    while let Ok(event) = rx.recv_async().await {
        // Clone the list out of the lock so handlers can await freely.
        let current: Vec<_> = handlers.read().clone();

        for handler in current {
            handler.act(&event).await;
        }
    }
}
