#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Skylark is an async client for Discord-style real-time event gateways,
//! written in Rust. The library offers:
//!  * A persistent gateway connection with automatic heartbeating, session
//!  resumption after recoverable drops, and outbound payload rate limiting.
//!  * Startup coordination: guild availability tracking, batched member
//!  requests for large guilds, and a single `Ready` signal once the world
//!  is assembled, with earlier traffic held back and replayed in order.
//!  * Dispatch routing of named business events to registered handlers,
//!  isolated from the connection machinery.
//!  * Voice channel negotiation, correlating the two gateway events that
//!  carry a voice session's credentials and handing them to any media
//!  transport implementing [`VoiceBackend`].
//!
//! The engine is deliberately thin on domain semantics: payloads stay
//! [`serde_json::Value`] except where the engine itself must read them, and
//! entity storage lives behind the [`Cache`] trait with a [`MemoryCache`]
//! default.
//!
//! ## Intents
//! Skylark's voice functionality requires you to specify the
//! `GUILD_VOICE_STATES` intent when building your [`Config`].

#![warn(clippy::pedantic)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
)]

mod cache;
mod chunk;
mod config;
pub mod constants;
mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
mod http;
pub mod id;
pub mod intents;
pub mod join;
mod manager;
pub mod model;
mod voice;
mod ws;

pub use crate::{
    cache::{Cache, MemoryCache},
    config::Config,
    dispatch::{DispatchHandler, Dispatched},
    error::{BackendError, Error, HandlerError, JoinError, JoinResult},
    events::{Event, EventHandler},
    gateway::ConnectionStage,
    id::{ChannelId, GuildId, UserId},
    intents::Intents,
    join::Join,
    manager::Client,
    model::Presence,
    voice::{VoiceBackend, VoiceCredentials},
};
