use crate::{
    cache::Cache,
    error::HandlerError,
    events::Event,
    id::UserId,
    model::Message,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::HashMap, mem, sync::Arc};
use tracing::{trace, warn};

/// Outcome of a successfully handled dispatch.
#[derive(Clone, Debug)]
pub struct Dispatched {
    /// Event payload to publish to observers.
    pub event: Value,
    /// State the event replaced, if the handler tracked any.
    pub previous: Option<Value>,
}

impl Dispatched {
    /// Creates an outcome carrying only the event payload.
    #[must_use]
    pub fn new(event: Value) -> Self {
        Self {
            event,
            previous: None,
        }
    }

    /// Creates an outcome carrying the event payload and the state it
    /// replaced.
    #[must_use]
    pub fn with_previous(event: Value, previous: Value) -> Self {
        Self {
            event,
            previous: Some(previous),
        }
    }
}

/// User-supplied processor for one named dispatch.
///
/// Handlers are registered under a dispatch name via
/// [`Client::register_handler`] and receive the raw `d` payload of
/// matching frames, together with the client's [`Cache`].
///
/// [`Client::register_handler`]: crate::Client::register_handler
#[async_trait]
pub trait DispatchHandler: Send + Sync {
    /// Additional names this handler's results are published under.
    ///
    /// On success, one [`Event::Dispatch`] fires for the registered
    /// name and one more per alias.
    fn aliases(&self) -> &[&'static str] {
        &[]
    }

    /// Process one dispatch payload.
    async fn handle(
        &self,
        cache: &dyn Cache,
        payload: Value,
    ) -> Result<Dispatched, HandlerError>;
}

pub(crate) type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn DispatchHandler>>>>;

/// Routes named dispatches to registered handlers, holding back early
/// traffic until the session is ready.
pub(crate) struct Dispatcher {
    handlers: HandlerMap,
    buffer: Vec<(String, Value)>,
    ready: bool,
    own_user: Option<UserId>,
}

impl Dispatcher {
    pub(crate) fn new(handlers: HandlerMap) -> Self {
        Self {
            handlers,
            buffer: Vec::new(),
            ready: false,
            own_user: None,
        }
    }

    /// Routes one dispatch, returning the events it produced.
    ///
    /// Before readiness everything except `GUILD_CREATE` is buffered
    /// for later replay, so that observers never see traffic for a
    /// half-built world.
    pub(crate) async fn dispatch(
        &mut self,
        cache: &dyn Cache,
        name: &str,
        payload: Value,
    ) -> Vec<Event> {
        if !self.ready && name != "GUILD_CREATE" {
            self.buffer.push((name.to_owned(), payload));
            return Vec::new();
        }

        let handler = match self.handlers.read().get(name).cloned() {
            Some(handler) => handler,
            None => {
                trace!("No handler for dispatch {}.", name);
                return Vec::new();
            },
        };

        let mention = if name == "MESSAGE_CREATE" {
            self.detect_mention(&payload)
        } else {
            None
        };

        let mut events = Vec::new();

        match handler.handle(cache, payload).await {
            Ok(dispatched) => {
                events.push(Event::Dispatch {
                    name: name.to_owned(),
                    event: dispatched.event.clone(),
                    previous: dispatched.previous.clone(),
                });

                for alias in handler.aliases() {
                    events.push(Event::Dispatch {
                        name: (*alias).to_owned(),
                        event: dispatched.event.clone(),
                        previous: dispatched.previous.clone(),
                    });
                }

                if let Some(event) = mention {
                    events.push(event);
                }
            },
            Err(e) => {
                warn!("Handler for dispatch {} failed: {}", name, e);
            },
        }

        events
    }

    fn detect_mention(&self, payload: &Value) -> Option<Event> {
        let own_user = self.own_user?;
        let message: Message = serde_json::from_value(payload.clone()).ok()?;

        if message.mentions.iter().any(|u| u.id == own_user) {
            Some(Event::Mention {
                channel_id: message.channel_id,
                guild_id: message.guild_id,
            })
        } else {
            None
        }
    }

    /// Marks the session ready and drains the replay buffer, oldest
    /// first.
    pub(crate) fn mark_ready(&mut self) -> Vec<(String, Value)> {
        self.ready = true;
        mem::take(&mut self.buffer)
    }

    pub(crate) fn set_own_user(&mut self, user: UserId) {
        self.own_user = Some(user);
    }

    /// Resets per-session state when a fresh identify begins.
    pub(crate) fn on_new_session(&mut self) {
        self.buffer.clear();
        self.ready = false;
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
