use crate::{
    error::{BackendError, JoinError, JoinResult},
    id::{ChannelId, GuildId, UserId},
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use flume::{Receiver, Sender};
use once_cell::sync::OnceCell;
use std::{fmt, mem, sync::Arc};
use tracing::warn;

/// Parameters needed to open a voice connection, produced by a
/// successful negotiation.
#[derive(Clone, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub struct VoiceCredentials {
    /// Channel the connection was negotiated for.
    pub channel_id: ChannelId,
    /// Hostname of the allocated voice server.
    pub endpoint: String,
    /// Guild the connection belongs to.
    pub guild_id: GuildId,
    /// Voice session token granted to this user.
    pub session_id: String,
    /// Ephemeral token for the allocated voice server.
    pub token: String,
    /// User the connection was negotiated for.
    pub user_id: UserId,
}

impl fmt::Debug for VoiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceCredentials")
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .field("guild_id", &self.guild_id)
            .field("session_id", &self.session_id)
            .field("token", &"<secret>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Connector which turns negotiated [`VoiceCredentials`] into a live
/// voice connection.
///
/// The client handles the gateway half of a join on its own. Plugging
/// a backend in via [`Client::with_backend`] makes joins drive a real
/// media connection as well; without one, joins complete as soon as
/// credentials are negotiated.
///
/// [`Client::with_backend`]: crate::Client::with_backend
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Establishes a voice connection from freshly negotiated
    /// credentials.
    async fn connect(&self, credentials: VoiceCredentials) -> Result<(), BackendError>;

    /// Tears down the voice connection for a guild, if one exists.
    async fn disconnect(&self, guild_id: GuildId);
}

/// One in-progress join, waiting on the gateway's two answers.
pub(crate) struct Negotiation {
    channel_id: ChannelId,
    guild_id: GuildId,
    user_id: UserId,
    session_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
    tx: Sender<JoinResult<VoiceCredentials>>,
}

impl Negotiation {
    fn apply_state(&mut self, session_id: String, channel: ChannelId) {
        if channel != self.channel_id {
            // Moved channels mid-negotiation, so any server already
            // allocated no longer applies.
            self.endpoint = None;
            self.token = None;
            self.channel_id = channel;
        }

        self.session_id = Some(session_id);
    }

    fn apply_server(&mut self, endpoint: Option<String>, token: String) {
        match endpoint {
            Some(endpoint) => {
                self.endpoint = Some(endpoint);
                self.token = Some(token);
            },
            // A null endpoint promises a follow-up allocation.
            None => {
                self.endpoint = None;
                self.token = None;
            },
        }
    }

    fn finalise(&self) -> Option<VoiceCredentials> {
        let session_id = self.session_id.as_ref()?;
        let endpoint = self.endpoint.as_ref()?;
        let token = self.token.as_ref()?;

        Some(VoiceCredentials {
            channel_id: self.channel_id,
            endpoint: endpoint.clone(),
            guild_id: self.guild_id,
            session_id: session_id.clone(),
            token: token.clone(),
            user_id: self.user_id,
        })
    }
}

/// Voice bookkeeping for one guild, from first request to live
/// connection.
///
/// A guild holds exactly one slot across the whole join, so no point of
/// the handover leaves it looking free to a second join.
enum Slot {
    /// A join waiting on the gateway's two answers.
    Negotiating(Negotiation),
    /// A connection handed to the backend, keyed by channel.
    Active(ChannelId),
}

impl Slot {
    /// Trades a finished negotiation for the connection it produced,
    /// handing back the credentials and the join's completion sender.
    ///
    /// The swap happens in place under the slot's lock.
    fn promote(&mut self) -> Option<(VoiceCredentials, Sender<JoinResult<VoiceCredentials>>)> {
        let credentials = match self {
            Slot::Negotiating(negotiation) => negotiation.finalise()?,
            Slot::Active(_) => return None,
        };

        match mem::replace(self, Slot::Active(credentials.channel_id)) {
            Slot::Negotiating(negotiation) => Some((credentials, negotiation.tx)),
            Slot::Active(_) => None,
        }
    }
}

/// Correlates `VOICE_STATE_UPDATE` and `VOICE_SERVER_UPDATE` answers
/// with pending joins, and remembers which guilds hold a live
/// connection.
#[derive(Default)]
pub(crate) struct Negotiator {
    slots: DashMap<GuildId, Slot>,
    user: OnceCell<UserId>,
}

impl Negotiator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_user(&self, user: UserId) {
        drop(self.user.set(user));
    }

    pub(crate) fn user(&self) -> Option<UserId> {
        self.user.get().copied()
    }

    /// Opens a negotiation slot for a guild, handing back the channel
    /// its outcome will arrive on. Refused while the guild already
    /// holds a slot, negotiating or live.
    pub(crate) fn begin(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> JoinResult<Receiver<JoinResult<VoiceCredentials>>> {
        let user = match self.user.get() {
            Some(user) => *user,
            None => return Err(JoinError::NoSession),
        };

        let (tx, rx) = flume::bounded(1);
        let negotiation = Negotiation {
            channel_id: channel,
            guild_id: guild,
            user_id: user,
            session_id: None,
            endpoint: None,
            token: None,
            tx,
        };

        match self.slots.entry(guild) {
            Entry::Occupied(_) => Err(JoinError::AlreadyInUse),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Negotiating(negotiation));
                Ok(rx)
            },
        }
    }

    /// Feeds the bot's own `VOICE_STATE_UPDATE` into any pending
    /// negotiation, returning completed credentials.
    pub(crate) fn apply_state_update(
        &self,
        guild: GuildId,
        session_id: String,
        channel: ChannelId,
    ) -> Option<(VoiceCredentials, Sender<JoinResult<VoiceCredentials>>)> {
        let mut slot = self.slots.get_mut(&guild)?;

        if let Slot::Negotiating(negotiation) = slot.value_mut() {
            negotiation.apply_state(session_id, channel);
        }

        slot.promote()
    }

    /// Feeds a `VOICE_SERVER_UPDATE` into any pending negotiation,
    /// returning completed credentials.
    pub(crate) fn apply_server_update(
        &self,
        guild: GuildId,
        endpoint: Option<String>,
        token: String,
    ) -> Option<(VoiceCredentials, Sender<JoinResult<VoiceCredentials>>)> {
        let mut slot = self.slots.get_mut(&guild)?;

        if let Slot::Negotiating(negotiation) = slot.value_mut() {
            negotiation.apply_server(endpoint, token);
        }

        slot.promote()
    }

    #[cfg(test)]
    fn set_active(&self, guild: GuildId, channel: ChannelId) {
        self.slots.insert(guild, Slot::Active(channel));
    }

    /// Forgets all voice state for a guild.
    ///
    /// Cancelling a pending negotiation hangs up its sender, which
    /// resolves the waiting join future as dropped. Returns the channel
    /// of a live connection, when that is what was dropped.
    pub(crate) fn drop_guild(&self, guild: GuildId) -> Option<ChannelId> {
        match self.slots.remove(&guild) {
            Some((_, Slot::Active(channel))) => Some(channel),
            _ => None,
        }
    }
}

/// Finishes a join off the gateway task, through the backend when one
/// is installed. A backend failure releases the guild's slot.
pub(crate) fn spawn_connect(
    backend: Option<Arc<dyn VoiceBackend>>,
    negotiator: Arc<Negotiator>,
    credentials: VoiceCredentials,
    tx: Sender<JoinResult<VoiceCredentials>>,
) {
    tokio::spawn(async move {
        let guild = credentials.guild_id;

        let result = match backend {
            Some(backend) => backend.connect(credentials.clone()).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => drop(tx.send(Ok(credentials))),
            Err(e) => {
                warn!("Voice backend failed to connect: {}", e);
                negotiator.drop_guild(guild);
                drop(tx.send(Err(JoinError::Backend(e))));
            },
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_negotiator() -> Negotiator {
        let negotiator = Negotiator::new();
        negotiator.set_user(UserId(99));
        negotiator
    }

    #[test]
    fn begin_requires_a_known_user() {
        let negotiator = Negotiator::new();

        assert!(matches!(
            negotiator.begin(GuildId(1), ChannelId(2)),
            Err(JoinError::NoSession)
        ));
    }

    #[test]
    fn state_then_server_completes() {
        let negotiator = ready_negotiator();
        let _rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        assert!(negotiator
            .apply_state_update(GuildId(1), "sess".into(), ChannelId(2))
            .is_none());

        let (credentials, _tx) = negotiator
            .apply_server_update(GuildId(1), Some("eu-west42".into()), "tok".into())
            .unwrap();

        assert_eq!(credentials.channel_id, ChannelId(2));
        assert_eq!(credentials.endpoint, "eu-west42");
        assert_eq!(credentials.session_id, "sess");
        assert_eq!(credentials.token, "tok");
        assert_eq!(credentials.user_id, UserId(99));
    }

    #[test]
    fn server_then_state_completes() {
        let negotiator = ready_negotiator();
        let _rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        assert!(negotiator
            .apply_server_update(GuildId(1), Some("eu-west42".into()), "tok".into())
            .is_none());

        assert!(negotiator
            .apply_state_update(GuildId(1), "sess".into(), ChannelId(2))
            .is_some());
    }

    #[test]
    fn channel_move_discards_stale_server() {
        let negotiator = ready_negotiator();
        let _rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        negotiator.apply_server_update(GuildId(1), Some("old-server".into()), "tok".into());

        // The state answer lands in a different channel, so the old
        // allocation must not complete the join.
        assert!(negotiator
            .apply_state_update(GuildId(1), "sess".into(), ChannelId(3))
            .is_none());

        let (credentials, _tx) = negotiator
            .apply_server_update(GuildId(1), Some("new-server".into()), "tok2".into())
            .unwrap();
        assert_eq!(credentials.channel_id, ChannelId(3));
        assert_eq!(credentials.endpoint, "new-server");
    }

    #[test]
    fn null_endpoints_defer_completion() {
        let negotiator = ready_negotiator();
        let _rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        negotiator.apply_state_update(GuildId(1), "sess".into(), ChannelId(2));
        assert!(negotiator
            .apply_server_update(GuildId(1), None, "tok".into())
            .is_none());

        assert!(negotiator
            .apply_server_update(GuildId(1), Some("eu-west42".into()), "tok".into())
            .is_some());
    }

    #[test]
    fn concurrent_joins_for_one_guild_are_refused() {
        let negotiator = ready_negotiator();
        let _rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        assert!(matches!(
            negotiator.begin(GuildId(1), ChannelId(3)),
            Err(JoinError::AlreadyInUse)
        ));

        negotiator.drop_guild(GuildId(1));
        negotiator.set_active(GuildId(1), ChannelId(2));
        assert!(matches!(
            negotiator.begin(GuildId(1), ChannelId(3)),
            Err(JoinError::AlreadyInUse)
        ));
    }

    #[test]
    fn dropping_a_guild_cancels_its_negotiation() {
        let negotiator = ready_negotiator();
        let rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        assert_eq!(negotiator.drop_guild(GuildId(1)), None);
        assert!(rx.recv().is_err());

        negotiator.set_active(GuildId(2), ChannelId(5));
        assert_eq!(negotiator.drop_guild(GuildId(2)), Some(ChannelId(5)));
    }

    #[test]
    fn updates_without_negotiation_are_ignored() {
        let negotiator = ready_negotiator();

        assert!(negotiator
            .apply_state_update(GuildId(8), "sess".into(), ChannelId(1))
            .is_none());
        assert!(negotiator
            .apply_server_update(GuildId(8), Some("eu".into()), "tok".into())
            .is_none());
    }

    #[tokio::test]
    async fn connect_without_backend_resolves_immediately() {
        let negotiator = Arc::new(ready_negotiator());
        let rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        negotiator.apply_state_update(GuildId(1), "sess".into(), ChannelId(2));
        let (credentials, tx) = negotiator
            .apply_server_update(GuildId(1), Some("eu".into()), "tok".into())
            .unwrap();

        spawn_connect(None, negotiator.clone(), credentials, tx);

        let joined = rx.recv_async().await.unwrap().unwrap();
        assert_eq!(joined.guild_id, GuildId(1));
        assert_eq!(negotiator.drop_guild(GuildId(1)), Some(ChannelId(2)));
    }

    #[tokio::test]
    async fn joins_stay_exclusive_through_the_backend_connect() {
        struct Gated(Receiver<()>);

        #[async_trait]
        impl VoiceBackend for Gated {
            async fn connect(&self, _: VoiceCredentials) -> Result<(), BackendError> {
                drop(self.0.recv_async().await);
                Ok(())
            }

            async fn disconnect(&self, _: GuildId) {}
        }

        let (release, gate) = flume::bounded(1);
        let negotiator = Arc::new(ready_negotiator());
        let rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        negotiator.apply_state_update(GuildId(1), "sess".into(), ChannelId(2));
        let (credentials, tx) = negotiator
            .apply_server_update(GuildId(1), Some("eu".into()), "tok".into())
            .unwrap();
        spawn_connect(Some(Arc::new(Gated(gate))), negotiator.clone(), credentials, tx);

        // The backend has not answered yet; the guild must already
        // read as taken.
        assert!(matches!(
            negotiator.begin(GuildId(1), ChannelId(3)),
            Err(JoinError::AlreadyInUse)
        ));

        drop(release.send(()));
        assert!(rx.recv_async().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn backend_failure_surfaces_and_leaves_no_connection() {
        struct Refuser;

        #[async_trait]
        impl VoiceBackend for Refuser {
            async fn connect(&self, _: VoiceCredentials) -> Result<(), BackendError> {
                Err("no capacity".into())
            }

            async fn disconnect(&self, _: GuildId) {}
        }

        let negotiator = Arc::new(ready_negotiator());
        let rx = negotiator.begin(GuildId(1), ChannelId(2)).unwrap();

        negotiator.apply_state_update(GuildId(1), "sess".into(), ChannelId(2));
        let (credentials, tx) = negotiator
            .apply_server_update(GuildId(1), Some("eu".into()), "tok".into())
            .unwrap();

        spawn_connect(Some(Arc::new(Refuser)), negotiator.clone(), credentials, tx);

        assert!(matches!(
            rx.recv_async().await.unwrap(),
            Err(JoinError::Backend(_))
        ));
        assert_eq!(negotiator.drop_guild(GuildId(1)), None);
    }
}
