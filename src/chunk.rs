use crate::{
    cache::Cache,
    constants::CHUNK_BATCH_SIZE,
    id::{GuildId, UserId},
    model::{Guild, GuildMembersChunk, UnavailableGuild},
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Tracks which guilds still stand between the session and readiness,
/// and paces member list requests for large guilds.
///
/// Readiness requires every guild announced in `READY` to have arrived
/// via `GUILD_CREATE`, and every requested member list to have been
/// answered in full.
pub(crate) struct ChunkCoordinator {
    chunk_guilds: bool,
    /// Guilds announced in `READY` that have not sent `GUILD_CREATE`.
    pending_unavailable: HashSet<GuildId>,
    /// Guilds waiting for their member request to be sent.
    queued: VecDeque<GuildId>,
    /// Guilds whose member request is awaiting a complete answer.
    in_flight: HashSet<GuildId>,
    /// Advertised member counts, used to detect complete answers.
    expected: HashMap<GuildId, u64>,
    known: HashSet<GuildId>,
    cycle_active: bool,
    ready_fired: bool,
}

impl ChunkCoordinator {
    pub(crate) fn new(chunk_guilds: bool) -> Self {
        Self {
            chunk_guilds,
            pending_unavailable: HashSet::new(),
            queued: VecDeque::new(),
            in_flight: HashSet::new(),
            expected: HashMap::new(),
            known: HashSet::new(),
            cycle_active: false,
            ready_fired: false,
        }
    }

    /// Resets per-session state and seeds the set of guilds the
    /// session must still receive.
    pub(crate) fn on_ready(&mut self, guilds: &[UnavailableGuild]) {
        self.pending_unavailable.clear();
        self.queued.clear();
        self.in_flight.clear();
        self.expected.clear();
        self.known.clear();
        self.cycle_active = false;
        self.ready_fired = false;

        for guild in guilds {
            self.pending_unavailable.insert(guild.id);
        }
    }

    /// Folds a `GUILD_CREATE` into the cache and queues the guild for
    /// member chunking when its list arrived truncated.
    pub(crate) fn on_guild_create(&mut self, cache: &dyn Cache, mut guild: Guild) {
        let id = guild.id;

        for channel in &mut guild.channels {
            // Guild channels omit their parent inside GUILD_CREATE.
            if channel.guild_id.is_none() {
                channel.guild_id = Some(id);
            }
            cache.put_channel(channel.clone());
        }

        if let Some(count) = guild.member_count {
            self.expected.insert(id, count);
        }

        let wants_chunks = self.chunk_guilds && guild.large;
        cache.put_guild(guild);

        self.pending_unavailable.remove(&id);
        self.known.insert(id);

        if wants_chunks && !self.queued.contains(&id) && !self.in_flight.contains(&id) {
            self.queued.push_back(id);
        }
    }

    /// Merges one `GUILD_MEMBERS_CHUNK` answer into the cached guild.
    ///
    /// The request is considered answered once the cached member list
    /// reaches the advertised member count.
    pub(crate) fn on_members_chunk(&mut self, cache: &dyn Cache, chunk: GuildMembersChunk) {
        let mut guild = match cache.guild(chunk.guild_id) {
            Some(guild) => guild,
            None => return,
        };

        let present: HashSet<UserId> = guild.members.iter().map(|m| m.user.id).collect();
        for member in chunk.members {
            if !present.contains(&member.user.id) {
                guild.members.push(member);
            }
        }

        let answered = match self.expected.get(&chunk.guild_id) {
            Some(&count) => guild.members.len() as u64 >= count,
            None => true,
        };

        cache.put_guild(guild);

        if answered {
            self.in_flight.remove(&chunk.guild_id);
        }
    }

    /// Applies a `GUILD_DELETE`, distinguishing an outage from the bot
    /// being removed.
    pub(crate) fn on_guild_delete(&mut self, cache: &dyn Cache, stub: UnavailableGuild) {
        if stub.unavailable {
            if let Some(mut guild) = cache.guild(stub.id) {
                guild.unavailable = true;
                cache.put_guild(guild);
            }
        } else {
            self.pending_unavailable.remove(&stub.id);
            self.queued.retain(|queued| *queued != stub.id);
            self.in_flight.remove(&stub.id);
            self.expected.remove(&stub.id);
            self.known.remove(&stub.id);
            cache.remove_guild(stub.id);
        }
    }

    /// Starts a send cycle if any guilds are waiting on member
    /// requests.
    ///
    /// The cycle holds off while announced guilds are still pending, so
    /// member requests never mix into the handshake burst.
    pub(crate) fn kick_cycle(&mut self) {
        if self.pending_unavailable.is_empty() && !self.queued.is_empty() {
            self.cycle_active = true;
        }
    }

    /// Takes the next batch of guilds to request members for, up to
    /// the per-batch cap. Empty outside an active cycle.
    pub(crate) fn take_batch(&mut self) -> Vec<GuildId> {
        if !self.cycle_active {
            return Vec::new();
        }

        let mut batch = Vec::new();
        while batch.len() < CHUNK_BATCH_SIZE {
            match self.queued.pop_front() {
                Some(id) => {
                    self.in_flight.insert(id);
                    batch.push(id);
                },
                None => break,
            }
        }

        if self.queued.is_empty() {
            self.cycle_active = false;
        }

        batch
    }

    /// Whether readiness just completed. Fires at most once per
    /// session.
    pub(crate) fn poll_ready(&mut self) -> bool {
        if self.ready_fired {
            return false;
        }

        if self.pending_unavailable.is_empty()
            && self.queued.is_empty()
            && self.in_flight.is_empty()
        {
            self.ready_fired = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn awaiting_unavailable(&self) -> bool {
        !self.pending_unavailable.is_empty()
    }

    /// Gives up on guilds that never arrived, returning how many were
    /// written off.
    pub(crate) fn abandon_unavailable(&mut self) -> usize {
        let abandoned = self.pending_unavailable.len();
        self.pending_unavailable.clear();
        abandoned
    }

    pub(crate) fn known_guilds(&self) -> usize {
        self.known.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::MemoryCache, id::ChannelId, model::{Channel, Member, User}};

    fn guild(id: u64, large: bool, member_count: Option<u64>) -> Guild {
        Guild {
            id: GuildId(id),
            large,
            member_count,
            ..Default::default()
        }
    }

    fn stub(id: u64, unavailable: bool) -> UnavailableGuild {
        UnavailableGuild {
            id: GuildId(id),
            unavailable,
        }
    }

    fn member(id: u64) -> Member {
        Member {
            user: User {
                id: UserId(id),
                ..Default::default()
            },
            nick: None,
        }
    }

    #[test]
    fn readiness_waits_for_announced_guilds() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        chunker.on_ready(&[stub(1, true), stub(2, true)]);
        assert!(!chunker.poll_ready());

        chunker.on_guild_create(&cache, guild(1, false, None));
        assert!(!chunker.poll_ready());

        chunker.on_guild_create(&cache, guild(2, false, None));
        assert!(chunker.poll_ready());
        assert!(!chunker.poll_ready());
        assert_eq!(chunker.known_guilds(), 2);
    }

    #[test]
    fn readiness_waits_for_member_chunks() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        chunker.on_ready(&[stub(1, true)]);
        chunker.on_guild_create(&cache, guild(1, true, Some(2)));
        assert!(!chunker.poll_ready());

        chunker.kick_cycle();
        assert_eq!(chunker.take_batch(), vec![GuildId(1)]);
        assert!(!chunker.poll_ready());

        chunker.on_members_chunk(&cache, GuildMembersChunk {
            guild_id: GuildId(1),
            members: vec![member(10), member(11)],
        });
        assert!(chunker.poll_ready());
        assert_eq!(cache.guild(GuildId(1)).unwrap().members.len(), 2);
    }

    #[test]
    fn chunking_disabled_skips_member_requests() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(false);

        chunker.on_ready(&[stub(1, true)]);
        chunker.on_guild_create(&cache, guild(1, true, Some(5000)));

        assert!(chunker.poll_ready());
        chunker.kick_cycle();
        assert!(chunker.take_batch().is_empty());
    }

    #[test]
    fn batches_are_capped_and_cycles_self_terminate() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        for id in 0..60 {
            chunker.on_guild_create(&cache, guild(id, true, Some(1000)));
        }

        // Nothing moves before a cycle is kicked off.
        assert!(chunker.take_batch().is_empty());

        chunker.kick_cycle();
        assert_eq!(chunker.take_batch().len(), CHUNK_BATCH_SIZE);
        assert_eq!(chunker.take_batch().len(), 10);
        assert!(chunker.take_batch().is_empty());
    }

    #[test]
    fn member_requests_wait_for_pending_guilds() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        chunker.on_ready(&[stub(1, true), stub(2, true)]);
        chunker.on_guild_create(&cache, guild(1, true, Some(1000)));

        chunker.kick_cycle();
        assert!(chunker.awaiting_unavailable());
        assert!(chunker.take_batch().is_empty());

        chunker.on_guild_create(&cache, guild(2, false, None));
        chunker.kick_cycle();
        assert_eq!(chunker.take_batch(), vec![GuildId(1)]);
    }

    #[test]
    fn abandoning_stragglers_releases_member_requests() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        chunker.on_ready(&[stub(1, true), stub(2, true)]);
        chunker.on_guild_create(&cache, guild(1, true, Some(1000)));
        chunker.kick_cycle();
        assert!(chunker.take_batch().is_empty());

        chunker.abandon_unavailable();
        chunker.kick_cycle();
        assert_eq!(chunker.take_batch(), vec![GuildId(1)]);
    }

    #[test]
    fn chunk_answers_merge_without_duplicates() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        let mut seeded = guild(1, true, Some(3));
        seeded.members.push(member(10));
        chunker.on_guild_create(&cache, seeded);
        chunker.kick_cycle();
        chunker.take_batch();

        chunker.on_members_chunk(&cache, GuildMembersChunk {
            guild_id: GuildId(1),
            members: vec![member(10), member(11)],
        });
        assert_eq!(cache.guild(GuildId(1)).unwrap().members.len(), 2);
        assert!(!chunker.poll_ready());

        chunker.on_members_chunk(&cache, GuildMembersChunk {
            guild_id: GuildId(1),
            members: vec![member(12)],
        });
        assert_eq!(cache.guild(GuildId(1)).unwrap().members.len(), 3);
        assert!(chunker.poll_ready());
    }

    #[test]
    fn chunks_for_unknown_guilds_are_ignored() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        chunker.on_members_chunk(&cache, GuildMembersChunk {
            guild_id: GuildId(9),
            members: vec![member(1)],
        });

        assert!(cache.guild(GuildId(9)).is_none());
    }

    #[test]
    fn removal_mid_startup_unblocks_readiness() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        chunker.on_ready(&[stub(1, true)]);
        chunker.on_guild_delete(&cache, stub(1, false));

        assert!(chunker.poll_ready());
    }

    #[test]
    fn outage_marks_guild_unavailable_in_place() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        chunker.on_guild_create(&cache, guild(1, false, None));
        chunker.on_guild_delete(&cache, stub(1, true));

        assert!(cache.guild(GuildId(1)).unwrap().unavailable);
        assert_eq!(chunker.known_guilds(), 1);
    }

    #[test]
    fn abandoning_stragglers_completes_readiness() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        chunker.on_ready(&[stub(1, true), stub(2, true)]);
        chunker.on_guild_create(&cache, guild(1, false, None));
        assert!(chunker.awaiting_unavailable());

        assert_eq!(chunker.abandon_unavailable(), 1);
        assert!(!chunker.awaiting_unavailable());
        assert!(chunker.poll_ready());

        // A straggler arriving late still merges into the cache, but
        // readiness does not fire a second time.
        chunker.on_guild_create(&cache, guild(2, false, None));
        assert!(cache.guild(GuildId(2)).is_some());
        assert!(!chunker.poll_ready());
    }

    #[test]
    fn guild_create_fills_channel_parents() {
        let cache = MemoryCache::new();
        let mut chunker = ChunkCoordinator::new(true);

        let mut seeded = guild(1, false, None);
        seeded.channels.push(Channel {
            id: ChannelId(5),
            kind: 2,
            guild_id: None,
            name: Some("Voice".into()),
        });
        chunker.on_guild_create(&cache, seeded);

        assert_eq!(
            cache.channel(ChannelId(5)).unwrap().guild_id,
            Some(GuildId(1))
        );
    }
}
