//! Gateway intents, selecting which event groups a session receives.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Bitmask of event groups requested during identification.
    ///
    /// When omitted from [`Config::intents`], the gateway delivers every
    /// event group the token is allowed.
    ///
    /// [`Config::intents`]: crate::Config::intents
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Intents: u64 {
        /// Guild create/update/delete, roles, and channels.
        const GUILDS                   = 1 << 0;
        /// Member joins, updates, and removes. Privileged.
        const GUILD_MEMBERS            = 1 << 1;
        /// Ban and unban events.
        const GUILD_BANS               = 1 << 2;
        /// Emoji updates.
        const GUILD_EMOJIS             = 1 << 3;
        /// Integration updates.
        const GUILD_INTEGRATIONS       = 1 << 4;
        /// Webhook updates.
        const GUILD_WEBHOOKS           = 1 << 5;
        /// Invite create and delete events.
        const GUILD_INVITES            = 1 << 6;
        /// Voice state events. Required to join voice channels.
        const GUILD_VOICE_STATES       = 1 << 7;
        /// Presence updates. Privileged.
        const GUILD_PRESENCES          = 1 << 8;
        /// Messages sent in guild channels.
        const GUILD_MESSAGES           = 1 << 9;
        /// Reactions on guild messages.
        const GUILD_MESSAGE_REACTIONS  = 1 << 10;
        /// Typing notifications in guild channels.
        const GUILD_MESSAGE_TYPING     = 1 << 11;
        /// Messages sent in direct message channels.
        const DIRECT_MESSAGES          = 1 << 12;
        /// Reactions on direct messages.
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        /// Typing notifications in direct message channels.
        const DIRECT_MESSAGE_TYPING    = 1 << 14;
    }
}

impl Intents {
    /// Every event group which does not require privileged access.
    #[must_use]
    pub fn non_privileged() -> Self {
        Self::all() - Self::GUILD_MEMBERS - Self::GUILD_PRESENCES
    }
}

impl Serialize for Intents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Ok(Intents::from_bits_truncate(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_privileged_excludes_member_and_presence_groups() {
        let intents = Intents::non_privileged();
        assert!(!intents.contains(Intents::GUILD_MEMBERS));
        assert!(!intents.contains(Intents::GUILD_PRESENCES));
        assert!(intents.contains(Intents::GUILD_VOICE_STATES));
        assert!(intents.contains(Intents::GUILD_MESSAGES));
    }

    #[test]
    fn serialises_as_raw_bits() {
        let intents = Intents::GUILDS | Intents::GUILD_VOICE_STATES;
        assert_eq!(serde_json::to_string(&intents).unwrap(), "129");
    }
}
