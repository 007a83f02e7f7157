//! Newtypes around Discord snowflake IDs.

use serde::{
    de::{Error as DeError, Visitor},
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use std::fmt::{self, Display, Formatter};

macro_rules! impl_id {
    ($(#[$attr:meta])* $Id:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $Id(pub u64);

        impl $Id {
            /// Returns the u64 representation of this Id.
            #[must_use]
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl Display for $Id {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl From<u64> for $Id {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl Serialize for $Id {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $Id {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserializer.deserialize_any(SnowflakeVisitor).map(Self)
            }
        }
    };
}

// The API serialises snowflakes as decimal strings to dodge JS integer
// precision, but some payloads still carry them as bare numbers.
struct SnowflakeVisitor;

impl<'de> Visitor<'de> for SnowflakeVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("a snowflake as a string or integer")
    }

    fn visit_u64<E: DeError>(self, value: u64) -> Result<u64, E> {
        Ok(value)
    }

    fn visit_str<E: DeError>(self, value: &str) -> Result<u64, E> {
        value.parse().map_err(DeError::custom)
    }
}

impl_id! {
    /// ID of a Discord voice/text channel.
    ChannelId
}

impl_id! {
    /// ID of a Discord guild (colloquially, "server").
    GuildId
}

impl_id! {
    /// ID of a Discord user.
    UserId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflake_decodes_from_string() {
        let id: GuildId = serde_json::from_str("\"81384788765712384\"").unwrap();
        assert_eq!(id, GuildId(81_384_788_765_712_384));
    }

    #[test]
    fn snowflake_decodes_from_integer() {
        let id: UserId = serde_json::from_str("1024").unwrap();
        assert_eq!(id.get(), 1024);
    }

    #[test]
    fn snowflake_encodes_as_string() {
        let encoded = serde_json::to_string(&ChannelId(42)).unwrap();
        assert_eq!(encoded, "\"42\"");
    }
}
