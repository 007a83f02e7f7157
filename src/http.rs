//! Minimal REST surface used to bootstrap gateway connections.

use crate::constants::API_BASE_URL;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;

/// Response of the `/gateway/bot` endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct BotGateway {
    /// WebSocket URL clients should connect to.
    pub url: String,
    /// Identify budget for this bot, if the API advertised one.
    #[serde(default)]
    pub session_start_limit: Option<SessionStartLimit>,
}

/// How many new sessions this bot may start before being throttled.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct SessionStartLimit {
    /// Total session starts allowed per window.
    pub total: u64,
    /// Session starts remaining in the current window.
    pub remaining: u64,
    /// Milliseconds until the window resets.
    pub reset_after: u64,
}

impl SessionStartLimit {
    /// Time until the session start window resets.
    #[must_use]
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_after)
    }
}

pub(crate) type Result<T> = std::result::Result<T, reqwest::Error>;

/// Thin authenticated client over the endpoints the gateway needs.
pub(crate) struct Http {
    client: reqwest::Client,
    token: String,
}

impl Http {
    pub(crate) fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
        }
    }

    /// Fetches the gateway URL and session start budget for this bot.
    #[instrument(skip(self))]
    pub(crate) async fn bot_gateway(&self) -> Result<BotGateway> {
        self.client
            .get(format!("{}/gateway/bot", API_BASE_URL))
            .header(AUTHORIZATION, self.token.as_str())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bot_gateway_decodes_with_limit() {
        let gateway: BotGateway = serde_json::from_value(json!({
            "url": "wss://gateway.discord.gg",
            "session_start_limit": {
                "total": 1000,
                "remaining": 999,
                "reset_after": 14_400_000,
            },
        }))
        .unwrap();

        assert_eq!(gateway.url, "wss://gateway.discord.gg");
        let limit = gateway.session_start_limit.unwrap();
        assert_eq!(limit.remaining, 999);
        assert_eq!(limit.reset_delay(), Duration::from_secs(14_400));
    }

    #[test]
    fn bot_gateway_decodes_without_limit() {
        let gateway: BotGateway =
            serde_json::from_value(json!({"url": "wss://gateway.discord.gg"})).unwrap();

        assert!(gateway.session_start_limit.is_none());
    }
}
