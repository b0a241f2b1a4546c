//! Shared helpers for the bot crate's tests: a recording chat gateway and a
//! canned surface config.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;

use easel_core::surface::BotConfig;

use crate::chat::{ChatGateway, Reply, RequestContext};

#[derive(Default)]
pub(crate) struct RecordingGateway {
    pub(crate) replies: Mutex<Vec<(RequestContext, Reply)>>,
    pub(crate) typing_pings: AtomicUsize,
    /// Canned message-id → ack-text history for `again` lookups.
    pub(crate) history: Mutex<HashMap<u64, String>>,
}

impl ChatGateway for RecordingGateway {
    async fn send_reply(&self, ctx: &RequestContext, reply: Reply) -> anyhow::Result<()> {
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((ctx.clone(), reply));
        Ok(())
    }

    async fn trigger_typing(&self, _channel_id: u64) {
        self.typing_pings
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    async fn ack_text(&self, _channel_id: u64, message_id: u64) -> anyhow::Result<String> {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&message_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no message {message_id} in history"))
    }
}

/// Channels: 7 (cap 1), 8 (cap 999), 9 (cap 999, spoiler-tagged).
pub(crate) fn test_config() -> BotConfig {
    serde_json::from_str(
        r#"{
            "channels": {
                "7": { "description": "tight", "in_flight_cap": 1 },
                "8": { "description": "roomy", "in_flight_cap": 999 },
                "9": { "description": "spoilered", "in_flight_cap": 999, "img_spoiler_tag": true }
            },
            "categories": {},
            "guilds": {},
            "in_flight_cap": { "default": 100 },
            "catalog": {
                "models": ["test model", "other model"],
                "vaes": ["Automatic", "None", "test vae"],
                "loras": [
                    { "name": "inkwash", "trigger_words": ["ink", "wash"] }
                ],
                "embeddings": [
                    { "name": "badhands", "trigger_words": ["badhands"] }
                ]
            }
        }"#,
    )
    .unwrap()
}
