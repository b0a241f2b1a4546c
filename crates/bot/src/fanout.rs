//! Result fan-out: the single consumer of the result queue. Each completed
//! item releases its in-flight slots, stops the channel's typing indicator
//! when it was the last outstanding piece of work, and turns into either an
//! image reply or an error reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use easel_core::surface::BotConfig;
use easel_engine::work::{LockedQueue, WorkItem};

use crate::chat::{ChatGateway, ImageFile, InflightState, Reply};

const RESULT_POLL: Duration = Duration::from_millis(500);
const TYPING_PING: Duration = Duration::from_secs(1);

const SPOILER_ART_NAME: &str = "SPOILER_ai_image.png";
const ART_NAME: &str = "ai_img.png";

/// Drain the result queue until `stop` is set and the queue is empty.
pub fn spawn_fanout<G: ChatGateway>(
    gateway: Arc<G>,
    config: Arc<BotConfig>,
    state: Arc<InflightState>,
    results: Arc<LockedQueue<WorkItem>>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(item) = results.pop_nowait() else {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(RESULT_POLL).await;
                continue;
            };
            deliver(gateway.as_ref(), &config, &state, item).await;
        }
        info!("result fan-out stopped");
    })
}

async fn deliver<G: ChatGateway>(
    gateway: &G,
    config: &BotConfig,
    state: &InflightState,
    item: WorkItem,
) {
    let Some(ctx) = state.finish(&item.context_handle) else {
        warn!(handle = %item.context_handle, "result for unknown context handle, dropping");
        return;
    };

    let reply = if item.images.is_empty() {
        Reply::Error(format!(
            "Error handling request. Reason: {}",
            item.error_message
        ))
    } else {
        let name = if config.channel_requires_spoiler_tag(ctx.channel_id) {
            SPOILER_ART_NAME
        } else {
            ART_NAME
        };
        Reply::Images(
            item.images
                .into_iter()
                .map(|data| ImageFile { name: name.to_string(), data })
                .collect(),
        )
    };

    if let Err(err) = gateway.send_reply(&ctx, reply).await {
        warn!(
            handle = %item.context_handle,
            error = %format!("{err:#}"),
            "could not deliver reply"
        );
    }
}

/// Per-channel typing loop: nudges the indicator once a second and exits as
/// soon as it observes the channel with no outstanding work. Started on the
/// 0→1 counter transition by admission.
pub fn spawn_typing<G: ChatGateway>(
    gateway: Arc<G>,
    state: Arc<InflightState>,
    channel_id: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while state.channel_count(channel_id) > 0 {
            gateway.trigger_typing(channel_id).await;
            tokio::time::sleep(TYPING_PING).await;
        }
    })
}
