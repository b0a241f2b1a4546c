//! The pinned contract between the dispatcher and whatever chat transport
//! fronts it, plus the in-flight bookkeeping shared by admission and result
//! fan-out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

/// Where a request came from. Ids are opaque to the core; the surface config
/// decides what they mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: u64,
    pub channel_id: u64,
    pub category_id: Option<u64>,
    pub guild_id: Option<u64>,
}

/// One image attachment of a reply.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum Reply {
    Text(String),
    Images(Vec<ImageFile>),
    Error(String),
}

/// Outbound half of the chat contract. The transport itself (Discord, a
/// console, a test recorder) lives outside the dispatcher.
pub trait ChatGateway: Send + Sync + 'static {
    /// Deliver a reply for a finished or rejected request.
    fn send_reply(
        &self,
        ctx: &RequestContext,
        reply: Reply,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Nudge the channel's typing indicator; called once a second while a
    /// channel has outstanding work.
    fn trigger_typing(&self, channel_id: u64) -> impl Future<Output = ()> + Send;

    /// Resolve a message id to the ack text it carries, following at most
    /// one reference hop. Transports without history return an error.
    fn ack_text(
        &self,
        channel_id: u64,
        message_id: u64,
    ) -> impl Future<Output = anyhow::Result<String>> + Send;
}

/// Counters and correlation state for everything admitted but not yet
/// answered. Admission increments, result fan-out decrements.
#[derive(Debug, Default)]
pub struct InflightState {
    inner: Mutex<InflightInner>,
}

#[derive(Debug, Default)]
struct InflightInner {
    user_counts: HashMap<u64, u32>,
    channel_counts: HashMap<u64, u32>,
    contexts: HashMap<String, RequestContext>,
}

impl InflightState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InflightInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn user_count(&self, user_id: u64) -> u32 {
        self.lock().user_counts.get(&user_id).copied().unwrap_or(0)
    }

    pub fn channel_count(&self, channel_id: u64) -> u32 {
        self.lock().channel_counts.get(&channel_id).copied().unwrap_or(0)
    }

    /// Record an admitted request. Returns true when this is the channel's
    /// first outstanding item, i.e. the typing indicator should start.
    pub fn begin(&self, handle: &str, ctx: &RequestContext) -> bool {
        let mut inner = self.lock();
        *inner.user_counts.entry(ctx.user_id).or_insert(0) += 1;
        let channel = inner.channel_counts.entry(ctx.channel_id).or_insert(0);
        *channel += 1;
        let first_in_channel = *channel == 1;
        inner.contexts.insert(handle.to_string(), ctx.clone());
        first_in_channel
    }

    /// Close out a completed request, returning its context.
    pub fn finish(&self, handle: &str) -> Option<RequestContext> {
        let mut inner = self.lock();
        let ctx = inner.contexts.remove(handle)?;
        if let Some(count) = inner.user_counts.get_mut(&ctx.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.user_counts.remove(&ctx.user_id);
            }
        }
        if let Some(count) = inner.channel_counts.get_mut(&ctx.channel_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.channel_counts.remove(&ctx.channel_id);
            }
        }
        Some(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(user: u64, channel: u64) -> RequestContext {
        RequestContext { user_id: user, channel_id: channel, category_id: None, guild_id: None }
    }

    #[test]
    fn begin_reports_channel_transition() {
        let state = InflightState::new();
        assert!(state.begin("a", &ctx(1, 7)));
        assert!(!state.begin("b", &ctx(2, 7)));
        assert!(state.begin("c", &ctx(1, 8)));
        assert_eq!(state.user_count(1), 2);
        assert_eq!(state.channel_count(7), 2);
    }

    #[test]
    fn finish_restores_counters_exactly() {
        let state = InflightState::new();
        state.begin("a", &ctx(1, 7));
        state.begin("b", &ctx(1, 7));

        let finished = state.finish("a").unwrap();
        assert_eq!(finished, ctx(1, 7));
        assert_eq!(state.user_count(1), 1);
        assert_eq!(state.channel_count(7), 1);

        state.finish("b").unwrap();
        assert_eq!(state.user_count(1), 0);
        assert_eq!(state.channel_count(7), 0);

        assert!(state.finish("a").is_none());
    }
}
