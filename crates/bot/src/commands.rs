//! The slash-command layer: maps chat commands onto admission, preferences
//! and catalog lookups, with a one-action-per-second cooldown per user and
//! the last-ack memory that powers `again`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use easel_core::ack;
use easel_core::params::{ParamRegistry, ParamSet, IMAGE_URL, NEG_PROMPT, PROMPT};
use easel_core::prefs::PreferencesStore;
use easel_core::surface::BotConfig;

use crate::admission::{Admission, GenerationRequest};
use crate::chat::{ChatGateway, RequestContext};

const COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTopic {
    Models,
    Vaes,
    Loras,
    Embeddings,
    Usage,
}

/// Where the ack text for an `again` request comes from. The transport
/// resolves message ids (following at most one reference hop); the
/// dispatcher only ever works on the text.
#[derive(Debug, Clone)]
pub enum AgainSource {
    /// The ack this dispatcher last sent to the same user in the same
    /// channel.
    Last,
    /// Raw ack text supplied by the transport.
    Content(String),
    /// A message id to be resolved through the gateway.
    MessageId(u64),
}

#[derive(Debug, Clone)]
pub enum Command {
    Txt2Img(GenerationRequest),
    Img2Img(GenerationRequest),
    Again { source: AgainSource, overrides: ParamSet },
    GetPreferences,
    SetPreferences(ParamSet),
    Info(Vec<InfoTopic>),
}

pub struct CommandDispatcher<G> {
    admission: Admission<G>,
    registry: Arc<ParamRegistry>,
    config: Arc<BotConfig>,
    prefs: Arc<PreferencesStore>,
    gateway: Arc<G>,
    cooldowns: Mutex<HashMap<u64, Instant>>,
    last_acks: Mutex<HashMap<(u64, u64), String>>,
}

impl<G: ChatGateway> CommandDispatcher<G> {
    pub fn new(
        admission: Admission<G>,
        registry: Arc<ParamRegistry>,
        config: Arc<BotConfig>,
        prefs: Arc<PreferencesStore>,
        gateway: Arc<G>,
    ) -> Self {
        Self {
            admission,
            registry,
            config,
            prefs,
            gateway,
            cooldowns: Mutex::new(HashMap::new()),
            last_acks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one command, returning the text replies to show the caller.
    pub async fn handle(&self, ctx: &RequestContext, command: Command) -> Vec<String> {
        if !self.pass_cooldown(ctx.user_id) {
            return vec!["Commands are limited to one per second, please slow down".to_string()];
        }

        match command {
            Command::Txt2Img(req) => self.generate(ctx, req).await,
            Command::Img2Img(req) => {
                if req.image_url.is_none() {
                    return vec!["img2img needs an image url".to_string()];
                }
                self.generate(ctx, req).await
            }
            Command::Again { source, overrides } => self.again(ctx, source, overrides).await,
            Command::GetPreferences => self.surface_gated(ctx, |d| d.get_preferences(ctx)),
            Command::SetPreferences(values) => {
                self.surface_gated(ctx, |d| d.set_preferences(ctx, &values))
            }
            Command::Info(topics) => self.surface_gated(ctx, |d| d.info(&topics)),
        }
    }

    fn surface_gated(
        &self,
        ctx: &RequestContext,
        f: impl FnOnce(&Self) -> Vec<String>,
    ) -> Vec<String> {
        if !self
            .config
            .is_supported_surface(ctx.channel_id, ctx.category_id, ctx.guild_id)
        {
            return vec!["this channel does not support image generation".to_string()];
        }
        f(self)
    }

    fn pass_cooldown(&self, user_id: u64) -> bool {
        let now = Instant::now();
        let mut cooldowns = self
            .cooldowns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(last) = cooldowns.get(&user_id) {
            if now.duration_since(*last) < COOLDOWN {
                debug!(user = user_id, "command rejected by cooldown");
                return false;
            }
        }
        cooldowns.insert(user_id, now);
        true
    }

    async fn generate(&self, ctx: &RequestContext, req: GenerationRequest) -> Vec<String> {
        match self.admission.submit(ctx, req).await {
            Ok(ack) => {
                self.last_acks
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert((ctx.channel_id, ctx.user_id), ack.clone());
                vec![ack]
            }
            Err(err) => vec![err.to_string()],
        }
    }

    async fn again(
        &self,
        ctx: &RequestContext,
        source: AgainSource,
        overrides: ParamSet,
    ) -> Vec<String> {
        let text = match source {
            AgainSource::Content(text) => text,
            AgainSource::Last => {
                let acks = self
                    .last_acks
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match acks.get(&(ctx.channel_id, ctx.user_id)) {
                    Some(text) => text.clone(),
                    None => {
                        return vec![
                            "no known previous request for user in this channel".to_string()
                        ];
                    }
                }
            }
            AgainSource::MessageId(id) => match self.gateway.ack_text(ctx.channel_id, id).await {
                Ok(text) => text,
                Err(err) => {
                    return vec![format!("could not read the referenced message: {err:#}")];
                }
            },
        };

        let mut set = match ack::parse(&self.registry, &text) {
            Ok(set) => set,
            Err(err) => return vec![format!("could not parse the previous request: {err}")],
        };
        for (name, value) in overrides.iter() {
            set.insert(name, self.registry.validate_value(name, value));
        }

        let prompt = set.remove(PROMPT).and_then(|v| v.as_str().map(str::to_string));
        let neg_prompt = set.remove(NEG_PROMPT).and_then(|v| v.as_str().map(str::to_string));
        let image_url = set.remove(IMAGE_URL).and_then(|v| v.as_str().map(str::to_string));
        let req = GenerationRequest {
            prompt: prompt.unwrap_or_default(),
            negative_prompt: neg_prompt.unwrap_or_default(),
            // The parsed prompt already carries the prefixes it was
            // submitted with.
            skip_prefixes: true,
            values: set,
            image_url,
        };

        self.generate(ctx, req).await
    }

    fn get_preferences(&self, ctx: &RequestContext) -> Vec<String> {
        let stored = self.prefs.known_for(&self.registry, ctx.user_id);
        if stored.is_empty() {
            return vec!["No default preferences".to_string()];
        }
        let mut out = String::from("Default preferences:");
        for (name, value) in stored {
            out.push_str(&format!("\n{name}: {value}"));
        }
        vec![out]
    }

    fn set_preferences(&self, ctx: &RequestContext, values: &ParamSet) -> Vec<String> {
        let mut lines = Vec::new();
        for (name, value) in values.iter() {
            if !self.registry.is_param(name) {
                lines.push(format!("Unknown preference {name}"));
                continue;
            }
            let validated = self.registry.validate_value(name, value);
            lines.push(format!("Setting {name} to {validated}"));
            self.prefs.set(ctx.user_id, name, &validated);
        }
        if lines.is_empty() {
            lines.push("No preferences changed".to_string());
        }
        lines
    }

    fn info(&self, topics: &[InfoTopic]) -> Vec<String> {
        let mut out = String::new();
        for topic in topics {
            match topic {
                InfoTopic::Models => {
                    out.push_str("Supported models:\n");
                    for model in self.registry.models() {
                        out.push_str(&format!("\t{model}\n"));
                    }
                }
                InfoTopic::Vaes => {
                    out.push_str("Supported vaes:\n");
                    for vae in self.registry.vaes() {
                        out.push_str(&format!("\t{vae}\n"));
                    }
                }
                InfoTopic::Loras => {
                    out.push_str("Supported loras:\n");
                    for lora in &self.config.catalog.loras {
                        let keywords = lora.trigger_words.join(", ");
                        out.push_str(&format!("\t<lora:{}> : keyword list [{keywords}]\n", lora.name));
                    }
                }
                InfoTopic::Embeddings => {
                    out.push_str("Supported embeddings:\n");
                    for embedding in &self.config.catalog.embeddings {
                        let keywords = embedding.trigger_words.join(", ");
                        out.push_str(&format!("\t{} : keyword list [{keywords}]\n", embedding.name));
                    }
                }
                InfoTopic::Usage => {
                    out.push_str(USAGE);
                }
            }
        }
        if out.is_empty() {
            out = "No information requested".to_string();
        }
        vec![out]
    }
}

const USAGE: &str = "Commands:\n\
    \ttxt2img: generate images from a prompt\n\
    \timg2img: generate from a source image url plus a prompt\n\
    \tagain: rerun your previous request (override any option; seed -1 picks a new seed)\n\
    \tget_preferences / set_preferences: read or store your default options\n\
    \tinfo: list models, vaes, loras, embeddings, or this text\n";
