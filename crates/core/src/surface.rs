//! Static chat-surface configuration: which channels, categories and guilds
//! are allowed to generate, per-surface policy (spoiler tagging), in-flight
//! caps, and the generation catalog (models, vaes, loras, embeddings, VRAM
//! ceilings). Read once at startup.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::params::{ParamRegistry, PixelCeilings};

/// Built-in in-flight cap when the config names none at any level.
pub const DEFAULT_IN_FLIGHT_CAP: u32 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_spoiler_tag: Option<bool>,
}

/// A lora or embedding with the words that trigger it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default)]
    pub trigger_words: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub vaes: Vec<String>,
    #[serde(default)]
    pub loras: Vec<CatalogEntry>,
    #[serde(default)]
    pub embeddings: Vec<CatalogEntry>,
    #[serde(flatten)]
    pub ceilings: PixelCeilings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub channels: BTreeMap<String, SurfaceEntry>,
    #[serde(default)]
    pub categories: BTreeMap<String, SurfaceEntry>,
    #[serde(default)]
    pub guilds: BTreeMap<String, SurfaceEntry>,
    /// Per-user caps by user id, plus the `"default"` entry.
    #[serde(default)]
    pub in_flight_cap: BTreeMap<String, u32>,
    pub catalog: Catalog,
    /// Hosts img2img source URLs may be fetched from. Empty means any
    /// http/https host.
    #[serde(default)]
    pub allowed_image_hosts: Vec<String>,
}

impl BotConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        if config.channels.is_empty() {
            anyhow::bail!("config lists no supported channels, the dispatcher would sit idle");
        }
        Ok(config)
    }

    /// Build the parameter registry from the configured catalog.
    pub fn registry(&self) -> anyhow::Result<ParamRegistry> {
        ParamRegistry::new(
            self.catalog.models.clone(),
            self.catalog.default_model.clone(),
            self.catalog.vaes.clone(),
            self.catalog.ceilings,
        )
    }

    pub fn is_supported_channel(&self, channel_id: u64) -> bool {
        self.channels.contains_key(&channel_id.to_string())
    }

    pub fn is_supported_category(&self, category_id: u64) -> bool {
        self.categories.contains_key(&category_id.to_string())
    }

    pub fn is_supported_guild(&self, guild_id: u64) -> bool {
        self.guilds.contains_key(&guild_id.to_string())
    }

    /// A surface is allowed when any of its ids is listed.
    pub fn is_supported_surface(
        &self,
        channel_id: u64,
        category_id: Option<u64>,
        guild_id: Option<u64>,
    ) -> bool {
        self.is_supported_channel(channel_id)
            || category_id.is_some_and(|id| self.is_supported_category(id))
            || guild_id.is_some_and(|id| self.is_supported_guild(id))
    }

    /// Resolve the in-flight cap in priority order:
    /// user → channel → category → guild → `"default"` entry → built-in.
    pub fn in_flight_gen_cap(
        &self,
        user: u64,
        channel_id: u64,
        category_id: Option<u64>,
        guild_id: Option<u64>,
    ) -> u32 {
        if let Some(cap) = self.in_flight_cap.get(&user.to_string()) {
            return *cap;
        }
        if let Some(cap) = self
            .channels
            .get(&channel_id.to_string())
            .and_then(|e| e.in_flight_cap)
        {
            return cap;
        }
        if let Some(cap) = category_id
            .and_then(|id| self.categories.get(&id.to_string()))
            .and_then(|e| e.in_flight_cap)
        {
            return cap;
        }
        if let Some(cap) = guild_id
            .and_then(|id| self.guilds.get(&id.to_string()))
            .and_then(|e| e.in_flight_cap)
        {
            return cap;
        }
        if let Some(cap) = self.in_flight_cap.get("default") {
            return *cap;
        }
        DEFAULT_IN_FLIGHT_CAP
    }

    pub fn channel_requires_spoiler_tag(&self, channel_id: u64) -> bool {
        self.channels
            .get(&channel_id.to_string())
            .and_then(|e| e.img_spoiler_tag)
            .unwrap_or(false)
    }
}
