//! Admission & dispatch: everything that happens between a chat command and
//! a work item landing in the submission queue. Caps are checked, missing
//! parameters resolved (explicit value → user preference → declared
//! default), img2img sources fetched and resized, the batch size derived and
//! clamped against the VRAM ceiling, and the seed randomized. Rejections are
//! returned synchronously; nothing rejected ever enters the pipeline.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use image::imageops::FilterType;
use rand::Rng as _;
use tracing::{info, warn};

use easel_core::ack;
use easel_core::params::{
    self, ParamRegistry, ParamSet, ParamValue, AUTOSIZE, AUTOSIZE_MAXSIZE, BATCH_SIZE, CFG,
    DENOISING_STR, DENOISING_STR_IMG2IMG, HEIGHT, HIGHRES_STEPS, IMAGE_URL, MODEL, NEG_PREFIX,
    NEG_PROMPT, PREFIX, PROMPT, REFINER, REFINER_NONE, REFINER_SWITCH_AT, RESIZE_MODE,
    RESIZE_MODES, RESIZE_SCALE, SAMPLER, SCALE, SEED, STEPS, UPSCALER, VAE, WIDTH,
};
use easel_core::prefs::PreferencesStore;
use easel_core::surface::BotConfig;
use easel_engine::scheduler::QUEUE_MAX_SIZE;
use easel_engine::work::{LockedQueue, WorkItem};

use crate::chat::{ChatGateway, InflightState, RequestContext};
use crate::fanout;

/// Timeout for fetching an img2img source image.
pub const IMAGE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Pixel count at or below which an unspecified batch size defaults to four
/// images instead of two.
const SMALL_CANVAS_PIXELS: u64 = 768 * 768;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("this channel does not support image generation")]
    UnsupportedSurface,
    #[error("maximum in flight generations hit, please wait until some of your generations finish")]
    UserInflightExceeded,
    #[error("work queue is at maximum size, please wait before making your next request")]
    GlobalQueueFull,
    #[error("could not use the supplied image: {0}")]
    BadImage(String),
    #[error("parameters described will use too much VRAM, please reduce load and try again")]
    OomPredicted,
    #[error("internal error: {0}")]
    Internal(String),
}

/// One generation request as the command layer hands it over. `values`
/// carries only what the caller set explicitly.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub skip_prefixes: bool,
    pub values: ParamSet,
    pub image_url: Option<String>,
}

pub struct Admission<G> {
    registry: Arc<ParamRegistry>,
    config: Arc<BotConfig>,
    prefs: Arc<PreferencesStore>,
    state: Arc<InflightState>,
    submit_queue: Arc<LockedQueue<WorkItem>>,
    gateway: Arc<G>,
    http: reqwest::Client,
    next_handle: AtomicU64,
}

fn join_prefix(prefix: &str, body: &str, skip: bool) -> String {
    if skip || prefix.is_empty() {
        return body.to_string();
    }
    if body.is_empty() {
        return prefix.to_string();
    }
    format!("{prefix}, {body}")
}

impl<G: ChatGateway> Admission<G> {
    pub fn new(
        registry: Arc<ParamRegistry>,
        config: Arc<BotConfig>,
        prefs: Arc<PreferencesStore>,
        state: Arc<InflightState>,
        submit_queue: Arc<LockedQueue<WorkItem>>,
        gateway: Arc<G>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            registry,
            config,
            prefs,
            state,
            submit_queue,
            gateway,
            http,
            next_handle: AtomicU64::new(0),
        }
    }

    /// Run the full admission sequence; on success the item is queued, the
    /// counters are bumped, and the rendered ack message is returned.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        req: GenerationRequest,
    ) -> Result<String, AdmissionError> {
        if !self
            .config
            .is_supported_surface(ctx.channel_id, ctx.category_id, ctx.guild_id)
        {
            return Err(AdmissionError::UnsupportedSurface);
        }

        let cap = self
            .config
            .in_flight_gen_cap(ctx.user_id, ctx.channel_id, ctx.category_id, ctx.guild_id);
        if self.state.user_count(ctx.user_id) >= cap {
            return Err(AdmissionError::UserInflightExceeded);
        }

        if self.submit_queue.len() > QUEUE_MAX_SIZE {
            return Err(AdmissionError::GlobalQueueFull);
        }

        // Explicit value → user preference → declared default. Batch size is
        // special: with nothing specified it is derived below, not defaulted.
        let batch_specified = req.values.contains(BATCH_SIZE)
            || self.prefs.get(&self.registry, ctx.user_id, BATCH_SIZE).is_some();
        let mut values = ParamSet::new();
        for name in self.registry.names().collect::<Vec<_>>() {
            if name == PROMPT || name == NEG_PROMPT {
                continue;
            }
            let value = if let Some(raw) = req.values.get(name) {
                self.registry.validate_value(name, raw)
            } else if let Some(pref) = self.prefs.get(&self.registry, ctx.user_id, name) {
                pref
            } else if let Some(default) = self.registry.default_value(name) {
                default
            } else {
                continue;
            };
            values.insert(name, value);
        }

        let width = values.get_i64(WIDTH).unwrap_or(512) as u32;
        let height = values.get_i64(HEIGHT).unwrap_or(512) as u32;
        let scale = values.get_f64(SCALE).unwrap_or(1.0);
        let upscaler = values.get_str(UPSCALER).unwrap_or(params::UPSCALER_LATENT).to_string();

        let image_b64 = match &req.image_url {
            Some(url) => Some(self.fetch_image(url, &values).await?),
            None => None,
        };

        // img2img never runs the high-res pass, so its scale does not count
        // against the ceiling.
        let ceiling_scale = if image_b64.is_some() { 1.0 } else { scale };
        let ceiling =
            params::max_batch_size(width, height, ceiling_scale, &upscaler, self.registry.ceilings());
        let requested_batch = if batch_specified {
            values.get_i64(BATCH_SIZE).unwrap_or(1).max(1) as u32
        } else if u64::from(width) * u64::from(height) <= SMALL_CANVAS_PIXELS {
            4
        } else {
            2
        };
        let batch_size = requested_batch.min(ceiling);
        if batch_size == 0 {
            return Err(AdmissionError::OomPredicted);
        }
        values.insert(BATCH_SIZE, ParamValue::Int(i64::from(batch_size)));

        let mut seed = values.get_i64(SEED).unwrap_or(-1);
        if seed == -1 {
            seed = rand::rng().random_range(0..=params::SEED_MAX);
            values.insert(SEED, ParamValue::Int(seed));
        }

        let prefix = values.get_str(PREFIX).unwrap_or("").to_string();
        let neg_prefix = values.get_str(NEG_PREFIX).unwrap_or("").to_string();
        let prompt = join_prefix(&prefix, &req.prompt, req.skip_prefixes);
        let neg_prompt = join_prefix(&neg_prefix, &req.negative_prompt, req.skip_prefixes);

        let handle = format!(
            "{}-{}",
            ctx.user_id,
            self.next_handle.fetch_add(1, Ordering::Relaxed)
        );

        let model = values.get_str(MODEL).unwrap_or_default().to_string();
        let mut item = WorkItem::new(
            model.clone(),
            values.get_str(VAE).unwrap_or_default().to_string(),
            prompt.clone(),
            neg_prompt.clone(),
            width,
            height,
            values.get_i64(STEPS).unwrap_or(28) as u32,
            values.get_f64(CFG).unwrap_or(8.0),
            values.get_str(SAMPLER).unwrap_or_default().to_string(),
            seed,
            batch_size,
            handle.clone(),
        );

        if let Some(refiner) = values.get_str(REFINER) {
            if refiner != REFINER_NONE {
                item.set_refiner(
                    refiner.to_string(),
                    values.get_f64(REFINER_SWITCH_AT).unwrap_or(0.8),
                );
            }
        }

        if let Some(png_b64) = image_b64 {
            let mode = values.get_str(RESIZE_MODE).unwrap_or(RESIZE_MODES[1]);
            let resize_mode = RESIZE_MODES.iter().position(|m| *m == mode).unwrap_or(1) as u32;
            item.set_image(
                png_b64,
                values.get_f64(DENOISING_STR_IMG2IMG).unwrap_or(0.55),
                resize_mode,
            );
        } else if scale > 1.0 {
            item.set_highres(
                scale,
                upscaler,
                values.get_i64(HIGHRES_STEPS).unwrap_or(10) as u32,
                values.get_f64(DENOISING_STR).unwrap_or(0.7),
            );
        }

        let mut ack_set = values.clone();
        ack_set.insert(PROMPT, ParamValue::Str(prompt));
        ack_set.insert(NEG_PROMPT, ParamValue::Str(neg_prompt));
        if let Some(url) = &req.image_url {
            ack_set.insert(IMAGE_URL, ParamValue::Str(url.clone()));
        }
        let ack = ack::render(&ack_set).map_err(|err| AdmissionError::Internal(err.to_string()))?;

        self.submit_queue.push(item);
        let first_in_channel = self.state.begin(&handle, ctx);
        if first_in_channel {
            fanout::spawn_typing(
                Arc::clone(&self.gateway),
                Arc::clone(&self.state),
                ctx.channel_id,
            );
        }
        info!(
            user = ctx.user_id,
            channel = ctx.channel_id,
            handle = %handle,
            model = %model,
            batch = batch_size,
            "request admitted"
        );

        Ok(ack)
    }

    /// Fetch an img2img source, fit it under the autosize bound while
    /// keeping aspect ratio, apply the resize scale, and re-encode as PNG.
    async fn fetch_image(
        &self,
        url: &str,
        values: &ParamSet,
    ) -> Result<String, AdmissionError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|err| AdmissionError::BadImage(format!("invalid url: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AdmissionError::BadImage(
                "only http and https sources are allowed".to_string(),
            ));
        }
        if !self.config.allowed_image_hosts.is_empty() {
            let host = parsed.host_str().unwrap_or("");
            if !self.config.allowed_image_hosts.iter().any(|h| h == host) {
                return Err(AdmissionError::BadImage(format!(
                    "host {host} is not on the allowed list"
                )));
            }
        }

        let res = self
            .http
            .get(parsed)
            .timeout(IMAGE_DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|err| AdmissionError::BadImage(format!("download failed: {err}")))?;
        if !res.status().is_success() {
            return Err(AdmissionError::BadImage(format!(
                "download failed: http {}",
                res.status()
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|err| AdmissionError::BadImage(format!("download failed: {err}")))?;

        let mut img = image::load_from_memory(&bytes)
            .map_err(|err| AdmissionError::BadImage(format!("could not decode image: {err}")))?;

        let autosize = values.get_bool(AUTOSIZE).unwrap_or(true);
        let maxsize = values.get_i64(AUTOSIZE_MAXSIZE).unwrap_or(512) as u32;
        if autosize && (img.width() > maxsize || img.height() > maxsize) {
            img = img.resize(maxsize, maxsize, FilterType::Triangle);
        }

        let resize_scale = values.get_f64(RESIZE_SCALE).unwrap_or(1.0);
        if (resize_scale - 1.0).abs() > f64::EPSILON {
            let w = ((f64::from(img.width())) * resize_scale).round().max(1.0) as u32;
            let h = ((f64::from(img.height())) * resize_scale).round().max(1.0) as u32;
            img = img.resize_exact(w, h, FilterType::Triangle);
        }

        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .map_err(|err| {
                warn!(error = %err, "png re-encode failed");
                AdmissionError::BadImage(format!("could not re-encode image: {err}"))
            })?;
        Ok(B64.encode(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_config, RecordingGateway};
    use easel_core::ack;

    fn ctx() -> RequestContext {
        RequestContext { user_id: 1, channel_id: 7, category_id: None, guild_id: None }
    }

    struct Fixture {
        admission: Admission<RecordingGateway>,
        submit: Arc<LockedQueue<WorkItem>>,
        state: Arc<InflightState>,
        prefs: Arc<PreferencesStore>,
        registry: Arc<ParamRegistry>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config());
        let registry = Arc::new(config.registry().unwrap());
        let prefs = Arc::new(PreferencesStore::load(dir.path().join("prefs.json")).unwrap());
        let state = Arc::new(InflightState::new());
        let submit = Arc::new(LockedQueue::new());
        let admission = Admission::new(
            Arc::clone(&registry),
            config,
            Arc::clone(&prefs),
            Arc::clone(&state),
            Arc::clone(&submit),
            Arc::new(RecordingGateway::default()),
            reqwest::Client::new(),
        );
        Fixture { admission, submit, state, prefs, registry }
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest { prompt: prompt.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn rejects_unsupported_surface() {
        let f = fixture();
        let bad = RequestContext { user_id: 1, channel_id: 999, category_id: None, guild_id: None };
        assert!(matches!(
            f.admission.submit(&bad, request("a cat")).await,
            Err(AdmissionError::UnsupportedSurface)
        ));
        assert!(f.submit.is_empty());
    }

    #[tokio::test]
    async fn enforces_user_in_flight_cap() {
        let f = fixture();
        // Channel 7 carries a cap of 1 in the test config.
        f.admission.submit(&ctx(), request("first")).await.unwrap();
        assert!(matches!(
            f.admission.submit(&ctx(), request("second")).await,
            Err(AdmissionError::UserInflightExceeded)
        ));
        assert_eq!(f.submit.len(), 1);

        // Finishing the first request frees the slot again.
        let queued = f.submit.pop_nowait().unwrap();
        f.state.finish(&queued.context_handle).unwrap();
        f.admission.submit(&ctx(), request("third")).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_when_submission_queue_is_full() {
        let f = fixture();
        let big = RequestContext { user_id: 9999, channel_id: 8, category_id: None, guild_id: None };
        for i in 0..=QUEUE_MAX_SIZE {
            f.admission
                .submit(&big, request(&format!("filler {i}")))
                .await
                .unwrap();
        }
        assert!(matches!(
            f.admission.submit(&big, request("overflow")).await,
            Err(AdmissionError::GlobalQueueFull)
        ));
    }

    #[tokio::test]
    async fn randomizes_negative_one_seed_into_declared_range() {
        let f = fixture();
        f.admission.submit(&ctx(), request("a cat")).await.unwrap();
        let item = f.submit.pop_nowait().unwrap();
        assert!(item.seed >= 0 && item.seed <= params::SEED_MAX);
    }

    #[tokio::test]
    async fn keeps_explicit_seed() {
        let f = fixture();
        let mut req = request("a cat");
        req.values.insert(SEED, ParamValue::Int(420));
        f.admission.submit(&ctx(), req).await.unwrap();
        assert_eq!(f.submit.pop_nowait().unwrap().seed, 420);
    }

    #[tokio::test]
    async fn derives_batch_size_from_canvas_area() {
        let f = fixture();

        f.admission.submit(&ctx(), request("small")).await.unwrap();
        assert_eq!(f.submit.pop_nowait().unwrap().batch_size, 4);
        f.state.finish(&format!("{}-0", ctx().user_id));

        let mut big = request("big");
        big.values.insert(WIDTH, ParamValue::Int(1024));
        big.values.insert(HEIGHT, ParamValue::Int(1024));
        f.admission.submit(&ctx(), big).await.unwrap();
        assert_eq!(f.submit.pop_nowait().unwrap().batch_size, 2);
    }

    #[tokio::test]
    async fn clamps_batch_to_vram_ceiling_and_predicts_oom() {
        let f = fixture();

        let mut esrgan = request("upscaled");
        esrgan.values.insert(SCALE, ParamValue::Float(2.0));
        esrgan.values.insert(UPSCALER, ParamValue::Str("R-ESRGAN 4x+".to_string()));
        f.admission.submit(&ctx(), esrgan).await.unwrap();
        let item = f.submit.pop_nowait().unwrap();
        assert_eq!(item.batch_size, 1);
        f.state.finish(&item.context_handle);

        let mut oom = request("too big");
        oom.values.insert(WIDTH, ParamValue::Int(1024));
        oom.values.insert(HEIGHT, ParamValue::Int(1024));
        oom.values.insert(SCALE, ParamValue::Float(2.0));
        oom.values.insert(UPSCALER, ParamValue::Str("R-ESRGAN 4x+".to_string()));
        assert!(matches!(
            f.admission.submit(&ctx(), oom).await,
            Err(AdmissionError::OomPredicted)
        ));
    }

    #[tokio::test]
    async fn prepends_stored_prefixes_unless_skipped() {
        let f = fixture();
        f.prefs.set(1, PREFIX, &ParamValue::Str("masterpiece".to_string()));
        f.prefs.set(1, NEG_PREFIX, &ParamValue::Str("lowres".to_string()));

        let mut req = request("a cat");
        req.negative_prompt = "dogs".to_string();
        f.admission.submit(&ctx(), req).await.unwrap();
        let item = f.submit.pop_nowait().unwrap();
        assert_eq!(item.prompt, "masterpiece, a cat");
        assert_eq!(item.neg_prompt, "lowres, dogs");
        f.state.finish(&item.context_handle);

        let mut skipped = request("a cat");
        skipped.skip_prefixes = true;
        f.admission.submit(&ctx(), skipped).await.unwrap();
        assert_eq!(f.submit.pop_nowait().unwrap().prompt, "a cat");
    }

    #[tokio::test]
    async fn resolves_preferences_before_defaults() {
        let f = fixture();
        f.prefs.set(1, STEPS, &ParamValue::Int(40));

        f.admission.submit(&ctx(), request("a cat")).await.unwrap();
        assert_eq!(f.submit.pop_nowait().unwrap().steps, 40);
        f.state.finish(&format!("{}-0", ctx().user_id));

        let mut explicit = request("a cat");
        explicit.values.insert(STEPS, ParamValue::Int(12));
        f.admission.submit(&ctx(), explicit).await.unwrap();
        assert_eq!(f.submit.pop_nowait().unwrap().steps, 12);
    }

    #[tokio::test]
    async fn highres_block_follows_scale() {
        let f = fixture();
        let mut req = request("upscaled");
        req.values.insert(SCALE, ParamValue::Float(2.0));
        f.admission.submit(&ctx(), req).await.unwrap();
        let item = f.submit.pop_nowait().unwrap();
        let hr = item.highres.expect("high-res pass expected");
        assert_eq!(hr.scale, 2.0);
        assert_eq!(hr.upscaler, "Latent");
        assert_eq!(item.batch_size, 2);
    }

    #[tokio::test]
    async fn ack_parses_back_to_the_submitted_request() {
        let f = fixture();
        let mut req = request("a cat");
        req.values.insert(SEED, ParamValue::Int(77));
        req.values.insert(STEPS, ParamValue::Int(30));
        let ack = f.admission.submit(&ctx(), req).await.unwrap();

        let parsed = ack::parse(&f.registry, &ack).unwrap();
        assert_eq!(parsed.get_str(PROMPT), Some("a cat"));
        assert_eq!(parsed.get_i64(SEED), Some(77));
        assert_eq!(parsed.get_i64(STEPS), Some(30));
        assert_eq!(parsed.get_str(MODEL), Some("test model"));
    }

    #[tokio::test]
    async fn rejects_non_http_image_sources() {
        let f = fixture();
        let mut req = request("img2img");
        req.image_url = Some("file:///etc/passwd".to_string());
        assert!(matches!(
            f.admission.submit(&ctx(), req).await,
            Err(AdmissionError::BadImage(_))
        ));
    }
}
