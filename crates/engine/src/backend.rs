//! HTTP surface of one GPU-resident generation engine (`/sdapi/v1/*`), plus
//! the trait seam that lets the scheduler run against fakes in tests.

use std::future::Future;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::work::WorkItem;

/// Timeout for the options endpoints.
pub const OPTIONS_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for a generation call. Big batches at high step counts are slow.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Non-2xx response from a backend endpoint.
#[derive(Debug, thiserror::Error)]
#[error("http {status}: {body}")]
pub struct HttpStatusError {
    pub status: reqwest::StatusCode,
    pub body: String,
}

/// The subset of the backend's options object the dispatcher cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendOptions {
    #[serde(default)]
    pub sd_model_checkpoint: Option<String>,
}

/// One generation engine. Implemented over HTTP in production and by
/// counting fakes in the scheduler tests.
pub trait GenerationBackend: Send + Sync + 'static {
    /// Stable identity for logs and scheduling (the base URL over HTTP).
    fn id(&self) -> &str;

    /// Fetch the backend's current options.
    fn options(&self) -> impl Future<Output = anyhow::Result<BackendOptions>> + Send;

    /// Ask the backend to load a different checkpoint.
    fn set_checkpoint(&self, name: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Run one generation; returns base64 image payloads (possibly carrying
    /// a `data:…,` prefix).
    fn generate(&self, item: &WorkItem) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;
}

#[derive(Debug, Serialize)]
struct OptionsPatch<'a> {
    sd_model_checkpoint: &'a str,
}

#[derive(Debug, Serialize)]
struct OverrideSettings<'a> {
    sd_vae: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    steps: u32,
    cfg_scale: f64,
    sampler_name: &'a str,
    seed: i64,
    width: u32,
    height: u32,
    batch_size: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    enable_hr: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hr_upscaler: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hr_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hr_second_pass_steps: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    resize_mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    init_images: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    denoising_strength: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    refiner_checkpoint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refiner_switch_at: Option<f64>,

    override_settings: OverrideSettings<'a>,
    override_settings_restore_afterwards: bool,
}

impl<'a> GenerationRequest<'a> {
    fn from_item(item: &'a WorkItem) -> Self {
        let mut req = Self {
            prompt: &item.prompt,
            negative_prompt: &item.neg_prompt,
            steps: item.steps,
            cfg_scale: item.cfg,
            sampler_name: &item.sampler,
            seed: item.seed,
            width: item.width,
            height: item.height,
            batch_size: item.batch_size,
            enable_hr: None,
            hr_upscaler: None,
            hr_scale: None,
            hr_second_pass_steps: None,
            resize_mode: None,
            init_images: None,
            denoising_strength: None,
            refiner_checkpoint: item.refiner.as_deref(),
            refiner_switch_at: item.refiner.as_ref().map(|_| item.refiner_switch_at),
            override_settings: OverrideSettings { sd_vae: &item.vae },
            override_settings_restore_afterwards: true,
        };

        if let Some(image) = &item.image {
            req.resize_mode = Some(image.resize_mode);
            req.denoising_strength = Some(image.denoising);
            req.init_images = Some(vec![format!("data:image/png;base64,{}", image.png_b64)]);
        } else if let Some(hr) = &item.highres {
            req.enable_hr = Some(true);
            req.hr_upscaler = Some(&hr.upscaler);
            req.hr_scale = Some(hr.scale);
            req.hr_second_pass_steps = Some(hr.steps);
            req.denoising_strength = Some(hr.denoising);
        }

        req
    }
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    images: Vec<String>,
}

/// HTTP client for one backend base URL.
#[derive(Debug, Clone)]
pub struct SdApiBackend {
    http: reqwest::Client,
    base: Url,
    id: String,
}

impl SdApiBackend {
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        let id = base.as_str().trim_end_matches('/').to_string();
        Self { http, base, id }
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base.join(path)?)
    }
}

impl GenerationBackend for SdApiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn options(&self) -> anyhow::Result<BackendOptions> {
        let url = self.endpoint("sdapi/v1/options")?;
        let res = self.http.get(url).timeout(OPTIONS_TIMEOUT).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(HttpStatusError { status, body }.into());
        }
        Ok(res.json().await?)
    }

    async fn set_checkpoint(&self, name: &str) -> anyhow::Result<()> {
        let url = self.endpoint("sdapi/v1/options")?;
        let res = self
            .http
            .post(url)
            .timeout(OPTIONS_TIMEOUT)
            .json(&OptionsPatch { sd_model_checkpoint: name })
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(HttpStatusError { status, body }.into());
        }
        Ok(())
    }

    async fn generate(&self, item: &WorkItem) -> anyhow::Result<Vec<String>> {
        let path = if item.image.is_some() {
            "sdapi/v1/img2img"
        } else {
            "sdapi/v1/txt2img"
        };
        let url = self.endpoint(path)?;
        let res = self
            .http
            .post(url)
            .timeout(GENERATION_TIMEOUT)
            .json(&GenerationRequest::from_item(item))
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(HttpStatusError { status, body }.into());
        }
        let body: GenerationResponse = res.json().await?;
        Ok(body.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_item() -> WorkItem {
        WorkItem::new(
            "anythingV5".into(),
            "Automatic".into(),
            "a prompt".into(),
            "a neg prompt".into(),
            512,
            768,
            28,
            8.0,
            "DPM++ 2M".into(),
            42,
            2,
            "1-1".into(),
        )
    }

    #[tokio::test]
    async fn txt2img_body_omits_optional_blocks() {
        let item = base_item();
        let body = serde_json::to_value(GenerationRequest::from_item(&item)).unwrap();
        assert_eq!(body["prompt"], "a prompt");
        assert_eq!(body["cfg_scale"], 8.0);
        assert_eq!(body["batch_size"], 2);
        assert_eq!(body["override_settings"]["sd_vae"], "Automatic");
        assert_eq!(body["override_settings_restore_afterwards"], true);
        assert!(body.get("enable_hr").is_none());
        assert!(body.get("init_images").is_none());
        assert!(body.get("refiner_checkpoint").is_none());
    }

    #[tokio::test]
    async fn highres_body_carries_hr_fields() {
        let mut item = base_item();
        item.set_highres(2.0, "Latent".into(), 10, 0.7);
        let body = serde_json::to_value(GenerationRequest::from_item(&item)).unwrap();
        assert_eq!(body["enable_hr"], true);
        assert_eq!(body["hr_upscaler"], "Latent");
        assert_eq!(body["hr_scale"], 2.0);
        assert_eq!(body["hr_second_pass_steps"], 10);
        assert_eq!(body["denoising_strength"], 0.7);
    }

    #[tokio::test]
    async fn img2img_body_wins_over_highres() {
        let mut item = base_item();
        item.set_highres(2.0, "Latent".into(), 10, 0.7);
        item.set_image("cGluZw==".into(), 0.55, 1);
        let body = serde_json::to_value(GenerationRequest::from_item(&item)).unwrap();
        assert!(body.get("enable_hr").is_none());
        assert_eq!(body["resize_mode"], 1);
        assert_eq!(body["denoising_strength"], 0.55);
        assert_eq!(
            body["init_images"][0],
            "data:image/png;base64,cGluZw=="
        );
    }

    #[tokio::test]
    async fn refiner_fields_follow_the_refiner() {
        let mut item = base_item();
        item.set_refiner("refinerXL".into(), 0.8);
        let body = serde_json::to_value(GenerationRequest::from_item(&item)).unwrap();
        assert_eq!(body["refiner_checkpoint"], "refinerXL");
        assert_eq!(body["refiner_switch_at"], 0.8);
    }
}
