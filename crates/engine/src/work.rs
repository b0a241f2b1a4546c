//! The work item passed through the pipeline and the locked FIFO the
//! scheduler and workers trade it through.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::time::Instant;

/// Optional second-pass upscale of a txt2img generation.
#[derive(Debug, Clone, PartialEq)]
pub struct HighresPass {
    pub scale: f64,
    pub upscaler: String,
    pub steps: u32,
    pub denoising: f64,
}

/// Optional img2img source image, already fetched, resized and re-encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInput {
    /// Base64-encoded PNG, without any `data:` prefix.
    pub png_b64: String,
    pub denoising: f64,
    /// Backend resize mode index.
    pub resize_mode: u32,
}

/// One admitted generation request. Built once by admission, routed through
/// exactly one model queue, completed (successfully or not) by exactly one
/// worker, and returned through the result queue.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub model: String,
    pub vae: String,
    pub refiner: Option<String>,
    pub refiner_switch_at: f64,
    pub prompt: String,
    pub neg_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f64,
    pub sampler: String,
    pub seed: i64,
    pub batch_size: u32,
    pub highres: Option<HighresPass>,
    pub image: Option<ImageInput>,
    /// Opaque correlation id minted at admission.
    pub context_handle: String,
    /// Set exactly once, at admission.
    pub creation_time: Instant,

    /// Decoded result images; empty until a worker fills it, and left empty
    /// on failure.
    pub images: Vec<Vec<u8>>,
    /// Replaced with a specific message only on terminal failures the worker
    /// can name.
    pub error_message: String,
}

impl WorkItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: String,
        vae: String,
        prompt: String,
        neg_prompt: String,
        width: u32,
        height: u32,
        steps: u32,
        cfg: f64,
        sampler: String,
        seed: i64,
        batch_size: u32,
        context_handle: String,
    ) -> Self {
        Self {
            model,
            vae,
            refiner: None,
            refiner_switch_at: 0.8,
            prompt,
            neg_prompt,
            width,
            height,
            steps,
            cfg,
            sampler,
            seed,
            batch_size,
            highres: None,
            image: None,
            context_handle,
            creation_time: Instant::now(),
            images: Vec::new(),
            error_message: "unknown error".to_string(),
        }
    }

    pub fn set_refiner(&mut self, refiner: String, switch_at: f64) {
        self.refiner = Some(refiner);
        self.refiner_switch_at = switch_at;
    }

    /// Attach a high-res pass. Ignored later if an image input is set.
    pub fn set_highres(&mut self, scale: f64, upscaler: String, steps: u32, denoising: f64) {
        self.highres = Some(HighresPass { scale, upscaler, steps, denoising });
    }

    /// Attach an img2img source. Clears any high-res pass: the two are
    /// mutually exclusive and img2img wins.
    pub fn set_image(&mut self, png_b64: String, denoising: f64, resize_mode: u32) {
        self.highres = None;
        self.image = Some(ImageInput { png_b64, denoising, resize_mode });
    }
}

/// A mutex-guarded FIFO. No blocking wait: the scheduler and workers poll at
/// a fixed cadence instead.
#[derive(Debug)]
pub struct LockedQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for LockedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockedQueue<T> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn pop_nowait(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl LockedQueue<WorkItem> {
    /// Creation time of the head item, without removing it.
    pub fn peek_head_time(&self) -> Option<Instant> {
        self.lock().front().map(|item| item.creation_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(handle: &str) -> WorkItem {
        WorkItem::new(
            "model".into(),
            "Automatic".into(),
            "prompt".into(),
            "".into(),
            512,
            512,
            28,
            8.0,
            "Euler".into(),
            1,
            1,
            handle.into(),
        )
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let q = LockedQueue::new();
        q.push(item("a"));
        q.push(item("b"));
        q.push(item("c"));
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_nowait().unwrap().context_handle, "a");
        assert_eq!(q.pop_nowait().unwrap().context_handle, "b");
        assert_eq!(q.pop_nowait().unwrap().context_handle, "c");
        assert!(q.pop_nowait().is_none());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn peek_head_time_does_not_remove() {
        let q = LockedQueue::new();
        assert!(q.peek_head_time().is_none());

        let first = item("a");
        let first_time = first.creation_time;
        q.push(first);
        q.push(item("b"));

        assert_eq!(q.peek_head_time(), Some(first_time));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_nowait().unwrap().context_handle, "a");
    }

    #[tokio::test]
    async fn image_input_clears_highres() {
        let mut wi = item("a");
        wi.set_highres(2.0, "Latent".into(), 10, 0.7);
        assert!(wi.highres.is_some());
        wi.set_image("cGluZw==".into(), 0.55, 1);
        assert!(wi.highres.is_none());
        assert!(wi.image.is_some());
    }
}
