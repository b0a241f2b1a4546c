//! A backend worker: one long-lived actor per backend URL. It waits for the
//! backend to come up, then drains whatever queue the scheduler has attached
//! it to, switching the loaded checkpoint only when an item demands it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::GenerationBackend;
use crate::work::{LockedQueue, WorkItem};

/// Sleep between queue polls when detached or the queue is empty.
pub const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Retry cadence of the startup options poll.
pub const OPTIONS_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct LoadedModel {
    /// Friendly name when a configured model matched the checkpoint,
    /// otherwise the raw checkpoint string.
    friendly: String,
    /// Raw `sd_model_checkpoint` value, used for substring matching.
    checkpoint: String,
}

#[derive(Debug)]
pub struct BackendWorker<B> {
    backend: B,
    result_queue: Arc<LockedQueue<WorkItem>>,
    known_models: Vec<String>,
    attached: Mutex<Option<Arc<LockedQueue<WorkItem>>>>,
    loaded: Mutex<Option<LoadedModel>>,
    stop: AtomicBool,
}

impl<B: GenerationBackend> BackendWorker<B> {
    pub fn new(
        backend: B,
        result_queue: Arc<LockedQueue<WorkItem>>,
        known_models: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            result_queue,
            known_models,
            attached: Mutex::new(None),
            loaded: Mutex::new(None),
            stop: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        self.backend.id()
    }

    /// Spawn the worker's run loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run().await })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn attach(&self, queue: Arc<LockedQueue<WorkItem>>) {
        *self.lock_attached() = Some(queue);
    }

    pub fn detach(&self) {
        *self.lock_attached() = None;
    }

    pub fn current_queue(&self) -> Option<Arc<LockedQueue<WorkItem>>> {
        self.lock_attached().clone()
    }

    /// Friendly name of the loaded model, or `None` until the backend has
    /// answered its first options poll.
    pub fn loaded_model(&self) -> Option<String> {
        self.lock_loaded().as_ref().map(|m| m.friendly.clone())
    }

    fn lock_attached(&self) -> std::sync::MutexGuard<'_, Option<Arc<LockedQueue<WorkItem>>>> {
        self.attached.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_loaded(&self) -> std::sync::MutexGuard<'_, Option<LoadedModel>> {
        self.loaded.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn friendly_name(&self, checkpoint: &str) -> String {
        self.known_models
            .iter()
            .find(|m| checkpoint.contains(m.as_str()))
            .cloned()
            .unwrap_or_else(|| checkpoint.to_string())
    }

    /// Poll the backend until it reports a loaded checkpoint.
    async fn wait_until_ready(&self) -> bool {
        loop {
            if self.stopped() {
                return false;
            }
            match self.backend.options().await {
                Ok(opts) => {
                    if let Some(checkpoint) = opts.sd_model_checkpoint {
                        let friendly = self.friendly_name(&checkpoint);
                        info!(backend = self.id(), model = %friendly, "backend ready");
                        *self.lock_loaded() = Some(LoadedModel { friendly, checkpoint });
                        return true;
                    }
                    debug!(backend = self.id(), "options missing sd_model_checkpoint, retrying");
                }
                Err(err) => {
                    debug!(backend = self.id(), error = %format!("{err:#}"), "backend not reachable yet");
                }
            }
            tokio::time::sleep(OPTIONS_POLL).await;
        }
    }

    async fn run(self: Arc<Self>) {
        if !self.wait_until_ready().await {
            return;
        }

        while !self.stopped() {
            let Some(queue) = self.current_queue() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };
            let Some(mut item) = queue.pop_nowait() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            self.process(&mut item).await;
            self.result_queue.push(item);
        }
    }

    async fn process(&self, item: &mut WorkItem) {
        let needs_switch = {
            let loaded = self.lock_loaded();
            match loaded.as_ref() {
                Some(model) => !model.checkpoint.contains(&item.model),
                None => true,
            }
        };

        if needs_switch {
            info!(backend = self.id(), model = %item.model, "switching checkpoint");
            if let Err(err) = self.backend.set_checkpoint(&item.model).await {
                warn!(
                    backend = self.id(),
                    model = %item.model,
                    error = %format!("{err:#}"),
                    "checkpoint switch failed"
                );
                item.error_message = format!("unable to switch to model {}", item.model);
                return;
            }
            *self.lock_loaded() = Some(LoadedModel {
                friendly: item.model.clone(),
                checkpoint: item.model.clone(),
            });
        }

        match self.backend.generate(item).await {
            Ok(payloads) => match decode_images(&payloads) {
                Ok(images) => item.images = images,
                Err(err) => {
                    warn!(
                        backend = self.id(),
                        handle = %item.context_handle,
                        error = %format!("{err:#}"),
                        "could not decode generated images"
                    );
                }
            },
            Err(err) => {
                warn!(
                    backend = self.id(),
                    handle = %item.context_handle,
                    error = %format!("{err:#}"),
                    "generation failed"
                );
            }
        }
    }
}

/// Decode base64 image payloads, stripping any `data:…,` prefix.
fn decode_images(payloads: &[String]) -> anyhow::Result<Vec<Vec<u8>>> {
    payloads
        .iter()
        .map(|payload| {
            let b64 = match payload.split_once(',') {
                Some((prefix, rest)) if prefix.starts_with("data:") => rest,
                _ => payload.as_str(),
            };
            Ok(B64.decode(b64.as_bytes())?)
        })
        .collect()
}
