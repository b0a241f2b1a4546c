//! The model-aware scheduler. One queue per known model; workers are bound
//! to queues so that checkpoint switches stay rare while no queue's head
//! waits past the soft deadline.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::backend::GenerationBackend;
use crate::work::{LockedQueue, WorkItem};
use crate::worker::BackendWorker;

/// Cap on items admitted into the per-model queues at once; the rest wait in
/// the submission queue.
pub const QUEUE_MAX_SIZE: usize = 10;
/// Queue heads older than this are late and trigger worker redistribution.
pub const SOFT_DEADLINE: Duration = Duration::from_secs(30);
/// Cadence of the ingress-and-schedule loop.
pub const INGRESS_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub soft_deadline: Duration,
    pub queue_max_size: usize,
    pub ingress_poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            soft_deadline: SOFT_DEADLINE,
            queue_max_size: QUEUE_MAX_SIZE,
            ingress_poll: INGRESS_POLL,
        }
    }
}

#[derive(Debug)]
struct ModelQueue {
    queue: Arc<LockedQueue<WorkItem>>,
    /// Indices into the scheduler's worker list. The worker↔queue link is a
    /// relation owned here, not shared ownership.
    workers: Vec<usize>,
}

pub struct Scheduler<B: GenerationBackend> {
    cfg: SchedulerConfig,
    queues: BTreeMap<String, ModelQueue>,
    default_model: String,
    workers: Vec<Arc<BackendWorker<B>>>,
    /// Workers that have not yet reported a loaded checkpoint; they are not
    /// assigned to any queue until they do.
    unbound: Vec<usize>,
    submit_queue: Arc<LockedQueue<WorkItem>>,
    stop: Arc<AtomicBool>,
    rebinds: Arc<AtomicUsize>,
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    rebinds: Arc<AtomicUsize>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ingesting work; workers finish their current item and exit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Total worker↔queue binds performed, initial attaches included.
    pub fn rebind_count(&self) -> usize {
        self.rebinds.load(Ordering::SeqCst)
    }

    pub async fn wait(self) -> anyhow::Result<()> {
        self.join
            .await
            .map_err(|err| anyhow::anyhow!("scheduler task join error: {err:#}"))
    }
}

impl<B: GenerationBackend> Scheduler<B> {
    pub fn new(
        cfg: SchedulerConfig,
        models: &[String],
        workers: Vec<Arc<BackendWorker<B>>>,
        submit_queue: Arc<LockedQueue<WorkItem>>,
    ) -> anyhow::Result<Self> {
        if workers.is_empty() {
            anyhow::bail!("scheduler needs at least one backend worker");
        }
        if models.is_empty() {
            anyhow::bail!("scheduler needs at least one model queue");
        }

        let queues = models
            .iter()
            .map(|model| {
                (
                    model.clone(),
                    ModelQueue { queue: Arc::new(LockedQueue::new()), workers: Vec::new() },
                )
            })
            .collect();
        let unbound = (0..workers.len()).collect();

        Ok(Self {
            cfg,
            queues,
            default_model: models[0].clone(),
            workers,
            unbound,
            submit_queue,
            stop: Arc::new(AtomicBool::new(false)),
            rebinds: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn start(self) -> SchedulerHandle {
        let stop = Arc::clone(&self.stop);
        let rebinds = Arc::clone(&self.rebinds);
        let join = tokio::spawn(self.run());
        SchedulerHandle { stop, rebinds, join }
    }

    async fn run(mut self) {
        let worker_tasks: Vec<JoinHandle<()>> =
            self.workers.iter().map(|worker| worker.start()).collect();
        info!(
            workers = self.workers.len(),
            queues = self.queues.len(),
            "scheduler started"
        );

        while !self.stop.load(Ordering::SeqCst) {
            self.bind_ready_workers();
            self.ingress();
            self.schedule_pass();
            tokio::time::sleep(self.cfg.ingress_poll).await;
        }

        for worker in &self.workers {
            worker.stop();
        }
        for task in worker_tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }

    /// Give newly-ready workers an initial queue: the one matching their
    /// loaded model, or the default queue for unknown checkpoints.
    fn bind_ready_workers(&mut self) {
        let ready: Vec<usize> = self
            .unbound
            .iter()
            .copied()
            .filter(|&idx| self.workers[idx].loaded_model().is_some())
            .collect();
        for idx in ready {
            let model = match self.workers[idx].loaded_model() {
                Some(model) if self.queues.contains_key(&model) => model,
                _ => self.default_model.clone(),
            };
            self.bind(idx, &model);
            self.unbound.retain(|&i| i != idx);
        }
    }

    fn pending_work(&self) -> usize {
        self.queues.values().map(|mq| mq.queue.len()).sum()
    }

    /// Route submitted items into their model's queue while there is
    /// capacity. Admission guarantees the model names a known queue; anything
    /// else is dropped with an error.
    fn ingress(&mut self) {
        while self.pending_work() < self.cfg.queue_max_size {
            let Some(item) = self.submit_queue.pop_nowait() else {
                break;
            };
            match self.queues.get(&item.model) {
                Some(mq) => mq.queue.push(item),
                None => error!(
                    model = %item.model,
                    handle = %item.context_handle,
                    "dropping work item for unknown model queue"
                ),
            }
        }
    }

    /// Rebind `worker` to `model`'s queue, removing it from any other
    /// queue's worker-set first.
    fn bind(&mut self, worker: usize, model: &str) {
        for mq in self.queues.values_mut() {
            mq.workers.retain(|&i| i != worker);
        }
        let Some(mq) = self.queues.get_mut(model) else {
            return;
        };
        mq.workers.push(worker);
        self.workers[worker].attach(Arc::clone(&mq.queue));
        self.rebinds.fetch_add(1, Ordering::SeqCst);
        debug!(worker = self.workers[worker].id(), model, "bound worker to queue");
    }

    /// One scheduling pass.
    ///
    /// Queues partition into late (manned or not), workable and idle; free
    /// workers (those on idle queues) move first, to the most-overdue
    /// unmanned-late queues, then to workable queues by pressure. Workers on
    /// a manned-late queue are pinned for the pass, and no worker moves
    /// twice in one pass.
    fn schedule_pass(&mut self) {
        let now = Instant::now();
        let deadline = self.cfg.soft_deadline;

        // Unmanned late queues, ascending by latency so pop() yields the
        // most overdue.
        let mut late: Vec<(Duration, String)> = Vec::new();
        // Workable queues, ascending by pressure so pop() yields the queue
        // most likely to miss the deadline. Length matters less than age.
        let mut workable: Vec<(f64, String)> = Vec::new();
        let mut free: Vec<usize> = Vec::new();
        let mut available: Vec<usize> = Vec::new();
        let mut pinned: HashSet<usize> = HashSet::new();

        for (model, mq) in &self.queues {
            let qsize = mq.queue.len();
            let latency = mq
                .queue
                .peek_head_time()
                .map(|t| now.duration_since(t))
                .unwrap_or(Duration::ZERO);

            if latency > deadline {
                if mq.workers.is_empty() {
                    late.push((latency, model.clone()));
                } else {
                    // Already serving a deadline-critical queue; pulling
                    // them would just shift the lateness.
                    pinned.extend(mq.workers.iter().copied());
                }
            } else if qsize > 0 {
                workable.push((latency.as_secs_f64() * 5.0 + qsize as f64, model.clone()));
            } else if !mq.workers.is_empty() {
                free.extend(mq.workers.iter().copied());
            }
            available.extend(mq.workers.iter().copied());
        }
        available.retain(|idx| !pinned.contains(idx));

        late.sort_by_key(|(latency, _)| *latency);
        workable.sort_by(|a, b| a.0.total_cmp(&b.0));

        for worker in free {
            let target = if let Some((_, model)) = late.pop() {
                model
            } else if let Some((_, model)) = workable.pop() {
                model
            } else {
                continue;
            };
            self.bind(worker, &target);
            available.retain(|&idx| idx != worker);
        }

        if late.is_empty() {
            return;
        }

        // Still-late queues pull from whoever is left, preferring workers
        // whose current head is the youngest.
        available.sort_by_key(|&idx| {
            self.workers[idx]
                .current_queue()
                .and_then(|q| q.peek_head_time())
                .map(|t| now.duration_since(t))
                .unwrap_or(Duration::ZERO)
        });
        for (_, model) in late.into_iter().rev() {
            if available.is_empty() {
                break;
            }
            let worker = available.remove(0);
            self.bind(worker, &model);
        }
    }
}
