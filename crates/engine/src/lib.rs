#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! The dispatch engine: per-model work queues, backend workers driving the
//! `/sdapi/v1/*` HTTP surface, and the model-aware scheduler that binds
//! workers to queues.

pub mod backend;
pub mod scheduler;
pub mod work;
pub mod worker;

pub use backend::{BackendOptions, GenerationBackend, HttpStatusError, SdApiBackend};
pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerHandle, INGRESS_POLL, QUEUE_MAX_SIZE, SOFT_DEADLINE,
};
pub use work::{HighresPass, ImageInput, LockedQueue, WorkItem};
pub use worker::BackendWorker;
