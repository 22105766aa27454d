//! # courier-core - Task queue runtime
//!
//! This crate provides the core abstractions for the courier task queue:
//! - `Backend` / `ResultBackend` traits for broker and result storage
//! - `Registry` of named task handlers with per-task `TaskPolicy`
//! - `Client` for sending tasks and inspecting queues
//! - `WorkerPool` for processing jobs with retries, time limits and dead-lettering
//! - `Beat` for dispatching periodic tasks
//! - `MemoryBackend` for tests and local runs

mod backend;
mod beat;
mod client;
mod config;
mod error;
mod heartbeat;
mod job;
mod memory;
mod policy;
mod pool;
mod promoter;
mod reaper;
mod registry;
mod result;
mod worker;

pub use backend::{
    Backend, DynBackend, ResultBackend, SharedBackend, SharedResultBackend, WorkerPoolInfo,
};
pub use beat::{Beat, BeatSchedule, EntryState, MemoryScheduleStore, ScheduleEntry, ScheduleStore};
pub use client::Client;
pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use error::{CourierError, Result};
pub use heartbeat::{generate_pool_id, pool_info, Heartbeater};
pub use job::{Job, JobId, JobStatus, JSON_CONTENT_TYPE};
pub use memory::MemoryBackend;
pub use policy::{ResultPolicy, TaskOptions, TaskPolicy};
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use promoter::{DelayedSet, Promoter};
pub use reaper::Reaper;
pub use registry::{HandlerFuture, JobError, JobResult, RegisteredTask, Registry, TaskContext};
pub use result::{TaskOutcome, TaskState};
