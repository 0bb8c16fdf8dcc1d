//! Concurrent job executor
//!
//! This module provides the in-process execution substrate the task
//! dispatcher and workflow engine run on:
//! - Jobs with parent links and unfinished-descendant accounting
//! - A fixed-size pool of worker threads with private FIFO queues
//! - Randomized work stealing between workers
//! - Cooperative "help while waiting" draining in `JobManager::wait`
//!
//! ## Architecture
//!
//! A [`Job`] is a one-shot closure plus an atomic counter of unfinished
//! descendants (initialized to 1, counting the job itself). Creating a child
//! job is the only operation that grows a counter; finishing a job is the
//! only operation that shrinks one. A job tree is complete exactly when the
//! root's counter reaches zero, which is what lets [`JobManager::wait`] know
//! when to stop draining work.
//!
//! Scheduling places jobs on a uniformly random worker queue. A worker that
//! finds its own queue empty steals the head of a random victim's queue, and
//! sleeps briefly when the victim is itself or empty, so idle workers never
//! busy-spin.
//!
//! Panics inside a job body are caught and logged; the job's accounting is
//! balanced regardless, and the pool never terminates a worker on failure.

pub mod job;
pub mod manager;
pub mod worker;

// Re-export main types
pub use job::{IntoJobResult, Job, JobFn, JobId, JobResult};
pub use manager::JobManager;
pub use worker::Worker;
