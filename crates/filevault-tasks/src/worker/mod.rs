//! Worker pool for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - shared queue, elastic workers, dispatch and lookup
//! - [`WorkerPoolStatus`] - queue depth and worker counts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Reaper    │  │   Retry     │  │  Status Reporter    │  │
//! │  │ (deadlines) │  │  Drainer    │  │      (10s)          │  │
//! │  └─────────────┘  └──────┬──────┘  └─────────────────────┘  │
//! │                          │ flush when queue is empty        │
//! │  dispatch_job ──► ┌──────▼──────────────────────────────┐   │
//! │    (overflow ──►  │      Shared Queue (bounded)         │   │
//! │     retry buffer) └──────┬──────────────────────────────┘   │
//! │                          ▼                                  │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │  [Worker 1] [Worker 2] ... [Worker N] [Replacement] │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                          │ finalize                         │
//! │                          ▼                                  │
//! │        direct pool ──► ... ──► root pool (counters)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A worker that waits on a child pool with `supplement_worker` hands its
//! slot to a replacement worker for the duration of the wait. Replacement
//! workers never run jobs registered as recursive, so waits cannot nest
//! without bound.

mod pool;
mod queue;
mod reaper;
mod retry;

pub use pool::{RunState, WorkerPool, WorkerPoolStatus};
