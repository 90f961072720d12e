//! Task pools
//!
//! ```text
//!   GLOBAL ─┬─ task            (never completes)
//!           └─ task
//!
//!   root pool ──┬─ task ── child pool ──┬─ task
//!               │                       └─ task
//!               └─ task
//! ```
//!
//! Every pool counts its own tasks and its descendants' tasks. A pool
//! completes once it has been signaled all-queued and its completed count
//! reaches its total.

mod task_pool;

pub(crate) use task_pool::PoolCompletion;
pub use task_pool::{PoolCleanup, PoolStatus, TaskPool, GLOBAL_POOL_ID};
