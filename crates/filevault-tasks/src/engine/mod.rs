//! Job dispatch plumbing

mod registry;

pub use registry::{Job, JobHandler, JobOptions, JobRegistry, JobResult};
