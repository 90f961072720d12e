//! Identity metadata and task keys

use std::any::Any;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::TaskResult;

/// Length of a task identity key
pub const TASK_ID_LEN: usize = 8;

/// Identity metadata supplied with every dispatch
///
/// Two dispatches with the same job name and [`meta_string`](Self::meta_string)
/// resolve to the same task while it is live. An empty meta string opts out
/// of deduplication.
pub trait TaskMetadata: Any + Send + Sync {
    /// Job this metadata belongs to
    fn job_name(&self) -> &str;

    /// Stable identity string
    fn meta_string(&self) -> String;

    /// Initial result payload announced with the task
    fn format_to_result(&self) -> TaskResult {
        TaskResult::new()
    }

    /// Reject malformed metadata before a task is created
    fn verify(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Derive the identity key for a dispatch.
///
/// `unique` salts the hash so every dispatch gets a fresh key.
pub fn task_id(job_name: &str, meta_string: &str, unique: bool) -> String {
    if meta_string.is_empty() {
        return random_id();
    }

    let mut hasher = Sha256::new();
    hasher.update(job_name.as_bytes());
    hasher.update(b":");
    hasher.update(meta_string.as_bytes());
    if unique {
        hasher.update(Uuid::now_v7().as_bytes());
    }
    short_key(&hasher.finalize())
}

fn random_id() -> String {
    short_key(&Sha256::digest(Uuid::now_v7().as_bytes()))
}

fn short_key(digest: &[u8]) -> String {
    let mut key = URL_SAFE.encode(digest);
    key.truncate(TASK_ID_LEN);
    key
}
