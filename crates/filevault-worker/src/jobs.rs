//! Media library scan jobs
//!
//! `scan_directory` fans out one task per entry into a child pool and waits
//! on it with a supplemental worker. Subdirectories must be runnable by
//! replacement workers, so it is not registered as recursive.

use std::path::{Path, PathBuf};

use anyhow::Context;
use filevault_tasks::prelude::*;
use serde_json::json;

pub const SCAN_DIRECTORY: &str = "scan_directory";
pub const SCAN_FILE: &str = "scan_file";

/// A path handed to one of the scan jobs
pub struct ScanMeta {
    job: &'static str,
    path: PathBuf,
}

impl ScanMeta {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            job: SCAN_DIRECTORY,
            path: path.into(),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            job: SCAN_FILE,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TaskMetadata for ScanMeta {
    fn job_name(&self) -> &str {
        self.job
    }

    fn meta_string(&self) -> String {
        self.path.display().to_string()
    }

    fn format_to_result(&self) -> TaskResult {
        let mut result = TaskResult::new();
        result.insert("path".to_string(), json!(self.meta_string()));
        result
    }

    fn verify(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.path.is_absolute(), "scan path must be absolute");
        Ok(())
    }
}

pub fn register(wp: &WorkerPool) {
    wp.register_job(SCAN_DIRECTORY, scan_directory, JobOptions::new());
    wp.register_job(SCAN_FILE, scan_file, JobOptions::new());
}

async fn scan_directory(task: Arc<Task>) -> Result<(), TaskExit> {
    let Some(dir) = task.meta::<ScanMeta>().map(|meta| meta.path().to_path_buf()) else {
        return Err(task.fail(anyhow::anyhow!("missing scan metadata")));
    };
    let Some(wp) = task.worker_pool() else {
        return Err(task.fail(anyhow::anyhow!("worker pool dropped")));
    };

    let mut entries = task.req_no_err(
        tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display())),
    )?;
    let children = task.req_no_err(wp.new_task_pool(false, Some(&task)))?;

    while let Some(entry) = task.req_no_err(entries.next_entry().await)? {
        task.check_exit()?;
        let file_type = task.req_no_err(entry.file_type().await)?;
        let meta = if file_type.is_dir() {
            ScanMeta::directory(entry.path())
        } else if file_type.is_file() {
            ScanMeta::file(entry.path())
        } else {
            continue;
        };
        let job = meta.job;
        task.req_no_err(wp.dispatch_job(job, meta, Some(&children)))?;
    }
    children.signal_all_queued();
    task.sw_lap("queued");

    children.wait(true, Some(task.as_ref())).await;
    task.check_exit()?;

    let status = children.status();
    task.set_result("entries", status.total as u64);
    task.set_result("failed", status.failed as u64);
    task.success_with(format!("scanned {}", dir.display()));
    Ok(())
}

async fn scan_file(task: Arc<Task>) -> Result<(), TaskExit> {
    let Some(path) = task.meta::<ScanMeta>().map(|meta| meta.path().to_path_buf()) else {
        return Err(task.fail(anyhow::anyhow!("missing scan metadata")));
    };
    let meta = task.req_no_err(tokio::fs::metadata(&path).await)?;

    task.set_result("size", meta.len());
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        task.set_result("extension", ext.to_ascii_lowercase());
    }
    task.success();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_meta_identity() {
        let dir = ScanMeta::directory("/media/photos");
        assert_eq!(dir.job_name(), SCAN_DIRECTORY);
        assert_eq!(dir.meta_string(), "/media/photos");
        assert!(dir.verify().is_ok());

        let file = ScanMeta::file("relative.jpg");
        assert_eq!(file.job_name(), SCAN_FILE);
        assert!(file.verify().is_err());
    }
}
