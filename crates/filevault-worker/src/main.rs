mod jobs;

use anyhow::{Context, Result};
use filevault_tasks::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs every lifecycle event at debug level
struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn publish(&self, event: TaskEvent) {
        tracing::debug!(
            kind = %event.kind,
            subject_id = %event.subject_id,
            job_name = ?event.job_name,
            payload = %serde_json::Value::Object(event.payload),
            "Task event"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "filevault_tasks=info,filevault_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("filevault-worker starting...");

    let config = WorkerPoolConfig::from_env().context("Failed to load worker configuration")?;
    tracing::info!(
        workers = config.workers,
        queue_capacity = config.queue_capacity(),
        "Worker pool configured"
    );

    let wp = WorkerPool::new(config, Arc::new(LogBroadcaster));
    jobs::register(&wp);
    wp.run().context("Failed to start worker pool")?;

    // Optional one-shot scan of a media root
    let scan_root = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FILEVAULT_SCAN_ROOT").ok());
    if let Some(root) = scan_root {
        let root = std::path::absolute(&root)
            .with_context(|| format!("Failed to resolve scan root {root}"))?;
        let task = wp
            .dispatch_job(jobs::SCAN_DIRECTORY, jobs::ScanMeta::directory(root), None)
            .context("Failed to dispatch scan")?;

        tokio::select! {
            _ = task.wait() => {
                let (_, status) = task.status();
                tracing::info!(
                    task_id = %task.id(),
                    status = status.as_str(),
                    results = %serde_json::Value::Object(task.get_results()),
                    "Scan finished"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, canceling scan");
                task.cancel();
            }
        }
    } else {
        tracing::info!("Worker ready, waiting for shutdown signal...");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received shutdown signal");
    }

    wp.shutdown().await.context("Worker pool shutdown failed")?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}
