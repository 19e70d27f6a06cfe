use std::sync::Arc;
use std::time::Duration;

use relay_worker::engine::MemoryEngine;
use relay_worker::{Context, FnTask, TaskError, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env()?;

    eprintln!("Relay worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Name: {}", config.name);
    eprintln!("   Slots: {} (durable: {})", config.slots, config.durable_slots);
    if config.health.enabled {
        eprintln!("   Health: http://0.0.0.0:{}/health", config.health.port);
    }
    eprintln!("   Engine: in-memory (local mode)\n");

    // No network transport ships with the crate; the in-memory engine lets
    // the worker run end to end locally.
    let engine = Arc::new(MemoryEngine::new());

    let mut worker = Worker::new(config, engine);
    worker.register(FnTask::cooperative("echo", |ctx: Arc<Context>| async move {
        Ok(ctx.input().clone())
    }))?;
    worker.register(FnTask::blocking("sleep", |ctx: Arc<Context>| {
        let seconds = ctx.input()["seconds"].as_u64().unwrap_or(1);
        if ctx.wait_cancelled(Duration::from_secs(seconds)) {
            return Err(TaskError::new("cancelled"));
        }
        Ok(serde_json::json!({ "slept_seconds": seconds }))
    }))?;

    worker.run().await?;
    Ok(())
}
