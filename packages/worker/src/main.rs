//! Stock worker process.
//!
//! Serves the demo functions on the queues named by `JOBQUEUE_QUEUES` until
//! interrupted or told to shut down over the command channel.

mod handlers;
mod settings;

use actors::{WorkerArgs, start_worker};
use settings::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;

    tracing_subscriber::fmt()
        .with_max_level(settings.log_level)
        .init();

    let store = store::open(&settings.store).await?;
    let worker_id = settings.worker.worker_id.clone();

    let args = WorkerArgs::new(settings.worker, store.clone(), handlers::demo_handlers());
    let (worker, mut handle) = start_worker(args).await?;
    tracing::info!("Worker {} started", worker_id);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for interrupt: {}", e);
            }
            tracing::info!("Interrupted, stopping worker {}", worker_id);
            worker.stop(None);
            handle.await?;
        }
        result = &mut handle => {
            result?;
        }
    }

    store.close().await?;
    tracing::info!("Worker {} exited", worker_id);
    Ok(())
}
