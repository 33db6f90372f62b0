use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;

use livepulse_server::api;
use livepulse_server::api::server::{ApiConfig, AppState};
use livepulse_server::db::prelude::*;
use livepulse_server::engine::scheduler::{self, SchedulerConfig};
use livepulse_server::engine::{Engine, pipeline};
use livepulse_server::util::env::{EnvErr, env};
use livepulse_server::util::telemetry::{Telemetry, TelemetryErr};

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Telemetry(#[from] TelemetryErr),

    #[error(transparent)]
    Store(#[from] StoreError),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let env = env().await?;
    let telemetry_registry = Telemetry::new(env)?.register()?;

    tracing::info!("starting livepulse server");

    let store: Arc<dyn Store> = match env.database_url() {
        Some(url) => Arc::new(PgStore::new(
            db_pool(url, env.database_max_connections).await?,
        )),
        None => {
            tracing::warn!("DATABASE_URL is not set, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Engine::system(store, env.into());

    let (queue, mut handles) =
        pipeline::spawn_workers(engine.clone(), env.scoring_workers, env.event_queue_capacity);

    let (tx_shutdown, rx_shutdown) = watch::channel(false);
    handles.push(scheduler::spawn(
        engine.clone(),
        SchedulerConfig {
            tick: env.scheduler_tick(),
            leaderboard_refresh: env.leaderboard_refresh(),
        },
        rx_shutdown,
    ));

    let state = Arc::new(AppState::new(engine, Some(queue.clone()), env));
    let served = api::server::serve(state, &ApiConfig::from(env), shutdown_signal()).await;

    tracing::info!("server stopped, draining scoring queue");
    queue.close();
    _ = tx_shutdown.send(true);
    _ = join_all(handles).await;

    telemetry_registry.shutdown();
    Ok(served?)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }

    tracing::info!("shutdown signal received");
}
