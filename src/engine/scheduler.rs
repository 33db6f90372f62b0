use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::Engine;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub tick: Duration,
    /// Periodic full leaderboard rebuild; `None` disables it
    pub leaderboard_refresh: Option<Duration>,
}

/// Drives deadline transitions, the scoring sweep and the optional leaderboard rebuild until
/// `shutdown` flips to `true` (or its sender goes away)
pub fn spawn(
    engine: Engine,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // a disabled refresh still needs a timer to select on; park it far in the future
        let refresh_period = config
            .leaderboard_refresh
            .unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));
        let mut refresh = tokio::time::interval_at(Instant::now() + refresh_period, refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(tick_ms = config.tick.as_millis() as u64, refresh = ?config.leaderboard_refresh, "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = engine.tick().await {
                        tracing::warn!(error = %err, "scheduler tick failed");
                    }
                }
                _ = refresh.tick(), if config.leaderboard_refresh.is_some() => {
                    if let Err(err) = engine.leaderboard.rebuild().await {
                        tracing::warn!(error = %err, "leaderboard rebuild failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("scheduler stopped");
    })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::db::prelude::*;
    use crate::engine::EngineSettings;
    use crate::engine::clock::ManualClock;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_locks_due_rounds_and_stops() {
        let start = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let engine = Engine::in_memory(clock.clone(), EngineSettings::default());

        engine
            .rounds
            .open_round("r-1".into(), "m-1".into(), start, start + chrono::Duration::seconds(10))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn(
            engine.clone(),
            SchedulerConfig {
                tick: Duration::from_millis(100),
                leaderboard_refresh: Some(Duration::from_secs(1)),
            },
            rx,
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            engine.rounds.current_state(&"r-1".into()).await.unwrap(),
            RoundState::Open
        );

        clock.advance(chrono::Duration::seconds(11));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            engine.rounds.current_state(&"r-1".into()).await.unwrap(),
            RoundState::Locked
        );

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
