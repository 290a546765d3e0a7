use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::ConversationStore;

const FALLBACK_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A repeating background job that can be stopped.
pub struct ScheduledTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Runs `job` after every `next_delay()` until [`ScheduledTask::shutdown`] is
    /// called or the task handle is dropped.
    pub fn spawn<D, J, Fut>(name: &'static str, next_delay: D, job: J) -> Self
    where
        D: Fn() -> Duration + Send + 'static,
        J: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                let delay = next_delay();
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => job().await,
                }
            }
            info!(task = name, "Scheduled task stopped");
        });

        ScheduledTask {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                error!(task = self.name, "Scheduled task panicked: {err}");
            }
        }
    }
}

/// Time left until the next local midnight at `now`'s offset.
pub fn duration_until_next_midnight(now: DateTime<FixedOffset>) -> Duration {
    let next_midnight = now
        .date_naive()
        .succ_opt()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|naive| now.offset().from_local_datetime(&naive).single());

    match next_midnight {
        Some(target) => (target - now).to_std().unwrap_or(Duration::from_secs(1)),
        None => FALLBACK_DELAY,
    }
}

/// Zeroes the per-day counters at every local midnight and saves the store.
pub fn spawn_daily_reset(store: ConversationStore, offset: FixedOffset) -> ScheduledTask {
    ScheduledTask::spawn(
        "daily_counter_reset",
        move || {
            let delay = duration_until_next_midnight(Utc::now().with_timezone(&offset));
            info!(
                "Next daily counter reset in {:.0} minutes",
                delay.as_secs_f64() / 60.0
            );
            delay
        },
        move || {
            let store = store.clone();
            async move {
                store.reset_daily_counters();
                if let Err(err) = store.persist().await {
                    error!("Failed to save conversations after daily reset: {err}");
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UsageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tehran() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600 + 30 * 60).unwrap()
    }

    #[test]
    fn next_midnight_is_computed_in_the_local_offset() {
        // 20:00 UTC is 23:30 at +03:30.
        let now = Utc
            .with_ymd_and_hms(2024, 3, 10, 20, 0, 0)
            .unwrap()
            .with_timezone(&tehran());
        assert_eq!(duration_until_next_midnight(now), Duration::from_secs(30 * 60));
    }

    #[test]
    fn exactly_midnight_waits_a_full_day() {
        let now = tehran().with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(
            duration_until_next_midnight(now),
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn job_repeats_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = ScheduledTask::spawn(
            "test",
            || Duration::from_secs(60),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_reset_zeroes_counters_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chats.json");
        let store = ConversationStore::new(&path, 10);
        store.record_usage("5", UsageKind::Voice);
        store.record_usage("5", UsageKind::File);

        let task = spawn_daily_reset(store.clone(), tehran());
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(86_400 + 1)).await;

        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.shutdown().await;

        let stats = store.stats("5");
        assert_eq!(stats.voices, 0);
        assert_eq!(stats.files, 1);
        assert!(path.exists());
        let loaded = ConversationStore::load(&path, 10).await;
        assert_eq!(loaded.stats("5").voices, 0);
    }
}
