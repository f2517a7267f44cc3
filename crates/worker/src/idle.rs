//! Auto-idle shutdown.
//!
//! A deployment with no authenticated traffic for the configured window
//! deletes its own scheduler job — exactly once. Every authenticated
//! endpoint hit resets the timer through [`IdleWatchdog::touch`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mb_scheduler::SchedulerClient;

pub struct IdleWatchdog {
    notify: Notify,
    timeout: Duration,
}

impl IdleWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            notify: Notify::new(),
            timeout,
        }
    }

    /// Reset the idle timer.
    pub fn touch(&self) {
        self.notify.notify_one();
    }

    /// Wait until the deployment has been idle for the full window, then
    /// issue one `delete_job` for our own job and return.
    pub async fn run(
        self: Arc<Self>,
        scheduler: Arc<dyn SchedulerClient>,
        job_name: String,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(self.timeout) => {
                    tracing::warn!(
                        job = %job_name,
                        idle_secs = self.timeout.as_secs(),
                        "no authenticated traffic, shutting down deployment"
                    );
                    match scheduler.delete_job(&job_name).await {
                        Ok(()) => tracing::info!(job = %job_name, "deployment job deleted"),
                        Err(e) => tracing::error!(job = %job_name, error = %e, "self-shutdown failed"),
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_scheduler::testing::MockScheduler;

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once_after_the_idle_window() {
        let watchdog = Arc::new(IdleWatchdog::new(Duration::from_secs(900)));
        let scheduler = Arc::new(MockScheduler::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(watchdog.clone().run(
            scheduler.clone(),
            "deployment-m1".to_string(),
            cancel.clone(),
        ));

        // 15 minutes of silence, then well past it.
        tokio::time::sleep(Duration::from_secs(1800)).await;
        handle.await.unwrap();
        assert_eq!(scheduler.delete_count("deployment-m1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_the_timer() {
        let watchdog = Arc::new(IdleWatchdog::new(Duration::from_secs(900)));
        let scheduler = Arc::new(MockScheduler::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(watchdog.clone().run(
            scheduler.clone(),
            "deployment-m1".to_string(),
            cancel.clone(),
        ));

        // Keep touching every 10 minutes; the watchdog must never fire.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(600)).await;
            watchdog.touch();
        }
        assert_eq!(scheduler.delete_count("deployment-m1"), 0);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(scheduler.delete_count("deployment-m1"), 0);
    }
}
