//! Periodic background job utility implemented using `tokio::time::Interval`.

use std::fmt;
use std::future::Future;

use crate::utils::FamstoreError;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// A named job that runs its body once after `delay`, then every `period`,
/// until stopped. A cycle that overruns the period simply skips the missed
/// ticks.
///
/// Must be used within the context of a tokio runtime. Dropping the job
/// cancels it as well.
pub struct PeriodicJob {
    /// Job name used in log lines.
    name: &'static str,

    /// Sender side of the stop signal.
    tx_stop: watch::Sender<bool>,

    /// Join handle of the ticker thread.
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for PeriodicJob {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PeriodicJob")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PeriodicJob {
    /// Spawns the ticker thread of a new periodic job. `body` is invoked
    /// once per tick and each invocation is awaited before the next tick is
    /// considered, so cycles never overlap.
    pub fn spawn<F, Fut>(
        name: &'static str,
        delay: Duration,
        period: Duration,
        mut body: F,
    ) -> Result<Self, FamstoreError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(FamstoreError(format!(
                "invalid period for job '{}': {:?}",
                name, period
            )));
        }

        let (tx_stop, mut rx_stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => body().await,
                    _ = rx_stop.changed() => break,
                }
            }
        });

        Ok(PeriodicJob {
            name,
            tx_stop,
            handle: Some(handle),
        })
    }

    /// Returns the job's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true if the ticker thread has not finished.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the ticker thread to stop and waits for it to exit. A cycle
    /// in progress is allowed to complete.
    pub async fn stop(&mut self) -> Result<(), FamstoreError> {
        if let Some(handle) = self.handle.take() {
            // receiver may already be gone if the thread panicked
            let _ = self.tx_stop.send(true);
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for PeriodicJob {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
