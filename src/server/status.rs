//! Periodic family status printing.

use std::sync::Arc;

use crate::server::FamilyRegistry;
use crate::utils::{FamstoreError, PeriodicJob};

use tokio::time::Duration;

/// Logs the current membership view every period.
#[derive(Debug)]
pub struct StatusReporter {
    job: PeriodicJob,
}

impl StatusReporter {
    pub fn new_and_setup(
        registry: Arc<FamilyRegistry>,
        delay: Duration,
        interval: Duration,
    ) -> Result<Self, FamstoreError> {
        let job = PeriodicJob::spawn("status-reporter", delay, interval, move || {
            let report = Self::render(&registry);
            let me = registry.me().clone();
            async move {
                pf_info!(me; "{}", report);
            }
        })?;
        Ok(StatusReporter { job })
    }

    pub async fn stop(&mut self) -> Result<(), FamstoreError> {
        self.job.stop().await
    }

    /// One-line rendering of the membership, marking myself.
    pub(crate) fn render(registry: &FamilyRegistry) -> String {
        let me = registry.me();
        let members: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|n| {
                if n == me {
                    format!("{} (me)", n)
                } else {
                    n.to_string()
                }
            })
            .collect();
        format!("family of {}: [{}]", members.len(), members.join(", "))
    }
}
