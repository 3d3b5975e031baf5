//! Failure detector: periodically probes every other member and evicts the
//! ones that do not answer.
//!
//! There is no suspicion window. A single failed probe evicts the member
//! from this node's registry, and the eviction is never told to anyone else.
//! A member that comes back has to `Join` again to be known here.

use std::sync::Arc;

use crate::server::{FamilyRegistry, NodeInfo, PeerApi};
use crate::utils::{FamstoreError, PeriodicJob};

use futures::future::join_all;

use tokio::time::Duration;

/// The failure detector module.
#[derive(Debug)]
pub struct FailureDetector {
    /// Probing job.
    job: PeriodicJob,
}

impl FailureDetector {
    /// Starts probing after `delay`, then every `interval`.
    pub fn new_and_setup(
        registry: Arc<FamilyRegistry>,
        peer_api: Arc<dyn PeerApi>,
        delay: Duration,
        interval: Duration,
    ) -> Result<Self, FamstoreError> {
        let job = PeriodicJob::spawn("failure-detector", delay, interval, move || {
            let registry = registry.clone();
            let peer_api = peer_api.clone();
            async move {
                Self::probe_once(&registry, peer_api.as_ref()).await;
            }
        })?;
        Ok(FailureDetector { job })
    }

    /// Stops probing.
    pub async fn stop(&mut self) -> Result<(), FamstoreError> {
        self.job.stop().await
    }

    /// Runs one detection cycle: probes all members other than myself
    /// concurrently and removes every one whose probe failed. Returns the
    /// evicted members.
    pub async fn probe_once(
        registry: &FamilyRegistry,
        peer_api: &dyn PeerApi,
    ) -> Vec<NodeInfo> {
        let me = registry.me();
        let targets: Vec<NodeInfo> = registry
            .snapshot()
            .into_iter()
            .filter(|n| n != me)
            .collect();

        let probes = targets.iter().map(|target| peer_api.get_view(target));
        let results = join_all(probes).await;

        let mut evicted = vec![];
        for (target, result) in targets.into_iter().zip(results) {
            if let Err(e) = result {
                pf_warn!(me; "member {} unreachable ({}), removing from family",
                             target, e);
                registry.remove(&target);
                evicted.push(target);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod detector_tests {
    use super::*;
    use crate::server::fakepeers::{FakePeer, FakePeers};
    use tokio::time;

    fn node(port: u16) -> NodeInfo {
        NodeInfo::new("127.0.0.1", port)
    }

    fn family(peers: &FakePeers) -> Arc<FamilyRegistry> {
        let registry = Arc::new(FamilyRegistry::new(node(5555)));
        for port in 5556..=5558 {
            registry.add(node(port));
            peers.insert(node(port), FakePeer::default());
        }
        registry
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn evicts_dead_member() {
        let peers = FakePeers::new();
        let registry = family(&peers);
        peers.update(&node(5557), |p| p.down = true);

        let evicted = FailureDetector::probe_once(&registry, &peers).await;
        assert_eq!(evicted, vec![node(5557)]);
        assert_eq!(registry.snapshot(), vec![node(5555), node(5556), node(5558)]);
        // myself never probed
        assert!(peers.calls().iter().all(|(_, n)| *n != node(5555)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn evicted_stays_out_when_back() {
        let peers = FakePeers::new();
        let registry = family(&peers);
        peers.update(&node(5556), |p| p.down = true);
        FailureDetector::probe_once(&registry, &peers).await;

        peers.update(&node(5556), |p| p.down = false);
        assert!(FailureDetector::probe_once(&registry, &peers).await.is_empty());
        assert!(!registry.contains(&node(5556)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn periodic_eviction() -> Result<(), FamstoreError> {
        let peers = Arc::new(FakePeers::new());
        let registry = family(&peers);
        peers.update(&node(5558), |p| p.down = true);

        let mut detector = FailureDetector::new_and_setup(
            registry.clone(),
            peers.clone(),
            Duration::from_millis(50),
            Duration::from_millis(100),
        )?;
        time::sleep(Duration::from_millis(300)).await;
        assert!(!registry.contains(&node(5558)));
        assert!(registry.contains(&node(5557)));
        detector.stop().await?;
        Ok(())
    }
}
