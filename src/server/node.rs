//! Family node: wires all modules of one member together and drives its
//! lifecycle from setup to graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use crate::server::{
    join_family, CommitStrategy, ControlServer, FailureDetector,
    FamilyRegistry, LeaderCore, LocationLedger, NodeInfo, PeerApi,
    PeerServer, StatusReporter, StorageEngine, TcpPeerApi,
};
use crate::utils::FamstoreError;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Number of replica copies wanted beyond the leader's own.
    pub tolerance: usize,

    /// Blob commit strategy name.
    pub commit_strategy: String,

    /// Whether to fdatasync after every blob write.
    pub storage_sync: bool,

    /// Root directory under which per-node blob folders live.
    pub storage_root: String,

    /// Path to the leader's location ledger file.
    pub ledger_path: String,

    /// Whether the leader compacts its ledger at startup.
    pub compact_ledger: bool,

    /// Delay before the first failure detection cycle.
    pub detector_delay_ms: u64,

    /// Period between failure detection cycles.
    pub detector_interval_ms: u64,

    /// Delay before the first status report.
    pub status_delay_ms: u64,

    /// Period between status reports.
    pub status_interval_ms: u64,

    /// Bound on every peer RPC, connect included.
    pub rpc_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            tolerance: 1,
            commit_strategy: "buffered".into(),
            storage_sync: false,
            storage_root: "/tmp/famstore".into(),
            ledger_path: "/tmp/famstore/message_map.log".into(),
            compact_ledger: false,
            detector_delay_ms: 5000,
            detector_interval_ms: 10000,
            status_delay_ms: 3000,
            status_interval_ms: 10000,
            rpc_timeout_ms: 3000,
        }
    }
}

impl NodeConfig {
    /// Parses config from an optional TOML string over the defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, FamstoreError> {
        let config = parsed_config!(config_str => NodeConfig;
                                    tolerance, commit_strategy, storage_sync,
                                    storage_root, ledger_path, compact_ledger,
                                    detector_delay_ms, detector_interval_ms,
                                    status_delay_ms, status_interval_ms,
                                    rpc_timeout_ms)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks field values, returning the parsed commit strategy.
    pub fn validate(&self) -> Result<CommitStrategy, FamstoreError> {
        for (name, value) in [
            ("detector_interval_ms", self.detector_interval_ms),
            ("status_interval_ms", self.status_interval_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
        ] {
            if value == 0 {
                return Err(FamstoreError(format!(
                    "invalid config.{} '{}'",
                    name, value
                )));
            }
        }
        if self.storage_root.is_empty() {
            return Err(FamstoreError::msg("invalid config.storage_root ''"));
        }
        if self.ledger_path.is_empty() {
            return Err(FamstoreError::msg("invalid config.ledger_path ''"));
        }
        CommitStrategy::parse_name(&self.commit_strategy).ok_or_else(|| {
            FamstoreError(format!(
                "invalid config.commit_strategy '{}'",
                self.commit_strategy
            ))
        })
    }
}

/// One family member process.
pub struct FamilyNode {
    /// My identity.
    me: NodeInfo,

    /// Configuration parameters struct.
    config: NodeConfig,

    /// Family membership registry.
    registry: Arc<FamilyRegistry>,

    /// Local blob storage.
    storage: Arc<StorageEngine>,

    /// Peer RPC serving side.
    peer_server: PeerServer,

    /// Failure detector module.
    detector: FailureDetector,

    /// Periodic status printer.
    status: StatusReporter,

    /// Member that admitted me at startup, if any.
    joined_through: Option<NodeInfo>,

    /// Location ledger, on the leader only.
    ledger: Option<Arc<LocationLedger>>,

    /// Client command server, on the leader only.
    control_server: Option<ControlServer>,
}

// FamilyNode public API implementation
impl FamilyNode {
    /// Sets up all modules of a node whose peer listener is already bound
    /// at `me`. The member bound to `base_port` is the leader and must be
    /// given its bound control listener.
    pub async fn new_and_setup(
        me: NodeInfo,
        peer_listener: TcpListener,
        control_listener: Option<TcpListener>,
        base_port: u16,
        config_str: Option<&str>,
    ) -> Result<Self, FamstoreError> {
        let config = NodeConfig::parse(config_str)?;
        let strategy = config.validate()?;
        let is_leader = me.port == base_port;
        if is_leader && control_listener.is_none() {
            return logged_err!(me; "leader needs a control listener");
        }
        if !is_leader && control_listener.is_some() {
            pf_warn!(me; "not the leader, ignoring control listener");
        }
        pf_info!(me; "setting up {} with config {:?}",
                     if is_leader { "leader" } else { "member" }, config);

        let registry = Arc::new(FamilyRegistry::new(me.clone()));
        let storage = Arc::new(
            StorageEngine::new_and_setup(
                me.clone(),
                &PathBuf::from(&config.storage_root),
                strategy,
                config.storage_sync,
            )
            .await?,
        );
        let peer_api: Arc<dyn PeerApi> = Arc::new(TcpPeerApi::new(
            Duration::from_millis(config.rpc_timeout_ms),
        ));

        // start serving peers before announcing myself
        let peer_server = PeerServer::new_and_setup(
            me.clone(),
            peer_listener,
            registry.clone(),
            storage.clone(),
        );
        let joined_through =
            join_family(&registry, peer_api.as_ref(), base_port).await;

        let detector = FailureDetector::new_and_setup(
            registry.clone(),
            peer_api.clone(),
            Duration::from_millis(config.detector_delay_ms),
            Duration::from_millis(config.detector_interval_ms),
        )?;
        let status = StatusReporter::new_and_setup(
            registry.clone(),
            Duration::from_millis(config.status_delay_ms),
            Duration::from_millis(config.status_interval_ms),
        )?;

        let (ledger, control_server) = match control_listener {
            Some(control_listener) if is_leader => {
                let (ledger, _) = LocationLedger::new_and_setup(
                    me.clone(),
                    &PathBuf::from(&config.ledger_path),
                    &me.host,
                )
                .await?;
                if config.compact_ledger {
                    ledger.compact().await?;
                }
                let ledger = Arc::new(ledger);

                let core = Arc::new(LeaderCore::new(
                    config.tolerance,
                    registry.clone(),
                    storage.clone(),
                    ledger.clone(),
                    peer_api,
                ));
                let control_server =
                    ControlServer::new_and_setup(control_listener, core);
                (Some(ledger), Some(control_server))
            }
            _ => (None, None),
        };

        Ok(FamilyNode {
            me,
            config,
            registry,
            storage,
            peer_server,
            detector,
            status,
            joined_through,
            ledger,
            control_server,
        })
    }

    /// Waits until a termination signal arrives, then shuts down.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), FamstoreError> {
        pf_info!(self.me; "node running, family size {}", self.registry.size());
        while !*rx_term.borrow() {
            if rx_term.changed().await.is_err() {
                pf_warn!(self.me; "termination channel closed");
                break;
            }
        }
        pf_warn!(self.me; "node caught termination signal");
        self.shutdown().await
    }

    /// Stops periodic jobs and the servers.
    pub async fn shutdown(&mut self) -> Result<(), FamstoreError> {
        self.detector.stop().await?;
        self.status.stop().await?;
        if let Some(control_server) = &self.control_server {
            control_server.shutdown();
        }
        self.peer_server.shutdown();
        pf_info!(self.me; "node shut down");
        Ok(())
    }

    pub fn me(&self) -> &NodeInfo {
        &self.me
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.control_server.is_some()
    }

    pub fn registry(&self) -> &Arc<FamilyRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn ledger(&self) -> Option<&Arc<LocationLedger>> {
        self.ledger.as_ref()
    }

    /// Member that admitted me at startup, or `None` for the founder.
    pub fn joined_through(&self) -> Option<&NodeInfo> {
        self.joined_through.as_ref()
    }
}
