//! Peer-to-peer RPC transport: wire messages, the client-side `PeerApi`
//! trait with its TCP implementation, and the serving side.

use std::fmt;
use std::sync::Arc;

use crate::server::{FamilyRegistry, MessageId, NodeInfo, StorageEngine};
use crate::utils::{read_frame, write_frame, FamstoreError};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Request sent from one family member to another.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Register the sender and ask for the full membership view.
    Join { node: NodeInfo },

    /// Ask for the membership view; doubles as liveness probe.
    GetView,

    /// Durably store a replica copy.
    Store { id: MessageId, text: String },

    /// Fetch a locally held replica copy.
    Retrieve { id: MessageId },
}

/// Outcome of a `Retrieve`, carried as an explicit flag rather than folded
/// into the text.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RetrieveOutcome {
    Found(String),
    NotFound,
    Failed(String),
}

/// Reply to a `PeerRequest`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerReply {
    /// Reply to `Join` and `GetView`.
    View { members: Vec<NodeInfo> },

    /// Reply to `Store`.
    Stored { success: bool, message: String },

    /// Reply to `Retrieve`.
    Retrieved {
        id: MessageId,
        outcome: RetrieveOutcome,
    },
}

/// Acknowledgement of a `Store`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StoreAck {
    pub success: bool,
    pub message: String,
}

/// Client side of the peer RPC surface. Every call either returns the
/// peer's answer or an `Err` for any transport-level failure (refused,
/// timed out, garbled reply).
#[async_trait]
pub trait PeerApi: Send + Sync {
    /// Joins the family through `target`, returning its membership view.
    async fn join(
        &self,
        target: &NodeInfo,
        me: &NodeInfo,
    ) -> Result<Vec<NodeInfo>, FamstoreError>;

    /// Fetches `target`'s membership view.
    async fn get_view(
        &self,
        target: &NodeInfo,
    ) -> Result<Vec<NodeInfo>, FamstoreError>;

    /// Asks `target` to store a replica copy.
    async fn store(
        &self,
        target: &NodeInfo,
        id: MessageId,
        text: &str,
    ) -> Result<StoreAck, FamstoreError>;

    /// Asks `target` for its replica copy of `id`.
    async fn retrieve(
        &self,
        target: &NodeInfo,
        id: MessageId,
    ) -> Result<RetrieveOutcome, FamstoreError>;
}

/// `PeerApi` over TCP, one short-lived connection per call. The whole call,
/// connect included, is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct TcpPeerApi {
    timeout: Duration,
}

impl TcpPeerApi {
    pub fn new(timeout: Duration) -> Self {
        TcpPeerApi { timeout }
    }

    /// Connects, sends one request and reads its reply.
    async fn exchange(
        target: &NodeInfo,
        req: &PeerRequest,
    ) -> Result<PeerReply, FamstoreError> {
        let mut stream =
            TcpStream::connect((target.host.as_str(), target.port)).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, req).await?;
        match read_frame(&mut stream).await? {
            Some(reply) => Ok(reply),
            None => Err(FamstoreError(format!(
                "peer {} closed connection without reply",
                target
            ))),
        }
    }

    /// Same as `exchange()`, bounded by the configured timeout.
    async fn call(
        &self,
        target: &NodeInfo,
        req: &PeerRequest,
    ) -> Result<PeerReply, FamstoreError> {
        time::timeout(self.timeout, Self::exchange(target, req)).await?
    }
}

/// Builds the error for a reply variant that does not answer the request.
fn mismatched_reply(target: &NodeInfo, reply: PeerReply) -> FamstoreError {
    FamstoreError(format!("mismatched reply from {}: {:?}", target, reply))
}

#[async_trait]
impl PeerApi for TcpPeerApi {
    async fn join(
        &self,
        target: &NodeInfo,
        me: &NodeInfo,
    ) -> Result<Vec<NodeInfo>, FamstoreError> {
        let req = PeerRequest::Join { node: me.clone() };
        match self.call(target, &req).await? {
            PeerReply::View { members } => Ok(members),
            reply => Err(mismatched_reply(target, reply)),
        }
    }

    async fn get_view(
        &self,
        target: &NodeInfo,
    ) -> Result<Vec<NodeInfo>, FamstoreError> {
        match self.call(target, &PeerRequest::GetView).await? {
            PeerReply::View { members } => Ok(members),
            reply => Err(mismatched_reply(target, reply)),
        }
    }

    async fn store(
        &self,
        target: &NodeInfo,
        id: MessageId,
        text: &str,
    ) -> Result<StoreAck, FamstoreError> {
        let req = PeerRequest::Store {
            id,
            text: text.into(),
        };
        match self.call(target, &req).await? {
            PeerReply::Stored { success, message } => {
                Ok(StoreAck { success, message })
            }
            reply => Err(mismatched_reply(target, reply)),
        }
    }

    async fn retrieve(
        &self,
        target: &NodeInfo,
        id: MessageId,
    ) -> Result<RetrieveOutcome, FamstoreError> {
        match self.call(target, &PeerRequest::Retrieve { id }).await? {
            PeerReply::Retrieved { id: got, outcome } if got == id => Ok(outcome),
            reply => Err(mismatched_reply(target, reply)),
        }
    }
}

/// Serving side of the peer RPC surface.
pub struct PeerServer {
    /// My identity.
    me: NodeInfo,

    /// Join handle of the peer acceptor thread.
    peer_acceptor_handle: JoinHandle<()>,
}

impl fmt::Debug for PeerServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PeerServer").field("me", &self.me).finish()
    }
}

// PeerServer public API implementation
impl PeerServer {
    /// Spawns the peer acceptor thread on an already bound listener.
    pub fn new_and_setup(
        me: NodeInfo,
        peer_listener: TcpListener,
        registry: Arc<FamilyRegistry>,
        storage: Arc<StorageEngine>,
    ) -> Self {
        let peer_acceptor_handle = tokio::spawn(Self::peer_acceptor_thread(
            me.clone(),
            peer_listener,
            registry,
            storage,
        ));
        PeerServer {
            me,
            peer_acceptor_handle,
        }
    }

    /// Stops accepting new peer connections.
    pub fn shutdown(&self) {
        self.peer_acceptor_handle.abort();
        pf_debug!(self.me; "peer server shut down");
    }
}

impl Drop for PeerServer {
    fn drop(&mut self) {
        self.peer_acceptor_handle.abort();
    }
}

// PeerServer request handling
impl PeerServer {
    /// Computes the reply to one peer request.
    pub(crate) async fn handle_request(
        me: &NodeInfo,
        registry: &FamilyRegistry,
        storage: &StorageEngine,
        req: PeerRequest,
    ) -> PeerReply {
        match req {
            PeerRequest::Join { node } => {
                if registry.add(node.clone()) {
                    pf_info!(me; "member {} joined, family size {}",
                                 node, registry.size());
                }
                PeerReply::View {
                    members: registry.snapshot(),
                }
            }

            PeerRequest::GetView => PeerReply::View {
                members: registry.snapshot(),
            },

            PeerRequest::Store { id, text } => {
                match storage.write(id, &text).await {
                    Ok(()) => PeerReply::Stored {
                        success: true,
                        message: "stored".into(),
                    },
                    Err(e) => {
                        pf_error!(me; "error storing replica {}: {}", id, e);
                        PeerReply::Stored {
                            success: false,
                            message: e.to_string(),
                        }
                    }
                }
            }

            PeerRequest::Retrieve { id } => {
                let outcome = match storage.read(id).await {
                    Ok(Some(text)) => RetrieveOutcome::Found(text),
                    Ok(None) => {
                        pf_debug!(me; "replica {} not held here", id);
                        RetrieveOutcome::NotFound
                    }
                    Err(e) => {
                        pf_error!(me; "error reading replica {}: {}", id, e);
                        RetrieveOutcome::Failed(e.to_string())
                    }
                };
                PeerReply::Retrieved { id, outcome }
            }
        }
    }
}

// PeerServer peer_acceptor thread implementation
impl PeerServer {
    /// Peer acceptor thread function.
    async fn peer_acceptor_thread(
        me: NodeInfo,
        peer_listener: TcpListener,
        registry: Arc<FamilyRegistry>,
        storage: Arc<StorageEngine>,
    ) {
        pf_debug!(me; "peer_acceptor thread spawned");

        loop {
            let (stream, addr) = match peer_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!(me; "error accepting peer connection: {}", e);
                    continue;
                }
            };
            pf_trace!(me; "accepted peer connection from {}", addr);

            tokio::spawn(Self::peer_servant_thread(
                me.clone(),
                stream,
                registry.clone(),
                storage.clone(),
            ));
        }
    }
}

// PeerServer peer_servant thread implementation
impl PeerServer {
    /// Peer servant thread function: serves requests on one connection until
    /// the caller hangs up.
    async fn peer_servant_thread(
        me: NodeInfo,
        mut stream: TcpStream,
        registry: Arc<FamilyRegistry>,
        storage: Arc<StorageEngine>,
    ) {
        loop {
            let req = match read_frame::<PeerRequest, _>(&mut stream).await {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(e) => {
                    pf_warn!(me; "error reading peer request: {}", e);
                    break;
                }
            };
            pf_trace!(me; "peer request {:?}", req);

            let reply =
                Self::handle_request(&me, &registry, &storage, req).await;
            if let Err(e) = write_frame(&mut stream, &reply).await {
                pf_warn!(me; "error sending peer reply: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use crate::server::CommitStrategy;
    use crate::utils::tcp_bind;
    use std::path::Path;
    use tokio::fs;

    async fn spawn_peer(
        root: &str,
    ) -> Result<(PeerServer, NodeInfo, Arc<FamilyRegistry>), FamstoreError> {
        let listener = tcp_bind("127.0.0.1:0".parse()?).await?;
        let me = NodeInfo::new("127.0.0.1", listener.local_addr()?.port());
        if fs::try_exists(root).await? {
            fs::remove_dir_all(root).await?;
        }
        let storage = Arc::new(
            StorageEngine::new_and_setup(
                me.clone(),
                Path::new(root),
                CommitStrategy::Buffered,
                false,
            )
            .await?,
        );
        let registry = Arc::new(FamilyRegistry::new(me.clone()));
        let server = PeerServer::new_and_setup(
            me.clone(),
            listener,
            registry.clone(),
            storage,
        );
        Ok((server, me, registry))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn join_and_view() -> Result<(), FamstoreError> {
        let (_server, peer, registry) =
            spawn_peer("/tmp/test-famstore-transport-0").await?;
        let api = TcpPeerApi::new(Duration::from_secs(2));
        let newcomer = NodeInfo::new("127.0.0.1", 1);

        let view = api.join(&peer, &newcomer).await?;
        assert!(view.contains(&peer));
        assert!(view.contains(&newcomer));
        assert!(registry.contains(&newcomer));
        assert_eq!(api.get_view(&peer).await?, view);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_then_retrieve() -> Result<(), FamstoreError> {
        let (_server, peer, _) =
            spawn_peer("/tmp/test-famstore-transport-1").await?;
        let api = TcpPeerApi::new(Duration::from_secs(2));

        assert_eq!(
            api.retrieve(&peer, 42).await?,
            RetrieveOutcome::NotFound
        );
        let ack = api.store(&peer, 42, "ERROR is a fine word").await?;
        assert!(ack.success);
        assert_eq!(
            api.retrieve(&peer, 42).await?,
            RetrieveOutcome::Found("ERROR is a fine word".into())
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn storage_failures_reported() -> Result<(), FamstoreError> {
        let root = "/tmp/test-famstore-transport-3";
        if fs::try_exists(root).await? {
            fs::remove_dir_all(root).await?;
        }
        let me = NodeInfo::new("127.0.0.1", 5560);
        let storage = StorageEngine::new_and_setup(
            me.clone(),
            Path::new(root),
            CommitStrategy::Unbuffered,
            false,
        )
        .await?;
        let registry = FamilyRegistry::new(me.clone());

        // a directory squatting on the blob's path breaks both read and write
        fs::create_dir_all(storage.dir().join("7.txt")).await?;
        match PeerServer::handle_request(
            &me,
            &registry,
            &storage,
            PeerRequest::Retrieve { id: 7 },
        )
        .await
        {
            PeerReply::Retrieved {
                id: 7,
                outcome: RetrieveOutcome::Failed(msg),
            } => assert!(!msg.is_empty()),
            reply => panic!("unexpected reply {:?}", reply),
        }

        fs::remove_dir_all(storage.dir()).await?;
        match PeerServer::handle_request(
            &me,
            &registry,
            &storage,
            PeerRequest::Store {
                id: 8,
                text: "lost".into(),
            },
        )
        .await
        {
            PeerReply::Stored {
                success: false,
                message,
            } => assert!(!message.is_empty()),
            reply => panic!("unexpected reply {:?}", reply),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_peer_is_error() -> Result<(), FamstoreError> {
        let (server, peer, _) =
            spawn_peer("/tmp/test-famstore-transport-2").await?;
        server.shutdown();
        drop(server);
        time::sleep(Duration::from_millis(100)).await;

        let api = TcpPeerApi::new(Duration::from_millis(500));
        assert!(api.get_view(&peer).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_peer_times_out() -> Result<(), FamstoreError> {
        // accepts connections but never answers
        let listener = tcp_bind("127.0.0.1:0".parse()?).await?;
        let silent = NodeInfo::new("127.0.0.1", listener.local_addr()?.port());
        let _holder = tokio::spawn(async move {
            let mut held = vec![];
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let api = TcpPeerApi::new(Duration::from_millis(300));
        let start = time::Instant::now();
        assert!(api.get_view(&silent).await.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
        Ok(())
    }
}
