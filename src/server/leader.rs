//! Leader command processor: serves the line-oriented client control
//! protocol and orchestrates replicated writes and fallback reads.
//!
//! Protocol, one command per newline-terminated UTF-8 line:
//!   - `SET <id> <text>` -> `OK` | `ERROR <message>`
//!   - `GET <id>`        -> `<text>` | `NOT_FOUND` | `ERROR <message>`
//!
//! A malformed line gets an `ERROR` reply and the connection stays open.

use std::fmt;
use std::sync::Arc;

use crate::server::{
    FamilyRegistry, LocationLedger, MessageId, NodeInfo, PeerApi,
    ReplicaSelector, RetrieveOutcome, StorageEngine,
};
use crate::utils::FamstoreError;

use futures::future::join_all;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Parsed client command.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ControlCommand {
    Set { id: MessageId, text: String },
    Get { id: MessageId },
}

/// Reply line sent back to the client.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ControlReply {
    Ok,
    Text(String),
    NotFound,
    Error(String),
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Text(text) => write!(f, "{}", text),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Error(msg) if msg.is_empty() => write!(f, "ERROR"),
            Self::Error(msg) => write!(f, "ERROR {}", msg),
        }
    }
}

/// Splits off the first whitespace-delimited token, returning it and the
/// remainder with leading whitespace removed.
fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], s[idx..].trim_start()),
        None => (s, ""),
    }
}

impl ControlCommand {
    /// Parses one protocol line. The command word is case-insensitive; for
    /// `SET` everything after the ID is the message text.
    pub fn parse(line: &str) -> Result<Self, FamstoreError> {
        let (cmd, rest) = split_token(line.trim());
        let (id_str, text) = split_token(rest);
        if id_str.is_empty() {
            return Err(FamstoreError::msg("too few arguments"));
        }
        let id = id_str.parse::<MessageId>().map_err(|e| {
            FamstoreError(format!("invalid id '{}': {}", id_str, e))
        })?;

        match &cmd.to_uppercase()[..] {
            "SET" if text.is_empty() => {
                Err(FamstoreError::msg("missing message text"))
            }
            "SET" => Ok(ControlCommand::Set {
                id,
                text: text.into(),
            }),
            "GET" => Ok(ControlCommand::Get { id }),
            _ => Err(FamstoreError(format!("unrecognized command '{}'", cmd))),
        }
    }
}

/// Write/read orchestration logic shared by all client connections.
pub struct LeaderCore {
    /// My identity.
    me: NodeInfo,

    /// Number of replica copies wanted beyond my own.
    tolerance: usize,

    /// Family membership registry.
    registry: Arc<FamilyRegistry>,

    /// Local blob storage.
    storage: Arc<StorageEngine>,

    /// Message location ledger.
    ledger: Arc<LocationLedger>,

    /// Round-robin replica placement.
    selector: ReplicaSelector,

    /// Peer RPC client.
    peer_api: Arc<dyn PeerApi>,
}

impl fmt::Debug for LeaderCore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LeaderCore")
            .field("me", &self.me)
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl LeaderCore {
    pub fn new(
        tolerance: usize,
        registry: Arc<FamilyRegistry>,
        storage: Arc<StorageEngine>,
        ledger: Arc<LocationLedger>,
        peer_api: Arc<dyn PeerApi>,
    ) -> Self {
        LeaderCore {
            me: registry.me().clone(),
            tolerance,
            registry,
            storage,
            ledger,
            selector: ReplicaSelector::new(),
            peer_api,
        }
    }

    /// Handles one protocol line. Returns `None` for blank lines, which get
    /// no reply.
    pub async fn handle_line(&self, line: &str) -> Option<ControlReply> {
        if line.trim().is_empty() {
            return None;
        }
        pf_info!(self.me; "command: {}", line.trim());

        let reply = match ControlCommand::parse(line) {
            Ok(ControlCommand::Set { id, text }) => self.handle_set(id, &text).await,
            Ok(ControlCommand::Get { id }) => self.handle_get(id).await,
            Err(e) => ControlReply::Error(e.to_string()),
        };
        Some(reply)
    }

    /// Handles `SET`: persist locally, replicate to the selected peers, then
    /// record the peers that confirmed in the ledger.
    pub async fn handle_set(&self, id: MessageId, text: &str) -> ControlReply {
        if let Err(e) = self.storage.write(id, text).await {
            pf_error!(self.me; "error saving {} locally: {}", id, e);
            return ControlReply::Error(e.to_string());
        }

        let candidates: Vec<NodeInfo> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|n| *n != self.me)
            .collect();
        let confirmed = self.replicate(id, text, &candidates).await;

        if let Err(e) = self.ledger.record(id, confirmed.clone()).await {
            return ControlReply::Error(e.to_string());
        }

        let wanted = self.tolerance.min(candidates.len());
        if confirmed.len() < wanted {
            pf_warn!(self.me; "message {} under-replicated: {} of {} copies confirmed",
                              id, confirmed.len(), wanted);
        }
        ControlReply::Ok
    }

    /// Sends the message to the targets picked out of `candidates`. Targets
    /// are contacted concurrently and fail independently. Returns the ones
    /// that acknowledged success, in selection order.
    async fn replicate(
        &self,
        id: MessageId,
        text: &str,
        candidates: &[NodeInfo],
    ) -> Vec<NodeInfo> {
        let targets = self.selector.select(candidates, self.tolerance);
        let acks = join_all(
            targets
                .iter()
                .map(|target| self.peer_api.store(target, id, text)),
        )
        .await;

        let mut confirmed = vec![];
        for (target, ack) in targets.into_iter().zip(acks) {
            match ack {
                Ok(ack) if ack.success => {
                    pf_debug!(self.me; "replicated {} to {}", id, target);
                    confirmed.push(target);
                }
                Ok(ack) => {
                    pf_warn!(self.me; "member {} failed to store {}: {}",
                                      target, id, ack.message);
                }
                Err(e) => {
                    pf_warn!(self.me; "error replicating {} to {}: {}",
                                      id, target, e);
                }
            }
        }
        confirmed
    }

    /// Handles `GET`: serve from local storage if possible, otherwise ask
    /// the recorded holders one by one.
    pub async fn handle_get(&self, id: MessageId) -> ControlReply {
        match self.storage.read(id).await {
            Ok(Some(text)) => {
                pf_debug!(self.me; "found {} locally", id);
                return ControlReply::Text(text);
            }
            Ok(None) => {
                pf_debug!(self.me; "{} not found locally, asking holders", id);
            }
            Err(e) => {
                pf_debug!(self.me; "local read of {} failed ({}), asking holders",
                                   id, e);
            }
        }

        match self.fetch_from_holders(id).await {
            Some(text) => ControlReply::Text(text),
            None => ControlReply::NotFound,
        }
    }

    /// Tries the ledger's holders of `id` in recorded order and returns the
    /// first non-empty copy found.
    async fn fetch_from_holders(&self, id: MessageId) -> Option<String> {
        let holders = self.ledger.holders(id)?;

        for holder in holders.iter().filter(|h| **h != self.me) {
            match self.peer_api.retrieve(holder, id).await {
                Ok(RetrieveOutcome::Found(text)) if !text.is_empty() => {
                    pf_debug!(self.me; "fetched {} from {}", id, holder);
                    return Some(text);
                }
                Ok(outcome) => {
                    pf_debug!(self.me; "holder {} has no usable copy of {}: {:?}",
                                       holder, id, outcome);
                }
                Err(e) => {
                    pf_warn!(self.me; "holder {} failed for {}: {}", holder, id, e);
                }
            }
        }
        None
    }
}

/// Accepts client control connections, one servant thread per connection.
pub struct ControlServer {
    /// My identity.
    me: NodeInfo,

    /// Join handle of the client acceptor thread.
    client_acceptor_handle: JoinHandle<()>,
}

impl fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlServer").field("me", &self.me).finish()
    }
}

// ControlServer public API implementation
impl ControlServer {
    /// Spawns the client acceptor thread on an already bound listener.
    pub fn new_and_setup(
        control_listener: TcpListener,
        core: Arc<LeaderCore>,
    ) -> Self {
        let me = core.me.clone();
        if let Ok(addr) = control_listener.local_addr() {
            pf_info!(me; "leader accepting client commands on '{}'", addr);
        }
        let client_acceptor_handle = tokio::spawn(
            Self::client_acceptor_thread(control_listener, core),
        );
        ControlServer {
            me,
            client_acceptor_handle,
        }
    }

    /// Stops accepting new client connections.
    pub fn shutdown(&self) {
        self.client_acceptor_handle.abort();
        pf_debug!(self.me; "control server shut down");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.client_acceptor_handle.abort();
    }
}

// ControlServer client_acceptor thread implementation
impl ControlServer {
    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        control_listener: TcpListener,
        core: Arc<LeaderCore>,
    ) {
        pf_debug!(core.me; "client_acceptor thread spawned");

        loop {
            let (stream, addr) = match control_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!(core.me; "error accepting client connection: {}", e);
                    continue;
                }
            };
            pf_info!(core.me; "accepted client {}", addr);

            let core = core.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::client_servant_thread(&core, stream).await {
                    pf_warn!(core.me; "client {} connection error: {}", addr, e);
                }
                pf_debug!(core.me; "client {} left", addr);
            });
        }
    }
}

// ControlServer client_servant thread implementation
impl ControlServer {
    /// Client servant thread function: answers lines until EOF. Bytes that
    /// are not valid UTF-8 are replaced with U+FFFD instead of ending the
    /// connection, so a garbled command or ID just gets an `ERROR` reply.
    async fn client_servant_thread(
        core: &LeaderCore,
        stream: TcpStream,
    ) -> Result<(), FamstoreError> {
        let (conn_read, mut conn_write) = stream.into_split();
        let mut conn_read = BufReader::new(conn_read);
        let mut line_buf: Vec<u8> = Vec::with_capacity(256);

        loop {
            line_buf.clear();
            if conn_read.read_until(b'\n', &mut line_buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&line_buf);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(reply) = core.handle_line(line).await {
                let mut out = reply.to_string();
                out.push('\n');
                conn_write.write_all(out.as_bytes()).await?;
                conn_write.flush().await?;
            }
        }
        Ok(())
    }
}
