//! Line-protocol client endpoint for talking to the family leader.

use std::net::SocketAddr;

use crate::server::MessageId;
use crate::utils::FamstoreError;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Client connection to the leader's control port. Every sent line gets
/// exactly one reply line back.
pub struct ControlClient {
    /// Leader's control address.
    leader: SocketAddr,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Line reader over the read-half split.
    conn_read: Lines<BufReader<OwnedReadHalf>>,
}

impl ControlClient {
    /// Connects to the leader's control port.
    pub async fn connect(leader: SocketAddr) -> Result<Self, FamstoreError> {
        pf_debug!("c"; "connecting to leader '{}'...", leader);
        let stream = TcpStream::connect(leader).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(ControlClient {
            leader,
            conn_write: write_half,
            conn_read: BufReader::new(read_half).lines(),
        })
    }

    /// Leader address this client is connected to.
    pub fn leader(&self) -> SocketAddr {
        self.leader
    }

    /// Sends one raw protocol line and waits for its reply line. The line
    /// must not be blank, as blank lines get no reply, and must not contain
    /// line breaks other than a trailing one.
    pub async fn send_line(&mut self, line: &str) -> Result<String, FamstoreError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(FamstoreError::msg("refusing to send blank line"));
        }
        if line.contains(['\r', '\n']) {
            // would go out as several commands and desync the replies
            return Err(FamstoreError::msg("line contains a line break"));
        }

        let mut out = String::with_capacity(line.len() + 1);
        out.push_str(line);
        out.push('\n');
        self.conn_write.write_all(out.as_bytes()).await?;
        self.conn_write.flush().await?;

        match self.conn_read.next_line().await? {
            Some(reply) => Ok(reply),
            None => logged_err!("c"; "leader '{}' closed the connection",
                                     self.leader),
        }
    }

    /// Sends `SET <id> <text>`.
    pub async fn set(
        &mut self,
        id: MessageId,
        text: &str,
    ) -> Result<String, FamstoreError> {
        self.send_line(&format!("SET {} {}", id, text)).await
    }

    /// Sends `GET <id>`.
    pub async fn get(&mut self, id: MessageId) -> Result<String, FamstoreError> {
        self.send_line(&format!("GET {}", id)).await
    }
}
