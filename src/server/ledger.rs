//! Location ledger: which peers hold a replica of each message, backed by an
//! append-only text log.
//!
//! Log lines have the form `<id>: <port> <port> ...`. Replaying the log in
//! file order, with later lines for an ID overwriting earlier ones, yields
//! the in-memory map. All mutations go through a single logger thread, so
//! the order of in-memory updates always matches the order of log lines.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::server::{MessageId, NodeInfo};
use crate::utils::FamstoreError;

use dashmap::DashMap;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Action command to the logger thread.
#[derive(Debug)]
enum LogAction {
    /// Append a record line, then install it in memory.
    Append {
        id: MessageId,
        holders: Vec<NodeInfo>,
    },

    /// Rewrite the log with one line per live ID.
    Compact,
}

/// Action result returned by the logger thread.
#[derive(Debug, PartialEq, Eq)]
enum LogResult {
    /// `now_size` is the size of file after this.
    Append { now_size: u64 },

    /// `lines` is the number of lines kept.
    Compact { lines: usize, now_size: u64 },
}

type ActionReply = oneshot::Sender<Result<LogResult, FamstoreError>>;

/// Statistics of a startup replay.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct ReplayStats {
    /// Lines successfully applied.
    pub applied: usize,

    /// Lines skipped as corrupt.
    pub skipped: usize,

    /// Distinct IDs in memory afterwards.
    pub entries: usize,
}

/// The location ledger module.
#[derive(Debug)]
pub struct LocationLedger {
    /// My identity, for logging.
    me: NodeInfo,

    /// In-memory map from message ID -> ordered holder list.
    records: Arc<DashMap<MessageId, Vec<NodeInfo>>>,

    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(LogAction, ActionReply)>,

    /// Join handle of the logger thread.
    _logger_handle: JoinHandle<()>,
}

// LocationLedger public API implementation
impl LocationLedger {
    /// Creates the ledger backed by the log file at `path`, creating the file
    /// if absent, and replays its content into memory. Ports in the log are
    /// resolved against `host`. Spawns the logger thread.
    pub async fn new_and_setup(
        me: NodeInfo,
        path: &Path,
        host: &str,
    ) -> Result<(Self, ReplayStats), FamstoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!(me; "no previous ledger, created '{}'", path.display());
        }

        let records = Arc::new(DashMap::new());
        let stats = Self::replay(&me, path, host, &records).await?;
        pf_info!(me; "ledger replayed: {} lines applied, {} skipped, {} entries",
                     stats.applied, stats.skipped, stats.entries);

        let tail_clean = Self::ends_with_newline(path).await?;
        if !tail_clean {
            pf_warn!(me; "ledger ends with a partial line, next append starts fresh");
        }
        let backer_file = OpenOptions::new().append(true).open(path).await?;
        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let logger_handle = tokio::spawn(Self::logger_thread(
            me.clone(),
            path.to_path_buf(),
            backer_file,
            tail_clean,
            records.clone(),
            rx_log,
        ));

        Ok((
            LocationLedger {
                me,
                records,
                tx_log,
                _logger_handle: logger_handle,
            },
            stats,
        ))
    }

    /// Durably records that `holders` hold `id`, replacing any previous
    /// record. The in-memory entry is installed only after the log line has
    /// been written.
    pub async fn record(
        &self,
        id: MessageId,
        holders: Vec<NodeInfo>,
    ) -> Result<(), FamstoreError> {
        match self.submit_action(LogAction::Append { id, holders }).await? {
            LogResult::Append { now_size } => {
                pf_trace!(self.me; "ledger log size now {}", now_size);
                Ok(())
            }
            res => logged_err!(self.me; "unexpected log result {:?}", res),
        }
    }

    /// Rewrites the log to contain exactly one line per ID currently in
    /// memory. Returns the number of lines kept.
    pub async fn compact(&self) -> Result<usize, FamstoreError> {
        match self.submit_action(LogAction::Compact).await? {
            LogResult::Compact { lines, now_size } => {
                pf_info!(self.me; "ledger compacted to {} lines ({} bytes)",
                                  lines, now_size);
                Ok(lines)
            }
            res => logged_err!(self.me; "unexpected log result {:?}", res),
        }
    }

    /// Returns the holder list recorded for `id`, if any.
    pub fn holders(&self, id: MessageId) -> Option<Vec<NodeInfo>> {
        self.records.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of distinct IDs recorded.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn submit_action(
        &self,
        action: LogAction,
    ) -> Result<LogResult, FamstoreError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_log.send((action, tx_reply))?;
        rx_reply.await?
    }
}

// LocationLedger log line format helpers
impl LocationLedger {
    /// Formats one record line, without the trailing newline.
    pub(crate) fn format_line(id: MessageId, holders: &[NodeInfo]) -> String {
        let mut line = format!("{}:", id);
        for holder in holders {
            line.push(' ');
            line.push_str(&holder.port.to_string());
        }
        line
    }

    /// Parses one record line. Returns `Ok(None)` for blank lines.
    pub(crate) fn parse_line(
        line: &str,
        host: &str,
    ) -> Result<Option<(MessageId, Vec<NodeInfo>)>, FamstoreError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let Some((id_part, ports_part)) = line.split_once(':') else {
            return Err(FamstoreError(format!("missing ':' in '{}'", line)));
        };
        let id = id_part.trim().parse::<MessageId>()?;
        let holders = ports_part
            .split_whitespace()
            .map(|p| p.parse::<u16>().map(|port| NodeInfo::new(host, port)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((id, holders)))
    }

    /// Replays the whole log file into `records`, last line per ID winning.
    async fn replay(
        me: &NodeInfo,
        path: &Path,
        host: &str,
        records: &DashMap<MessageId, Vec<NodeInfo>>,
    ) -> Result<ReplayStats, FamstoreError> {
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut stats = ReplayStats::default();

        while let Some(line) = lines.next_line().await? {
            match Self::parse_line(&line, host) {
                Ok(Some((id, holders))) => {
                    records.insert(id, holders);
                    stats.applied += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    pf_warn!(me; "skipping corrupt ledger line '{}': {}", line, e);
                    stats.skipped += 1;
                }
            }
        }

        stats.entries = records.len();
        Ok(stats)
    }
}

// LocationLedger logger thread implementation
impl LocationLedger {
    /// Returns true if the file is empty or its last byte is a newline.
    async fn ends_with_newline(path: &Path) -> Result<bool, FamstoreError> {
        let mut file = File::open(path).await?;
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(true);
        }
        file.seek(SeekFrom::Start(len - 1)).await?;
        Ok(file.read_u8().await? == b'\n')
    }

    /// Appends a line to EOF and installs the record in memory. A failed
    /// write is rolled back to the previous length; if even that fails,
    /// `tail_clean` is cleared so the next line starts on a fresh line
    /// instead of being glued onto the partial one.
    async fn append_record(
        backer: &mut File,
        tail_clean: &mut bool,
        records: &DashMap<MessageId, Vec<NodeInfo>>,
        id: MessageId,
        holders: Vec<NodeInfo>,
    ) -> Result<u64, FamstoreError> {
        let mut line = String::new();
        if !*tail_clean {
            line.push('\n');
        }
        line.push_str(&Self::format_line(id, &holders));
        line.push('\n');

        let pre_len = backer.metadata().await?.len();
        let written = match backer.write_all(line.as_bytes()).await {
            Ok(()) => backer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            *tail_clean = backer.set_len(pre_len).await.is_ok() && *tail_clean;
            return Err(e.into());
        }

        *tail_clean = true;
        records.insert(id, holders);
        Ok(backer.metadata().await?.len())
    }

    /// Writes the compacted log to a sibling temp file and renames it over
    /// the original. Returns the reopened append handle.
    async fn compact_log(
        path: &Path,
        records: &DashMap<MessageId, Vec<NodeInfo>>,
    ) -> Result<(File, usize, u64), FamstoreError> {
        let mut entries: Vec<(MessageId, Vec<NodeInfo>)> = records
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);

        let mut content = String::new();
        for (id, holders) in &entries {
            content.push_str(&Self::format_line(*id, holders));
            content.push('\n');
        }

        let mut tmp_path: PathBuf = path.to_path_buf();
        tmp_path.set_extension("compacting");
        let mut tmp_file = File::create(&tmp_path).await?;
        tmp_file.write_all(content.as_bytes()).await?;
        tmp_file.sync_all().await?;
        drop(tmp_file);
        fs::rename(&tmp_path, path).await?;

        let backer = OpenOptions::new().append(true).open(path).await?;
        let now_size = backer.metadata().await?.len();
        Ok((backer, entries.len(), now_size))
    }

    /// Logger thread function.
    async fn logger_thread(
        me: NodeInfo,
        path: PathBuf,
        mut backer: File,
        mut tail_clean: bool,
        records: Arc<DashMap<MessageId, Vec<NodeInfo>>>,
        mut rx_log: mpsc::UnboundedReceiver<(LogAction, ActionReply)>,
    ) {
        pf_debug!(me; "ledger logger thread spawned");

        while let Some((action, tx_reply)) = rx_log.recv().await {
            let res = match action {
                LogAction::Append { id, holders } => {
                    Self::append_record(
                        &mut backer,
                        &mut tail_clean,
                        &records,
                        id,
                        holders,
                    )
                    .await
                        .map(|now_size| LogResult::Append { now_size })
                }
                LogAction::Compact => {
                    match Self::compact_log(&path, &records).await {
                        Ok((new_backer, lines, now_size)) => {
                            backer = new_backer;
                            tail_clean = true;
                            Ok(LogResult::Compact { lines, now_size })
                        }
                        Err(e) => Err(e),
                    }
                }
            };

            if let Err(ref e) = res {
                pf_error!(me; "error during ledger logging: {}", e);
            }
            if tx_reply.send(res).is_err() {
                pf_warn!(me; "ledger action requester went away");
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "ledger logger thread exited");
    }
}
