//! Per-node durable message blob storage.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::server::NodeInfo;
use crate::utils::FamstoreError;

use bytes::Bytes;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Message ID type, as given by clients.
pub type MessageId = i32;

/// How a blob write reaches the file. All strategies leave identical bytes
/// on disk; they differ in the amount of intermediate buffering.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommitStrategy {
    /// Accumulate in a user-space buffer, then flush once.
    Buffered,

    /// Write the encoded bytes straight to the file.
    Unbuffered,

    /// Hand an owned byte buffer to the file and let it drain the cursor.
    Direct,
}

impl CommitStrategy {
    /// Parse config string into CommitStrategy enum, case-insensitively.
    pub fn parse_name(name: &str) -> Option<Self> {
        match &name.to_lowercase()[..] {
            "buffered" => Some(Self::Buffered),
            "unbuffered" => Some(Self::Unbuffered),
            "direct" | "channel" => Some(Self::Direct),
            _ => None,
        }
    }
}

impl fmt::Display for CommitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Buffered => write!(f, "buffered"),
            Self::Unbuffered => write!(f, "unbuffered"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Durable blob storage module. Each message ID maps to one file under a
/// directory named after the node's listening port, so that co-located
/// nodes never share files.
#[derive(Debug)]
pub struct StorageEngine {
    /// My identity, for logging.
    me: NodeInfo,

    /// Namespace directory holding this node's blobs.
    dir: PathBuf,

    /// Commit strategy used for every write.
    strategy: CommitStrategy,

    /// Whether to call `fdatasync()` after each write.
    sync: bool,
}

impl StorageEngine {
    /// Creates a new storage engine rooted at `root`, preparing the
    /// namespace directory for `me` if it does not exist yet.
    pub async fn new_and_setup(
        me: NodeInfo,
        root: &Path,
        strategy: CommitStrategy,
        sync: bool,
    ) -> Result<Self, FamstoreError> {
        let dir = root.join(format!("messages_{}", me.port));
        if !fs::try_exists(&dir).await? {
            fs::create_dir_all(&dir).await?;
            pf_info!(me; "created storage dir '{}'", dir.display());
        } else {
            pf_debug!(me; "storage dir '{}' already exists", dir.display());
        }

        Ok(StorageEngine {
            me,
            dir,
            strategy,
            sync,
        })
    }

    /// Returns the namespace directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the commit strategy in use.
    pub fn strategy(&self) -> CommitStrategy {
        self.strategy
    }

    #[inline]
    fn blob_path(&self, id: MessageId) -> PathBuf {
        self.dir.join(format!("{}.txt", id))
    }

    /// Writes (creating or overwriting) the blob for `id`.
    pub async fn write(
        &self,
        id: MessageId,
        text: &str,
    ) -> Result<(), FamstoreError> {
        let path = self.blob_path(id);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        let file = match self.strategy {
            CommitStrategy::Buffered => {
                let mut writer = BufWriter::new(file);
                writer.write_all(text.as_bytes()).await?;
                writer.flush().await?;
                writer.into_inner()
            }
            CommitStrategy::Unbuffered => {
                let mut file = file;
                file.write_all(text.as_bytes()).await?;
                file
            }
            CommitStrategy::Direct => {
                let mut file = file;
                let mut buf = Bytes::copy_from_slice(text.as_bytes());
                file.write_all_buf(&mut buf).await?;
                file
            }
        };
        Self::commit(file, self.sync).await?;

        pf_debug!(self.me; "saved blob {} ({} bytes, {})",
                           id, text.len(), self.strategy);
        Ok(())
    }

    /// Makes sure written bytes have left the process, and optionally reached
    /// the device.
    async fn commit(mut file: File, sync: bool) -> Result<(), FamstoreError> {
        file.flush().await?;
        if sync {
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Reads the blob for `id`. Returns `Ok(None)` if it was never written;
    /// any other failure is an `Err`.
    pub async fn read(
        &self,
        id: MessageId,
    ) -> Result<Option<String>, FamstoreError> {
        match fs::read_to_string(self.blob_path(id)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    async fn prepare_engine(
        root: &str,
        port: u16,
        strategy: CommitStrategy,
    ) -> Result<StorageEngine, FamstoreError> {
        let root = Path::new(root);
        if fs::try_exists(root).await? {
            fs::remove_dir_all(root).await?;
        }
        StorageEngine::new_and_setup(
            NodeInfo::new("127.0.0.1", port),
            root,
            strategy,
            false,
        )
        .await
    }

    #[test]
    fn parse_strategy_names() {
        assert_eq!(
            CommitStrategy::parse_name("Buffered"),
            Some(CommitStrategy::Buffered)
        );
        assert_eq!(
            CommitStrategy::parse_name("unbuffered"),
            Some(CommitStrategy::Unbuffered)
        );
        assert_eq!(
            CommitStrategy::parse_name("channel"),
            Some(CommitStrategy::Direct)
        );
        assert_eq!(CommitStrategy::parse_name("mmap"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn roundtrip_all_strategies() -> Result<(), FamstoreError> {
        for (i, strategy) in [
            CommitStrategy::Buffered,
            CommitStrategy::Unbuffered,
            CommitStrategy::Direct,
        ]
        .into_iter()
        .enumerate()
        {
            let root = format!("/tmp/test-famstore-storage-{}", i);
            let engine = prepare_engine(&root, 5555, strategy).await?;
            engine.write(100, "hello family").await?;
            assert_eq!(engine.read(100).await?, Some("hello family".into()));
            let on_disk = fs::read(engine.dir().join("100.txt")).await?;
            assert_eq!(on_disk, b"hello family");
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn overwrite_shorter() -> Result<(), FamstoreError> {
        let engine = prepare_engine(
            "/tmp/test-famstore-storage-ow",
            5556,
            CommitStrategy::Unbuffered,
        )
        .await?;
        engine.write(-3, "a fairly long first version").await?;
        engine.write(-3, "short").await?;
        assert_eq!(engine.read(-3).await?, Some("short".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn missing_is_none() -> Result<(), FamstoreError> {
        let engine = prepare_engine(
            "/tmp/test-famstore-storage-nf",
            5557,
            CommitStrategy::Buffered,
        )
        .await?;
        assert_eq!(engine.read(777).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn namespaces_isolated() -> Result<(), FamstoreError> {
        let root = "/tmp/test-famstore-storage-ns";
        let a = prepare_engine(root, 5560, CommitStrategy::Direct).await?;
        let b = StorageEngine::new_and_setup(
            NodeInfo::new("127.0.0.1", 5561),
            Path::new(root),
            CommitStrategy::Direct,
            true,
        )
        .await?;
        a.write(1, "from a").await?;
        assert_eq!(b.read(1).await?, None);
        b.write(1, "from b").await?;
        assert_eq!(a.read(1).await?, Some("from a".into()));
        assert_eq!(b.read(1).await?, Some("from b".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn write_fails_without_dir() -> Result<(), FamstoreError> {
        let engine = prepare_engine(
            "/tmp/test-famstore-storage-gone",
            5562,
            CommitStrategy::Buffered,
        )
        .await?;
        fs::remove_dir_all(engine.dir()).await?;
        assert!(engine.write(1, "lost").await.is_err());
        Ok(())
    }
}
