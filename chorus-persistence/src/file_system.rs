use async_trait::async_trait;
use chorus_core::storage::{EpochStore, Snapshot, SnapshotStore, TransactionLog};
use chorus_core::{ChorusError, Epoch, Result, Transaction, Zxid};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const ACCEPTED_EPOCH_FILE: &str = "acceptedEpoch";
const CURRENT_EPOCH_FILE: &str = "currentEpoch";
const LOG_FILE: &str = "txnlog.dat";
const SNAPSHOT_FILE: &str = "snapshot.dat";

async fn ensure_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir).await.map_err(|e| {
            ChorusError::storage(format!("failed to create data directory: {}", e))
        })?;
    }
    Ok(())
}

/// Write a file atomically: temp file first, then rename over the target.
async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents)
        .await
        .map_err(|e| ChorusError::storage(format!("failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| ChorusError::storage(format!("failed to rename temp file: {}", e)))?;
    Ok(())
}

/// Epoch pair persisted as two small scalar files in the data directory,
/// replaced atomically on every write so a crash never leaves a torn value.
#[derive(Debug, Clone)]
pub struct FileEpochStore {
    data_dir: PathBuf,
}

impl FileEpochStore {
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        ensure_dir(&data_dir).await?;
        Ok(Self { data_dir })
    }

    async fn read_epoch(&self, file: &str) -> Result<Epoch> {
        let path = self.data_dir.join(file);
        if !path.exists() {
            return Ok(Epoch::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .map_err(|e| ChorusError::storage(format!("failed to read {}: {}", file, e)))?;
        let value = text
            .trim()
            .parse::<u32>()
            .map_err(|e| ChorusError::storage(format!("corrupt epoch file {}: {}", file, e)))?;
        Ok(Epoch::new(value))
    }

    async fn write_epoch(&self, file: &str, epoch: Epoch) -> Result<()> {
        let path = self.data_dir.join(file);
        atomic_write(&path, format!("{}\n", epoch.value()).as_bytes()).await?;
        debug!(file, epoch = epoch.value(), "persisted epoch");
        Ok(())
    }
}

#[async_trait]
impl EpochStore for FileEpochStore {
    async fn accepted_epoch(&self) -> Result<Epoch> {
        self.read_epoch(ACCEPTED_EPOCH_FILE).await
    }

    async fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()> {
        let existing = self.accepted_epoch().await?;
        if epoch < existing {
            return Err(ChorusError::storage(format!(
                "accepted epoch may not regress: {} < {}",
                epoch, existing
            )));
        }
        self.write_epoch(ACCEPTED_EPOCH_FILE, epoch).await
    }

    async fn current_epoch(&self) -> Result<Epoch> {
        self.read_epoch(CURRENT_EPOCH_FILE).await
    }

    async fn set_current_epoch(&self, epoch: Epoch) -> Result<()> {
        let accepted = self.accepted_epoch().await?;
        if epoch > accepted {
            return Err(ChorusError::storage(format!(
                "current epoch {} would exceed accepted epoch {}",
                epoch, accepted
            )));
        }
        let existing = self.current_epoch().await?;
        if epoch < existing {
            return Err(ChorusError::storage(format!(
                "current epoch may not regress: {} < {}",
                epoch, existing
            )));
        }
        self.write_epoch(CURRENT_EPOCH_FILE, epoch).await
    }
}

/// Append-only transaction log: length-prefixed bincode frames in a single
/// file. The tail zxid is cached after the first scan so appends stay O(1);
/// full reads decode the whole file. Retention and compaction belong to the
/// storage engine, not this core.
#[derive(Debug, Clone)]
pub struct FileLog {
    log_path: PathBuf,
    // None until the file has been scanned once; then Some(tail).
    tail: Arc<Mutex<Option<Option<Zxid>>>>,
}

impl FileLog {
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        ensure_dir(&data_dir).await?;
        Ok(Self {
            log_path: data_dir.join(LOG_FILE),
            tail: Arc::new(Mutex::new(None)),
        })
    }

    async fn cached_tail(&self) -> Result<Option<Zxid>> {
        if let Some(tail) = *self.tail.lock() {
            return Ok(tail);
        }
        let scanned = self.read_all().await?.last().map(|txn| txn.zxid);
        *self.tail.lock() = Some(scanned);
        Ok(scanned)
    }

    async fn read_all(&self) -> Result<Vec<Transaction>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read(&self.log_path)
            .await
            .map_err(|e| ChorusError::storage(format!("failed to read log: {}", e)))?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < raw.len() {
            if offset + 4 > raw.len() {
                return Err(ChorusError::storage("truncated log frame header"));
            }
            let len =
                u32::from_be_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
                    as usize;
            offset += 4;
            if offset + len > raw.len() {
                return Err(ChorusError::storage("truncated log frame body"));
            }
            let txn: Transaction = bincode::deserialize(&raw[offset..offset + len])
                .map_err(|e| ChorusError::storage(format!("corrupt log entry: {}", e)))?;
            entries.push(txn);
            offset += len;
        }
        Ok(entries)
    }
}

#[async_trait]
impl TransactionLog for FileLog {
    async fn append(&self, txn: &Transaction) -> Result<()> {
        if let Some(last) = self.cached_tail().await? {
            if txn.zxid <= last {
                return Err(ChorusError::storage(format!(
                    "log append out of order: {} after {}",
                    txn.zxid, last
                )));
            }
        }

        let encoded = bincode::serialize(txn)
            .map_err(|e| ChorusError::storage(format!("failed to encode log entry: {}", e)))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .map_err(|e| ChorusError::storage(format!("failed to open log: {}", e)))?;
        file.write_u32(encoded.len() as u32)
            .await
            .map_err(|e| ChorusError::storage(format!("failed to append log entry: {}", e)))?;
        file.write_all(&encoded)
            .await
            .map_err(|e| ChorusError::storage(format!("failed to append log entry: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| ChorusError::storage(format!("failed to flush log: {}", e)))?;
        *self.tail.lock() = Some(Some(txn.zxid));
        Ok(())
    }

    async fn read_from(&self, from: Zxid) -> Result<Vec<Transaction>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|txn| txn.zxid >= from)
            .collect())
    }

    async fn first_logged(&self) -> Result<Option<Zxid>> {
        Ok(self.read_all().await?.first().map(|txn| txn.zxid))
    }

    async fn last_logged(&self) -> Result<Option<Zxid>> {
        self.cached_tail().await
    }
}

/// Snapshot persisted as one bincode file, atomically replaced on save.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    snapshot_path: PathBuf,
}

impl FileSnapshotStore {
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        ensure_dir(&data_dir).await?;
        Ok(Self {
            snapshot_path: data_dir.join(SNAPSHOT_FILE),
        })
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let encoded = bincode::serialize(snapshot)
            .map_err(|e| ChorusError::storage(format!("failed to encode snapshot: {}", e)))?;
        atomic_write(&self.snapshot_path, &encoded).await?;
        debug!(at = %snapshot.last_zxid, "persisted snapshot");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&self.snapshot_path)
            .await
            .map_err(|e| ChorusError::storage(format!("failed to read snapshot: {}", e)))?;
        let snapshot: Snapshot = bincode::deserialize(&raw)
            .map_err(|e| ChorusError::storage(format!("corrupt snapshot: {}", e)))?;
        if !snapshot.verify_checksum() {
            return Err(ChorusError::storage("snapshot checksum mismatch"));
        }
        Ok(Some(snapshot))
    }
}
