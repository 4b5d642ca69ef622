use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use memmap2::Mmap;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::errors::{Result, StoreError};
use crate::record::Counter;

/// Entry header: CRC(4) + `KeyLen`(4) + Value(8) + Version(8)
pub const HEADER_SIZE: usize = 24;

fn encoded_len(record: &Counter) -> usize {
    HEADER_SIZE + record.id.len()
}

/// Serialize `record` at the end of `buf`, CRC included
fn encode_into(buf: &mut Vec<u8>, record: &Counter) {
    let start = buf.len();
    let entry_len = encoded_len(record);
    buf.resize(start + entry_len, 0);
    let entry = &mut buf[start..];

    entry[4..8].copy_from_slice(&(record.id.len() as u32).to_le_bytes());
    entry[8..16].copy_from_slice(&record.value.to_le_bytes());
    entry[16..24].copy_from_slice(&record.version.to_le_bytes());
    entry[HEADER_SIZE..].copy_from_slice(record.id.as_bytes());

    let mut hasher = Hasher::new();
    hasher.update(&entry[4..]);
    entry[0..4].copy_from_slice(&hasher.finalize().to_le_bytes());
}

/// Deserialize one entry with CRC verification
fn decode(data: &[u8]) -> Result<Counter> {
    if data.len() < HEADER_SIZE {
        return Err(StoreError::InvalidData("Entry too short".into()));
    }

    let stored_crc = u32::from_le_bytes(data[0..4].try_into()?);
    let mut hasher = Hasher::new();
    hasher.update(&data[4..]);
    let computed_crc = hasher.finalize();

    if stored_crc != computed_crc {
        return Err(StoreError::Corruption(
            format!("CRC mismatch: expected {stored_crc}, got {computed_crc}").into(),
        ));
    }

    let key_len = u32::from_le_bytes(data[4..8].try_into()?) as usize;
    let value = i64::from_le_bytes(data[8..16].try_into()?);
    let version = u64::from_le_bytes(data[16..24].try_into()?);

    let expected_len = HEADER_SIZE + key_len;
    if data.len() < expected_len {
        return Err(StoreError::InvalidData(
            format!("Entry incomplete: expected {expected_len} bytes, got {}", data.len()).into(),
        ));
    }

    let id = std::str::from_utf8(&data[HEADER_SIZE..expected_len])
        .map_err(|err| StoreError::InvalidData(format!("Key is not UTF-8: {err}").into()))?;

    Ok(Counter::new(id, value, version))
}

/// Intact prefix of a log file
#[derive(Debug, Default)]
pub struct Recovered {
    pub records: Vec<Counter>,
    /// Bytes covered by `records`; anything past it is torn or corrupt
    pub valid_len: u64,
}

/// Append-only log of accepted counter writes
pub struct Wal {
    file: File,
    offset: u64,
    write_buf: Vec<u8>,
}

impl Wal {
    /// Create or open a log file for appending
    pub async fn new(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;

        let metadata = file.metadata().await?;
        let offset = metadata.len();
        Ok(Self { file, offset, write_buf: Vec::new() })
    }

    /// Bytes written so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Append a record; does not return until `sync_data()` completes
    pub async fn append(&mut self, record: &Counter) -> Result<()> {
        self.append_batch(std::slice::from_ref(record)).await
    }

    /// Append several records with a single fsync
    pub async fn append_batch(&mut self, records: &[Counter]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        self.write_buf.clear();
        self.write_buf.reserve(records.iter().map(encoded_len).sum());
        for record in records {
            encode_into(&mut self.write_buf, record);
        }

        let start = self.offset;
        if let Err(err) = self.write_synced().await {
            // A failed append must never be replayed
            if let Err(rollback) = self.file.set_len(start).await {
                warn!(offset = start, "failed to roll back counter log: {rollback}");
            }
            return Err(err);
        }
        self.offset += self.write_buf.len() as u64;

        Ok(())
    }

    async fn write_synced(&mut self) -> Result<()> {
        self.file.write_all(&self.write_buf).await?;
        // Surfaces errors of the background write before the fsync
        self.file.flush().await?;
        self.sync().await
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.file.sync_data().await?;
        Ok(())
    }

    /// Replay every intact entry in file order.
    ///
    /// Replay stops at the first torn or corrupted entry; everything before it is returned.
    pub async fn recover(path: &Path) -> Result<Recovered> {
        let path = path.to_path_buf();

        // mmap is blocking, keep it off the executor
        tokio::task::spawn_blocking(move || {
            let file_std = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Recovered::default());
                }
                Err(err) => return Err(err.into()),
            };
            let mmap = unsafe { Mmap::map(&file_std)? };

            let mut records = Vec::new();
            let mut offset = 0;

            while offset + HEADER_SIZE <= mmap.len() {
                let header = &mmap[offset..offset + HEADER_SIZE];
                let key_len = u32::from_le_bytes(header[4..8].try_into()?) as usize;
                let total_len = HEADER_SIZE + key_len;

                if offset + total_len > mmap.len() {
                    warn!(offset, path = %path.display(), "torn entry at end of counter log");
                    break;
                }

                match decode(&mmap[offset..offset + total_len]) {
                    Ok(record) => records.push(record),
                    Err(StoreError::Corruption(msg)) => {
                        warn!(offset, path = %path.display(), "counter log corruption: {msg}");
                        break;
                    }
                    Err(err) => return Err(err),
                }

                offset += total_len;
            }

            Ok(Recovered { records, valid_len: offset as u64 })
        })
        .await
        .map_err(|err| {
            StoreError::Io(std::io::Error::other(format!("Log recovery task failed: {err}")))
        })?
    }

    /// Atomically replace the log at `path` with one holding only `records`.
    ///
    /// The new content is written and synced to a side file first, then renamed
    /// over `path`. Returns a log positioned at the end of the new file.
    pub async fn rewrite(path: &Path, records: &[Counter]) -> Result<Self> {
        let side_path = path.with_extension("compact");

        {
            let mut side = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&side_path)
                .await?;

            let mut buf = Vec::with_capacity(records.iter().map(encoded_len).sum());
            for record in records {
                encode_into(&mut buf, record);
            }
            side.write_all(&buf).await?;
            side.flush().await?;
            side.sync_all().await?;
        }

        tokio::fs::rename(&side_path, path).await?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            File::open(dir).await?.sync_all().await?;
        }

        Self::new(path.to_path_buf()).await
    }
}
