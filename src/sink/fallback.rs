//! Local append-only fallback sink
//!
//! When the primary store is unavailable, batches land in daily files under
//! the fallback directory: one JSON object per line, named
//! `data_YYYYMMDD.jsonl` after the UTC date of the write. File names sort
//! lexicographically into chronological order, which is what the recovery
//! worker relies on. Archived files move into an `archive/` subdirectory,
//! uniquified with a `_HHMMSS` suffix on name collision.
//!
//! All file operations are synchronous `std::fs` work dispatched through
//! `tokio::task::spawn_blocking` so the async workers never block a runtime
//! thread on disk I/O.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SiphonError};
use crate::sample::Sample;
use crate::sink::SampleSink;

const FILE_PREFIX: &str = "data_";
const FILE_EXT: &str = "jsonl";
const ARCHIVE_DIR: &str = "archive";

pub struct FallbackSink {
    data_dir: PathBuf,
    archive_dir: PathBuf,
    /// Serializes appends so concurrent batches cannot interleave lines
    write_lock: Mutex<()>,
}

impl FallbackSink {
    /// Create the sink, making sure both directories exist. Runs at startup,
    /// before any worker task is live.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let archive_dir = data_dir.join(ARCHIVE_DIR);
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&archive_dir)?;
        Ok(Self {
            data_dir,
            archive_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    fn file_name_for(date: NaiveDate) -> String {
        format!("{}{}.{}", FILE_PREFIX, date.format("%Y%m%d"), FILE_EXT)
    }

    /// Path of the file a write issued right now would append to.
    pub fn current_path(&self) -> PathBuf {
        self.data_dir.join(Self::file_name_for(Utc::now().date_naive()))
    }

    /// Append a batch to the current day's file, creating it if absent.
    /// A best-effort flush happens before success is reported.
    pub async fn append(&self, batch: &[Sample]) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        // The target is derived per call so a batch written after UTC
        // midnight lands in the new day's file.
        let path = self.current_path();
        let mut buf = String::new();
        for sample in batch {
            buf.push_str(&serde_json::to_string(sample)?);
            buf.push('\n');
        }
        let count = batch.len();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(buf.as_bytes())?;
            file.flush()?;
            debug!(file = %path.display(), samples = count, "appended to fallback");
            Ok(())
        })
        .await
        .map_err(|e| SiphonError::Io(io::Error::other(e)))?
    }

    /// Pending fallback files, sorted chronologically (lexicographic on the
    /// YYYYMMDD component). Tolerates concurrent appends.
    pub async fn list_pending(&self) -> Result<Vec<PathBuf>> {
        let data_dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let mut files = Vec::new();
            for entry in fs::read_dir(&data_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(FILE_PREFIX) && name.ends_with(&format!(".{}", FILE_EXT)) {
                    files.push(entry.path());
                }
            }
            files.sort();
            Ok(files)
        })
        .await
        .map_err(|e| SiphonError::Io(io::Error::other(e)))?
    }

    /// Read every valid sample from a fallback file.
    ///
    /// Malformed lines are skipped with a warning; they never abort the
    /// read. An empty result for a non-empty file means the file is corrupt.
    pub async fn read_file(&self, path: &Path) -> Result<Vec<Sample>> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<Vec<Sample>> {
            let file = fs::File::open(&path)?;
            let reader = BufReader::new(file);
            let mut samples = Vec::new();
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Sample>(&line) {
                    Ok(sample) => samples.push(sample),
                    Err(e) => {
                        warn!(
                            file = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "skipping malformed fallback record"
                        );
                    }
                }
            }
            Ok(samples)
        })
        .await
        .map_err(|e| SiphonError::Io(io::Error::other(e)))?
    }

    /// Atomically move a fallback file into the archive directory.
    ///
    /// On name collision the current UTC time of day is appended before the
    /// extension, e.g. `data_20260314_152233.jsonl`.
    pub async fn archive(&self, path: &Path) -> Result<PathBuf> {
        let path = path.to_path_buf();
        let archive_dir = self.archive_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let file_name = path
                .file_name()
                .ok_or_else(|| SiphonError::Config(format!("not a file: {}", path.display())))?;
            let mut target = archive_dir.join(file_name);
            if target.exists() {
                let stem = target
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("data")
                    .to_string();
                let suffix = Utc::now().format("%H%M%S");
                target = archive_dir.join(format!("{}_{}.{}", stem, suffix, FILE_EXT));
            }
            fs::rename(&path, &target)?;
            debug!(from = %path.display(), to = %target.display(), "archived fallback file");
            Ok(target)
        })
        .await
        .map_err(|e| SiphonError::Io(io::Error::other(e)))?
    }

    /// Verify the data directory is writable by creating and deleting a
    /// probe file.
    pub async fn health_check(&self) -> Result<()> {
        let probe = self.data_dir.join(".probe");
        tokio::task::spawn_blocking(move || -> Result<()> {
            fs::write(&probe, b"probe")?;
            fs::remove_file(&probe)?;
            Ok(())
        })
        .await
        .map_err(|e| SiphonError::Io(io::Error::other(e)))?
    }

    /// Delete archived files older than the retention period. Returns the
    /// number of files removed.
    pub async fn purge_archive(&self, retention: Duration) -> Result<usize> {
        let archive_dir = self.archive_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let cutoff = SystemTime::now()
                .checked_sub(retention)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let mut removed = 0;
            for entry in fs::read_dir(&archive_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                if modified <= cutoff {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
            if removed > 0 {
                debug!(removed, "purged expired archive files");
            }
            Ok(removed)
        })
        .await
        .map_err(|e| SiphonError::Io(io::Error::other(e)))?
    }
}

#[async_trait]
impl SampleSink for FallbackSink {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn write(&self, batch: &[Sample]) -> Result<()> {
        self.append(batch).await
    }
}
