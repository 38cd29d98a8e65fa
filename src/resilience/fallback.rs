use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FallbackConfig;
use crate::error::{ResilienceError, Result, StorageError};

/// Degradation strategy executed when the primary path is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Durable record for later redelivery
    Queue,
    /// Append-only audit log, never replayed
    LocalStorage,
    /// Observability event only
    LogOnly,
    /// Observability event; the caller continues with reduced functionality
    Degraded,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::Queue => "queue",
            FallbackStrategy::LocalStorage => "local-storage",
            FallbackStrategy::LogOnly => "log-only",
            FallbackStrategy::Degraded => "degraded",
        }
    }
}

impl FromStr for FallbackStrategy {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queue" => Ok(FallbackStrategy::Queue),
            "local-storage" | "local_storage" => Ok(FallbackStrategy::LocalStorage),
            "log-only" | "log_only" => Ok(FallbackStrategy::LogOnly),
            "degraded" => Ok(FallbackStrategy::Degraded),
            other => Err(ResilienceError::Config(format!(
                "unknown fallback strategy '{}'",
                other
            ))),
        }
    }
}

/// On-disk record format, one per queue file or one per log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    /// RFC 3339 creation time
    pub timestamp: String,
    /// Dependency class the payload was meant for, e.g. "notification"
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl FallbackRecord {
    pub fn new(at: DateTime<Utc>, kind: impl Into<String>, data: Value) -> Self {
        Self {
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: kind.into(),
            data,
        }
    }
}

/// A queue record read back from disk
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRecord {
    /// File stem, unique per record
    pub id: String,
    pub path: PathBuf,
    pub record: FallbackRecord,
}

/// Result of running a fallback; never an error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackOutcome {
    pub success: bool,
    pub message: String,
    pub strategy: FallbackStrategy,
    /// Id of the durable queue record, when one was written
    pub record_id: Option<String>,
}

/// Counts returned by `replay_queue`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Records replayed and removed
    pub processed: usize,
    /// Records whose replay failed; left in the queue
    pub failed: usize,
}

/// Executes fallback strategies and owns the durable queue
#[derive(Debug, Clone)]
pub struct FallbackHandler {
    config: FallbackConfig,
}

impl FallbackHandler {
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }

    pub fn queue_dir(&self) -> &Path {
        &self.config.queue_dir
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    /// Run `strategy` for a payload bound to `dependency_class`.
    ///
    /// Persistence failures are reported as `success: false`; this never fails.
    pub async fn handle(
        &self,
        dependency_class: &str,
        payload: Value,
        strategy: FallbackStrategy,
    ) -> FallbackOutcome {
        let result = match strategy {
            FallbackStrategy::Queue => self.enqueue(dependency_class, payload).await.map(Some),
            FallbackStrategy::LocalStorage => self
                .append_local(dependency_class, payload)
                .await
                .map(|_| None),
            FallbackStrategy::LogOnly => {
                info!(
                    dependency = dependency_class,
                    payload = %payload,
                    "Dependency unavailable, request dropped after logging"
                );
                Ok(None)
            }
            FallbackStrategy::Degraded => {
                warn!(
                    dependency = dependency_class,
                    payload = %payload,
                    "Dependency unavailable, continuing in degraded mode"
                );
                Ok(None)
            }
        };

        let outcome = match result {
            Ok(record_id) => FallbackOutcome {
                success: true,
                message: match &record_id {
                    Some(id) => format!("queued record {} for {}", id, dependency_class),
                    None => format!("{} fallback applied for {}", strategy.as_str(), dependency_class),
                },
                strategy,
                record_id,
            },
            Err(err) => {
                error!(
                    dependency = dependency_class,
                    strategy = strategy.as_str(),
                    error = %err,
                    "Fallback persistence failed"
                );
                FallbackOutcome {
                    success: false,
                    message: err.to_string(),
                    strategy,
                    record_id: None,
                }
            }
        };

        crate::fallback_event!(dependency_class, strategy, outcome.success);
        outcome
    }

    /// Write one durable record; temp file plus rename keeps readers from seeing partial files
    async fn enqueue(&self, dependency_class: &str, payload: Value) -> Result<String> {
        let dir = &self.config.queue_dir;
        fs::create_dir_all(dir).await?;

        let now = Utc::now();
        let id = format!("{}-{}", now.format("%Y%m%dT%H%M%S%.6fZ"), Uuid::new_v4().simple());
        let record = FallbackRecord::new(now, dependency_class, payload);
        let bytes = serde_json::to_vec_pretty(&record)?;

        let tmp_path = dir.join(format!(".{}.tmp", id));
        let path = dir.join(format!("{}.json", id));
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!(dependency = dependency_class, record_id = %id, "Queued fallback record");
        Ok(id)
    }

    async fn append_local(&self, dependency_class: &str, payload: Value) -> Result<()> {
        let dir = &self.config.storage_dir;
        fs::create_dir_all(dir).await?;

        let record = FallbackRecord::new(Utc::now(), dependency_class, payload);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let path = dir.join(format!("{}.log", file_safe(dependency_class)));
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Queue files in timestamp order; a missing directory is an empty queue
    async fn queue_entries(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.config.queue_dir;
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().map(|ext| ext == "json").unwrap_or(false)
                && !path
                    .file_name()
                    .map(|name| name.to_string_lossy().starts_with('.'))
                    .unwrap_or(true);
            if is_record {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn read_record(path: &Path, id: &str, claimed: &Path) -> Result<QueuedRecord> {
        let bytes = fs::read(claimed).await?;
        let record: FallbackRecord = serde_json::from_slice(&bytes).map_err(|_| {
            ResilienceError::Storage(StorageError::CorruptRecord(path.display().to_string()))
        })?;
        Ok(QueuedRecord {
            id: id.to_string(),
            path: path.to_path_buf(),
            record,
        })
    }

    /// Take exclusive ownership of one record by renaming it out of the queue.
    ///
    /// `None` means another drainer claimed it first.
    async fn claim(path: &Path) -> Result<Option<(String, PathBuf)>> {
        let id = match path.file_stem() {
            Some(stem) => stem.to_string_lossy().into_owned(),
            None => return Ok(None),
        };
        let claimed = path.with_file_name(format!(".{}.draining", id));
        match fs::rename(path, &claimed).await {
            Ok(()) => Ok(Some((id, claimed))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(record_id = %id, "Queue record already claimed");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Put a claimed record back so a later drain sees it again
    async fn release(path: &Path, claimed: &Path) {
        if let Err(err) = fs::rename(claimed, path).await {
            error!(path = %path.display(), error = %err, "Could not return record to the queue");
        }
    }

    async fn discard(id: &str, claimed: &Path) {
        if let Err(err) = fs::remove_file(claimed).await {
            error!(record_id = %id, error = %err, "Could not delete drained queue record");
        }
    }

    /// Number of records waiting in the queue
    pub async fn queued_len(&self) -> Result<usize> {
        Ok(self.queue_entries().await?.len())
    }

    /// Remove every queued record and hand them back for the caller to replay.
    ///
    /// Each record is claimed before it is read, so overlapping drains split
    /// the queue between them and no record is returned twice. Corrupt files
    /// are logged and left in place.
    pub async fn drain_queue(&self) -> Result<Vec<QueuedRecord>> {
        let mut drained = Vec::new();

        for path in self.queue_entries().await? {
            let (id, claimed) = match Self::claim(&path).await {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Could not claim queue record");
                    continue;
                }
            };
            match Self::read_record(&path, &id, &claimed).await {
                Ok(queued) => {
                    Self::discard(&id, &claimed).await;
                    drained.push(queued);
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Skipping unreadable queue record");
                    Self::release(&path, &claimed).await;
                }
            }
        }

        info!(processed = drained.len(), "Fallback queue drained");
        Ok(drained)
    }

    /// Replay each queued record with `replay`; only successful replays are removed
    pub async fn replay_queue<F, Fut>(&self, mut replay: F) -> Result<ReplaySummary>
    where
        F: FnMut(QueuedRecord) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut summary = ReplaySummary::default();

        for path in self.queue_entries().await? {
            let (id, claimed) = match Self::claim(&path).await {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Could not claim queue record");
                    summary.failed += 1;
                    continue;
                }
            };
            let queued = match Self::read_record(&path, &id, &claimed).await {
                Ok(queued) => queued,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Skipping unreadable queue record");
                    Self::release(&path, &claimed).await;
                    summary.failed += 1;
                    continue;
                }
            };

            match replay(queued).await {
                Ok(()) => {
                    Self::discard(&id, &claimed).await;
                    summary.processed += 1;
                }
                Err(err) => {
                    warn!(record_id = %id, error = %err, "Replay failed, record kept");
                    Self::release(&path, &claimed).await;
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            failed = summary.failed,
            "Fallback queue replay finished"
        );
        Ok(summary)
    }

    /// Detach `op` on the runtime. The caller never observes its outcome; a
    /// failure or panic is swallowed and written to the local log instead.
    pub fn spawn_best_effort<F>(&self, dependency: &str, payload: Value, op: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = self.clone();
        let dependency = dependency.to_string();

        tokio::spawn(async move {
            let failure = match AssertUnwindSafe(op).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err.to_string(),
                Err(_) => "operation panicked".to_string(),
            };

            debug!(dependency = %dependency, error = %failure, "Best-effort operation failed");
            let outcome = handler
                .handle(
                    &dependency,
                    json!({ "payload": payload, "error": failure }),
                    FallbackStrategy::LocalStorage,
                )
                .await;
            if !outcome.success {
                error!(dependency = %dependency, "Best-effort failure could not be persisted");
            }
        })
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
