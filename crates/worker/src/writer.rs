//! Single-writer election and the update-log replay pipeline.
//!
//! Exactly one replica holds the exclusive lock on
//! `{artifact}/WRITER.lock` (fs2). The writer tails every replica's
//! `.jsonl` files ordered by (mtime, path), applies records to the
//! kernel, and saves snapshots atomically. Per-file offsets persist
//! next to the snapshot so a crash between append and apply replays
//! safely and a double-apply is impossible. A record that fails five
//! consecutive passes moves to a `.poison` file and the pipeline moves
//! on.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mb_domain::error::{Error, Result};
use mb_domain::update::{UpdateKind, UpdateRecord};

use crate::kernel::{parse_file, stage_file, ModelKernel};

const POISON_THRESHOLD: u32 = 5;
const MARKER_FILE: &str = "last_updated";
const OFFSETS_FILE: &str = "applied_offsets.json";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Writer election
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds the exclusive writer lock for the life of the process.
pub struct WriterLock {
    _file: std::fs::File,
}

impl WriterLock {
    /// Try to become the writer. `None` means another replica holds the
    /// lock and this process must serve read-only.
    pub fn try_acquire(artifact: &Path) -> Result<Option<Self>> {
        std::fs::create_dir_all(artifact)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(artifact.join("WRITER.lock"))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(_) => Ok(None),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending-update signal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared between the API layer (which appends) and the pipeline. Once
/// `batch_size` appends accumulate the pipeline runs without waiting
/// for its idle tick.
#[derive(Default)]
pub struct PendingUpdates {
    count: AtomicUsize,
    notify: Notify,
}

impl PendingUpdates {
    pub fn record_append(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn drain(&self) -> usize {
        self.count.swap(0, Ordering::Relaxed)
    }

    fn pending(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replay pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReplayPipeline {
    kernel: Arc<dyn ModelKernel>,
    artifact: PathBuf,
    deployment_dir: PathBuf,
    save_interval: Duration,
    batch_size: usize,
    /// Log files this much older than their last applied record may be
    /// deleted once fully applied (their replica is gone).
    stale_log_ttl: Duration,
    /// Absolute file path → number of lines already applied.
    offsets: Mutex<BTreeMap<String, u64>>,
    /// Consecutive failures per (file, line).
    failures: Mutex<HashMap<(String, u64), u32>>,
    pending: Arc<PendingUpdates>,
}

impl ReplayPipeline {
    pub fn new(
        kernel: Arc<dyn ModelKernel>,
        artifact: PathBuf,
        deployment_dir: PathBuf,
        save_interval: Duration,
        batch_size: usize,
        pending: Arc<PendingUpdates>,
    ) -> Result<Self> {
        let offsets_path = artifact.join(OFFSETS_FILE);
        let offsets = if offsets_path.exists() {
            let bytes = std::fs::read(&offsets_path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Internal(format!("corrupt offsets file: {e}")))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            kernel,
            artifact,
            deployment_dir,
            save_interval,
            batch_size: batch_size.max(1),
            stale_log_ttl: Duration::from_secs(3600),
            offsets: Mutex::new(offsets),
            failures: Mutex::new(HashMap::new()),
            pending,
        })
    }

    /// Run until cancelled: a pass every idle interval, or as soon as a
    /// full batch of appends accumulates.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Final pass so a clean shutdown leaves nothing behind.
                    if let Err(e) = self.process_once().await {
                        tracing::warn!(error = %e, "final replay pass failed");
                    }
                    return;
                }
                _ = tokio::time::sleep(self.save_interval) => {
                    if let Err(e) = self.process_once().await {
                        tracing::warn!(error = %e, "replay pass failed");
                    }
                }
                _ = self.pending.notify.notified() => {
                    if self.pending.pending() >= self.batch_size {
                        if let Err(e) = self.process_once().await {
                            tracing::warn!(error = %e, "replay pass failed");
                        }
                    }
                }
            }
        }
    }

    /// Log files under the deployment dir, ordered by (mtime, path).
    fn scan_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for kind in UpdateKind::ALL {
            let pattern = self
                .deployment_dir
                .join(kind.dir_name())
                .join("*.jsonl")
                .display()
                .to_string();
            let Ok(paths) = glob::glob(&pattern) else { continue };
            for path in paths.flatten() {
                let mtime = path
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((mtime, path));
            }
        }
        files.sort();
        files.into_iter().map(|(_, p)| p).collect()
    }

    /// One full pass over all log files. Returns how many records were
    /// applied.
    pub async fn process_once(&self) -> Result<usize> {
        self.pending.drain();
        let mut applied = 0usize;
        for file in self.scan_files() {
            applied += self.process_file(&file).await;
        }
        if applied > 0 {
            self.save()?;
        }
        self.cleanup_stale_logs();
        Ok(applied)
    }

    async fn process_file(&self, file: &Path) -> usize {
        let key = file.display().to_string();
        let start = *self.offsets.lock().get(&key).unwrap_or(&0);
        let Ok(content) = std::fs::read_to_string(file) else {
            tracing::warn!(file = %key, "cannot read update log");
            return 0;
        };

        let mut applied = 0usize;
        for (idx, line) in content.lines().enumerate() {
            let idx = idx as u64;
            if idx < start {
                continue;
            }
            if line.trim().is_empty() {
                self.offsets.lock().insert(key.clone(), idx + 1);
                continue;
            }
            let outcome = match serde_json::from_str::<UpdateRecord>(line) {
                Ok(record) => self.apply(&record).await,
                Err(e) => Err(Error::Internal(format!("malformed update record: {e}"))),
            };
            match outcome {
                Ok(()) => {
                    applied += 1;
                    self.offsets.lock().insert(key.clone(), idx + 1);
                    self.failures.lock().remove(&(key.clone(), idx));
                }
                Err(e) => {
                    let mut failures = self.failures.lock();
                    let count = failures.entry((key.clone(), idx)).or_insert(0);
                    *count += 1;
                    if *count >= POISON_THRESHOLD {
                        tracing::error!(
                            file = %key,
                            line = idx,
                            error = %e,
                            "record failed {POISON_THRESHOLD} consecutive passes, moving to poison file"
                        );
                        failures.remove(&(key.clone(), idx));
                        drop(failures);
                        if let Err(poison_err) = self.poison(file, line) {
                            tracing::error!(error = %poison_err, "cannot write poison file");
                        }
                        self.offsets.lock().insert(key.clone(), idx + 1);
                        // Offsets moved; count it so the pass persists them.
                        applied += 1;
                    } else {
                        tracing::warn!(
                            file = %key,
                            line = idx,
                            attempt = *count,
                            error = %e,
                            "update record failed, will retry next pass"
                        );
                        // Stop at the failed record; file order matters
                        // within one replica's log.
                        break;
                    }
                }
            }
        }
        applied
    }

    async fn apply(&self, record: &UpdateRecord) -> Result<()> {
        match record {
            UpdateRecord::Upvote { chunk_ids, queries } => {
                self.kernel.upvote(chunk_ids, queries)
            }
            UpdateRecord::ImplicitUpvote { chunk_id, query, .. } => {
                self.kernel.upvote(&[*chunk_id], std::slice::from_ref(query))
            }
            UpdateRecord::Associate { sources, targets } => {
                self.kernel.associate(sources, targets)
            }
            UpdateRecord::Insert { documents } => {
                let staging = self.deployment_dir.join("staging");
                let mut parsed = Vec::with_capacity(documents.len());
                for info in documents {
                    let local = stage_file(info, &staging).await?;
                    parsed.push(parse_file(info, &local)?);
                }
                self.kernel.insert(&parsed).map(|_| ())
            }
            UpdateRecord::Delete { doc_ids } => self.kernel.delete(doc_ids),
        }
    }

    fn poison(&self, file: &Path, line: &str) -> Result<()> {
        let poison_path = file.with_extension("jsonl.poison");
        let mut stream = OpenOptions::new()
            .create(true)
            .append(true)
            .open(poison_path)?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(())
    }

    /// Snapshot + offsets + marker, in that order. Offsets land after
    /// the snapshot so a crash between the two replays (idempotent)
    /// rather than skips.
    fn save(&self) -> Result<()> {
        self.kernel.save(&self.artifact)?;
        let offsets = self.offsets.lock().clone();
        let bytes = serde_json::to_vec_pretty(&offsets)?;
        let tmp = self.artifact.join("applied_offsets.json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.artifact.join(OFFSETS_FILE))?;
        std::fs::write(
            self.artifact.join(MARKER_FILE),
            chrono::Utc::now().to_rfc3339(),
        )?;
        Ok(())
    }

    /// Delete fully-applied log files whose replica stopped writing long
    /// ago. Offsets for deleted files are retained; a file name reusing
    /// a UUID never happens.
    fn cleanup_stale_logs(&self) {
        let offsets = self.offsets.lock().clone();
        for file in self.scan_files() {
            let key = file.display().to_string();
            let Some(&applied) = offsets.get(&key) else { continue };
            let Ok(content) = std::fs::read_to_string(&file) else { continue };
            if (content.lines().count() as u64) > applied {
                continue;
            }
            let stale = file
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .map(|age| age > self.stale_log_ttl)
                .unwrap_or(false);
            if stale {
                tracing::info!(file = %key, "removing fully applied log of terminated replica");
                if let Err(e) = std::fs::remove_file(&file) {
                    tracing::warn!(file = %key, error = %e, "cannot remove stale log");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replica-side snapshot watching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Poll the writer's marker file and invoke `reload` when it changes.
pub async fn watch_marker(
    artifact: PathBuf,
    poll: Duration,
    cancel: CancellationToken,
    reload: impl Fn() + Send + 'static,
) {
    let marker = artifact.join(MARKER_FILE);
    let mut last_seen = std::fs::read_to_string(&marker).ok();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll) => {
                let current = std::fs::read_to_string(&marker).ok();
                if current.is_some() && current != last_seen {
                    tracing::info!("snapshot marker changed, reloading model");
                    reload();
                    last_seen = current;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::RetrieverKernel;
    use crate::update_log::UpdateLogger;
    use mb_domain::update::FileInfo;

    struct Fixture {
        dir: tempfile::TempDir,
        kernel: Arc<RetrieverKernel>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("artifact")).unwrap();
            let kernel = Arc::new(RetrieverKernel::load(&dir.path().join("artifact")).unwrap());
            Self { dir, kernel }
        }

        fn artifact(&self) -> PathBuf {
            self.dir.path().join("artifact")
        }

        fn deployment(&self) -> PathBuf {
            self.dir.path().join("deployment")
        }

        fn pipeline(&self) -> ReplayPipeline {
            ReplayPipeline::new(
                self.kernel.clone(),
                self.artifact(),
                self.deployment(),
                Duration::from_secs(10),
                64,
                Arc::new(PendingUpdates::default()),
            )
            .unwrap()
        }

        fn snapshot_bytes(&self) -> (Vec<u8>, Vec<u8>) {
            (
                std::fs::read(self.artifact().join("index").join("index.json")).unwrap(),
                std::fs::read(self.artifact().join("feedback.json")).unwrap(),
            )
        }
    }

    fn write_doc(dir: &Path, name: &str, text: &str) -> String {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn writer_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = WriterLock::try_acquire(dir.path()).unwrap();
        assert!(first.is_some());
        let second = WriterLock::try_acquire(dir.path()).unwrap();
        assert!(second.is_none());
        drop(first);
        assert!(WriterLock::try_acquire(dir.path()).unwrap().is_some());
    }

    #[tokio::test]
    async fn replay_applies_inserts_feedback_and_deletes() {
        let fixture = Fixture::new();
        let doc_path = write_doc(
            &fixture.dir.path().join("docs"),
            "nda.txt",
            "Confidentiality obligations survive termination.\n\nThe term is five years.",
        );

        let logger = UpdateLogger::open(&fixture.deployment()).unwrap();
        let mut info = FileInfo::local(&doc_path);
        info.doc_id = Some("nda".into());
        logger.log(&UpdateRecord::Insert { documents: vec![info] }).unwrap();
        logger
            .log(&UpdateRecord::Upvote {
                chunk_ids: vec![0],
                queries: vec!["confidentiality".into()],
            })
            .unwrap();

        let pipeline = fixture.pipeline();
        let applied = pipeline.process_once().await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(fixture.kernel.len(), 2);

        logger
            .log(&UpdateRecord::Delete { doc_ids: vec!["nda".into()] })
            .unwrap();
        assert_eq!(pipeline.process_once().await.unwrap(), 1);
        assert_eq!(fixture.kernel.len(), 0);
    }

    #[tokio::test]
    async fn replaying_the_same_file_twice_is_idempotent() {
        let fixture = Fixture::new();
        let doc_path = write_doc(
            &fixture.dir.path().join("docs"),
            "a.txt",
            "alpha text\n\nbeta text",
        );

        let logger = UpdateLogger::open(&fixture.deployment()).unwrap();
        let mut info = FileInfo::local(&doc_path);
        info.doc_id = Some("a".into());
        logger.log(&UpdateRecord::Insert { documents: vec![info] }).unwrap();
        logger
            .log(&UpdateRecord::Upvote {
                chunk_ids: vec![1],
                queries: vec!["beta".into()],
            })
            .unwrap();

        let pipeline = fixture.pipeline();
        assert_eq!(pipeline.process_once().await.unwrap(), 2);
        let first = fixture.snapshot_bytes();

        // Same pipeline: offsets already past every record.
        assert_eq!(pipeline.process_once().await.unwrap(), 0);
        assert_eq!(fixture.snapshot_bytes(), first);

        // A fresh pipeline (restart) loads the persisted offsets and
        // also applies nothing.
        let restarted = fixture.pipeline();
        assert_eq!(restarted.process_once().await.unwrap(), 0);
        assert_eq!(fixture.snapshot_bytes(), first);
    }

    #[tokio::test]
    async fn poisoned_records_are_quarantined_after_five_failures() {
        let fixture = Fixture::new();
        let logger = UpdateLogger::open(&fixture.deployment()).unwrap();
        // Insert referencing a file that does not exist keeps failing.
        logger
            .log(&UpdateRecord::Insert {
                documents: vec![FileInfo::local("/nonexistent/missing.txt")],
            })
            .unwrap();

        let pipeline = fixture.pipeline();
        for _ in 0..POISON_THRESHOLD {
            pipeline.process_once().await.unwrap();
        }

        let log_path = logger.path_for(UpdateKind::Insertions);
        let poison_path = log_path.with_extension("jsonl.poison");
        assert!(poison_path.exists());
        let poisoned = std::fs::read_to_string(poison_path).unwrap();
        assert!(poisoned.contains("missing.txt"));

        // The pipeline has moved past the record.
        assert_eq!(pipeline.process_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_record_blocks_its_file_but_not_others() {
        let fixture = Fixture::new();
        let logger = UpdateLogger::open(&fixture.deployment()).unwrap();
        logger
            .log(&UpdateRecord::Insert {
                documents: vec![FileInfo::local("/nonexistent/missing.txt")],
            })
            .unwrap();
        logger
            .log(&UpdateRecord::Associate {
                sources: vec!["a".into()],
                targets: vec!["b".into()],
            })
            .unwrap();

        let pipeline = fixture.pipeline();
        // The doomed insert blocks the insertions file; the feedback
        // file still applies.
        let applied = pipeline.process_once().await.unwrap();
        assert_eq!(applied, 1);
    }
}
