//! Durable per-replica update logs.
//!
//! Each replica appends its updates to
//! `{deployment_dir}/{kind}/{replica_uuid}.jsonl` — one JSON record per
//! line, flushed before the endpoint returns. Replicas never touch the
//! model; the single writer replays these files.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use uuid::Uuid;

use mb_domain::error::Result;
use mb_domain::update::{UpdateKind, UpdateRecord};

struct LogFile {
    path: PathBuf,
    stream: File,
}

/// The three append-only streams of one replica.
pub struct UpdateLogger {
    replica_id: Uuid,
    feedback: Mutex<LogFile>,
    insertions: Mutex<LogFile>,
    deletions: Mutex<LogFile>,
}

impl UpdateLogger {
    /// Open the replica's log files, creating the per-kind directories.
    /// A fresh UUID per process keeps parallel replicas collision-free.
    pub fn open(deployment_dir: &Path) -> Result<Self> {
        let replica_id = Uuid::new_v4();
        let open = |kind: UpdateKind| -> Result<Mutex<LogFile>> {
            let dir = deployment_dir.join(kind.dir_name());
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(format!("{replica_id}.jsonl"));
            let stream = OpenOptions::new().create(true).append(true).open(&path)?;
            Ok(Mutex::new(LogFile { path, stream }))
        };
        Ok(Self {
            replica_id,
            feedback: open(UpdateKind::Feedback)?,
            insertions: open(UpdateKind::Insertions)?,
            deletions: open(UpdateKind::Deletions)?,
        })
    }

    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    /// Append one record to its stream and flush before returning.
    pub fn log(&self, record: &UpdateRecord) -> Result<()> {
        let file = match record.kind() {
            UpdateKind::Feedback => &self.feedback,
            UpdateKind::Insertions => &self.insertions,
            UpdateKind::Deletions => &self.deletions,
        };
        let mut guard = file.lock();
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        guard.stream.write_all(&line)?;
        guard.stream.flush()?;
        Ok(())
    }

    /// Path of the stream a given kind writes to (used by tests).
    pub fn path_for(&self, kind: UpdateKind) -> PathBuf {
        match kind {
            UpdateKind::Feedback => self.feedback.lock().path.clone(),
            UpdateKind::Insertions => self.insertions.lock().path.clone(),
            UpdateKind::Deletions => self.deletions.lock().path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_domain::update::FileInfo;

    #[test]
    fn records_land_in_their_kind_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logger = UpdateLogger::open(dir.path()).unwrap();

        logger
            .log(&UpdateRecord::Upvote {
                chunk_ids: vec![1],
                queries: vec!["q".into()],
            })
            .unwrap();
        logger
            .log(&UpdateRecord::Insert {
                documents: vec![FileInfo::local("/tmp/a.txt")],
            })
            .unwrap();
        logger
            .log(&UpdateRecord::Delete {
                doc_ids: vec!["a".into()],
            })
            .unwrap();

        for kind in UpdateKind::ALL {
            let path = logger.path_for(kind);
            assert!(path.starts_with(dir.path().join(kind.dir_name())));
            let text = std::fs::read_to_string(path).unwrap();
            assert_eq!(text.lines().count(), 1);
        }
    }

    #[test]
    fn two_replicas_never_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = UpdateLogger::open(dir.path()).unwrap();
        let b = UpdateLogger::open(dir.path()).unwrap();
        assert_ne!(a.replica_id(), b.replica_id());
        assert_ne!(
            a.path_for(UpdateKind::Feedback),
            b.path_for(UpdateKind::Feedback)
        );
    }

    #[test]
    fn lines_parse_back_into_records() {
        let dir = tempfile::tempdir().unwrap();
        let logger = UpdateLogger::open(dir.path()).unwrap();
        let record = UpdateRecord::Associate {
            sources: vec!["nda".into()],
            targets: vec!["confidentiality".into()],
        };
        logger.log(&record).unwrap();
        let text = std::fs::read_to_string(logger.path_for(UpdateKind::Feedback)).unwrap();
        let parsed: UpdateRecord = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed, record);
    }
}
