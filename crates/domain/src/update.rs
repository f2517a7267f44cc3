//! Update-log records — the durable, append-only event stream written by
//! deployment replicas and replayed by the single writer.
//!
//! Each record is one line of JSON with an `action` tag. Replicas write to
//! files named `{replica_uuid}.jsonl` under a per-kind directory so
//! parallel replicas never collide on a file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the bytes of a referenced file live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLocation {
    /// Uploaded through the API and staged under the deployment dir.
    Upload,
    /// A path on the shared filesystem.
    Local,
    S3,
    Azure,
    Gcp,
}

/// A document reference carried by an insert record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub location: FileLocation,
    /// Stable document id. Generated at insert time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl FileInfo {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            location: FileLocation::Local,
            doc_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Whether this file must be downloaded before parsing.
    pub fn is_cloud_hosted(&self) -> bool {
        matches!(
            self.location,
            FileLocation::S3 | FileLocation::Azure | FileLocation::Gcp
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Update records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One record of the update log. Closed set; the writer matches
/// exhaustively so adding a variant is a compile error everywhere it
/// matters.
///
/// All variants commute with each other: upvotes and associations are
/// additive feedback, inserts carry distinct doc ids, deletes are
/// by-id. The replay pipeline relies on this to apply records across
/// replica files without a total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UpdateRecord {
    Upvote {
        chunk_ids: Vec<u64>,
        queries: Vec<String>,
    },
    Associate {
        sources: Vec<String>,
        targets: Vec<String>,
    },
    ImplicitUpvote {
        chunk_id: u64,
        query: String,
        event_desc: String,
    },
    Insert {
        documents: Vec<FileInfo>,
    },
    Delete {
        doc_ids: Vec<String>,
    },
}

impl UpdateRecord {
    /// The log sub-directory this record belongs in.
    pub fn kind(&self) -> UpdateKind {
        match self {
            UpdateRecord::Upvote { .. }
            | UpdateRecord::Associate { .. }
            | UpdateRecord::ImplicitUpvote { .. } => UpdateKind::Feedback,
            UpdateRecord::Insert { .. } => UpdateKind::Insertions,
            UpdateRecord::Delete { .. } => UpdateKind::Deletions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Feedback,
    Insertions,
    Deletions,
}

impl UpdateKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Feedback => "feedback",
            Self::Insertions => "insertions",
            Self::Deletions => "deletions",
        }
    }

    pub const ALL: [UpdateKind; 3] = [Self::Feedback, Self::Insertions, Self::Deletions];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_with_action_tag() {
        let rec = UpdateRecord::Upvote {
            chunk_ids: vec![1, 7],
            queries: vec!["confidentiality".into(), "nda term".into()],
        };
        let line = serde_json::to_string(&rec).unwrap();
        assert!(line.contains("\"action\":\"upvote\""));
        let back: UpdateRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let line = r#"{"action":"rewind","doc_ids":["a"]}"#;
        assert!(serde_json::from_str::<UpdateRecord>(line).is_err());
    }

    #[test]
    fn kinds_map_to_directories() {
        let insert = UpdateRecord::Insert {
            documents: vec![FileInfo::local("/tmp/a.pdf")],
        };
        assert_eq!(insert.kind().dir_name(), "insertions");
        let del = UpdateRecord::Delete { doc_ids: vec!["a".into()] };
        assert_eq!(del.kind().dir_name(), "deletions");
        let assoc = UpdateRecord::Associate {
            sources: vec!["s".into()],
            targets: vec!["t".into()],
        };
        assert_eq!(assoc.kind().dir_name(), "feedback");
    }

    #[test]
    fn cloud_hosted_detection() {
        let mut f = FileInfo::local("/srv/share/doc.pdf");
        assert!(!f.is_cloud_hosted());
        f.location = FileLocation::S3;
        assert!(f.is_cloud_hosted());
    }
}
