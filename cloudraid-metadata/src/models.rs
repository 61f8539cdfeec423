//! File records and lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier assigned by the metadata store
pub type FileId = u64;

/// Lifecycle state of a file
///
/// ```text
/// UPLOADING -> UPLOADED -> SPLITTING -> SPLITTED -> DISTRIBUTING -> DISTRIBUTED -> READY
///     ^                                                                              |
///     +----------------------------- new revision -----------------------------------+
///
/// any state except DELETING/DELETED -> DELETING -> DELETED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Uploading,
    Uploaded,
    Splitting,
    Splitted,
    Distributing,
    Distributed,
    Ready,
    Deleting,
    Deleted,
}

impl Default for FileStatus {
    fn default() -> Self {
        Self::Uploading
    }
}

impl FileStatus {
    /// Every state, in lifecycle order
    pub const ALL: [FileStatus; 9] = [
        FileStatus::Uploading,
        FileStatus::Uploaded,
        FileStatus::Splitting,
        FileStatus::Splitted,
        FileStatus::Distributing,
        FileStatus::Distributed,
        FileStatus::Ready,
        FileStatus::Deleting,
        FileStatus::Deleted,
    ];

    /// Next state on the main chain
    pub fn next(self) -> Option<FileStatus> {
        match self {
            Self::Uploading => Some(Self::Uploaded),
            Self::Uploaded => Some(Self::Splitting),
            Self::Splitting => Some(Self::Splitted),
            Self::Splitted => Some(Self::Distributing),
            Self::Distributing => Some(Self::Distributed),
            Self::Distributed => Some(Self::Ready),
            Self::Ready | Self::Deleting | Self::Deleted => None,
        }
    }

    /// Whether a record may move from `self` to `to`
    pub fn can_transition_to(self, to: FileStatus) -> bool {
        match (self, to) {
            (Self::Deleting, to) => to == Self::Deleted,
            (Self::Deleted, _) => false,
            (_, Self::Deleting) => true,
            (Self::Ready, Self::Uploading) => true,
            (from, to) => from.next() == Some(to),
        }
    }

    /// States between a finished upload and READY; the pipeline can resume these
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Uploaded | Self::Splitting | Self::Splitted | Self::Distributing | Self::Distributed
        )
    }

    pub fn is_deleting(self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "UPLOADING",
            Self::Uploaded => "UPLOADED",
            Self::Splitting => "SPLITTING",
            Self::Splitted => "SPLITTED",
            Self::Distributing => "DISTRIBUTING",
            Self::Distributed => "DISTRIBUTED",
            Self::Ready => "READY",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown file status: {}", s))
    }
}

/// One file known to the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub user_id: u64,
    /// Path relative to the user's directory, `/`-separated
    pub path: String,
    /// Shard base name, empty until the first successful split
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub status: FileStatus,
}

impl FileRecord {
    /// Path relative to the staging root: `"{user_id}/{path}"`
    pub fn staging_relative(&self) -> String {
        format!("{}/{}", self.user_id, self.path)
    }

    pub fn has_content(&self) -> bool {
        !self.content_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_chain_transitions() {
        let chain = [
            FileStatus::Uploading,
            FileStatus::Uploaded,
            FileStatus::Splitting,
            FileStatus::Splitted,
            FileStatus::Distributing,
            FileStatus::Distributed,
            FileStatus::Ready,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
        // no skipping ahead
        assert!(!FileStatus::Uploaded.can_transition_to(FileStatus::Splitted));
        assert!(!FileStatus::Uploading.can_transition_to(FileStatus::Ready));
    }

    #[test]
    fn test_revision_and_delete_transitions() {
        assert!(FileStatus::Ready.can_transition_to(FileStatus::Uploading));
        assert!(!FileStatus::Distributed.can_transition_to(FileStatus::Uploading));

        for status in FileStatus::ALL {
            let expected = !status.is_deleting();
            assert_eq!(status.can_transition_to(FileStatus::Deleting), expected, "{}", status);
        }
        assert!(FileStatus::Deleting.can_transition_to(FileStatus::Deleted));
        assert!(!FileStatus::Deleting.can_transition_to(FileStatus::Ready));
        assert!(!FileStatus::Deleted.can_transition_to(FileStatus::Uploading));
        assert!(!FileStatus::Ready.can_transition_to(FileStatus::Deleted));
    }

    #[test]
    fn test_display_and_parse() {
        for status in FileStatus::ALL {
            assert_eq!(status.to_string().parse::<FileStatus>().unwrap(), status);
        }
        assert_eq!("ready".parse::<FileStatus>().unwrap(), FileStatus::Ready);
        assert!("SPLITTINGG".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_in_progress() {
        let in_progress: Vec<_> = FileStatus::ALL
            .into_iter()
            .filter(|s| s.is_in_progress())
            .collect();
        assert_eq!(
            in_progress,
            vec![
                FileStatus::Uploaded,
                FileStatus::Splitting,
                FileStatus::Splitted,
                FileStatus::Distributing,
                FileStatus::Distributed,
            ]
        );
    }

    #[test]
    fn test_staging_relative() {
        let record = FileRecord {
            id: 1,
            user_id: 42,
            path: "docs/a.txt".into(),
            content_hash: String::new(),
            last_modified: Utc::now(),
            status: FileStatus::Uploading,
        };
        assert_eq!(record.staging_relative(), "42/docs/a.txt");
        assert!(!record.has_content());
    }
}
