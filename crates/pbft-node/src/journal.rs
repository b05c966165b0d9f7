//! Decision journal.
//!
//! Each replica dumps its committed log to `<dir>/replica-<i>.json` after
//! every executed slot. The journal is for inspection and offline recovery;
//! the live protocol never reads it back.

use std::path::{Path, PathBuf};

use pbft_types::{Decision, ReplicaId};
use tokio::fs;

use crate::error::Result;

/// A per-replica JSON file holding the full committed log.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(dir: impl AsRef<Path>, replica: ReplicaId) -> Self {
        Self {
            path: dir
                .as_ref()
                .join(format!("replica-{}.json", replica.as_u8())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the journal with `decisions`.
    ///
    /// The file is written beside the target and renamed over it, so a
    /// reader sees either the previous log or the new one.
    pub async fn write(&self, decisions: &[Decision]) -> Result<()> {
        let json = serde_json::to_vec_pretty(decisions)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json).await?;
        fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    /// Reads the journal back. A missing file is an empty log.
    pub async fn read(&self) -> Result<Vec<Decision>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use pbft_types::{ClientId, RequestId};
    use tempfile::tempdir;

    fn decision(sequence: u64) -> Decision {
        Decision {
            request: RequestId::new(ClientId::new(1), sequence),
            data: format!("op-{sequence}").into_bytes().into(),
        }
    }

    #[tokio::test]
    async fn rewrites_the_whole_log() {
        let dir = tempdir().expect("Failed to create temp dir");
        let journal = Journal::new(dir.path().join("nested"), ReplicaId::new(3));
        assert!(journal.path().ends_with("replica-3.json"));

        journal.write(&[decision(0)]).await.expect("first write");
        journal
            .write(&[decision(0), decision(1)])
            .await
            .expect("second write");

        let log = journal.read().await.expect("read");
        assert_eq!(log, vec![decision(0), decision(1)]);
        assert!(!journal.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_journal_reads_empty() {
        let dir = tempdir().expect("Failed to create temp dir");
        let journal = Journal::new(dir.path(), ReplicaId::new(0));
        assert!(journal.read().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn garbage_is_reported() {
        let dir = tempdir().expect("Failed to create temp dir");
        let journal = Journal::new(dir.path(), ReplicaId::new(1));
        std::fs::write(journal.path(), "not json").expect("write garbage");

        let err = journal.read().await.unwrap_err();
        assert!(matches!(err, NodeError::MalformedJournal(_)));
    }
}
