//! Resumption checkpoints for in-flight transfers.
//!
//! One small JSON file per destination path. A checkpoint only ever records bytes
//! that were synced to the destination before it was written, so a crash can lose
//! progress but never claim bytes that are not on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::core::models::Digest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub confirmed_bytes: u64,
    /// Source signature at the time the transfer started.
    pub source_size: u64,
    pub source_modified: Option<DateTime<Utc>>,
    pub source_digest: Option<Digest>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Whether the source still looks like the file this checkpoint was taken against.
    pub fn matches_source(&self, size: u64, modified: Option<DateTime<Utc>>) -> bool {
        self.source_size == size && self.source_modified == modified
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, destination: &Path) -> PathBuf {
        let hash = blake3::hash(destination.as_os_str().as_encoded_bytes());
        self.dir.join(format!("{}.json", &hash.to_hex()[..32]))
    }

    /// Unreadable or corrupt checkpoints are treated as absent.
    pub fn load(&self, destination: &Path) -> Option<Checkpoint> {
        let path = self.path_for(destination);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read checkpoint, ignoring");
                return None;
            }
        };
        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(cp) if cp.destination == destination => Some(cp),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt checkpoint, ignoring");
                None
            }
        }
    }

    /// Write via temp file + rename so a crash never leaves a torn checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&checkpoint.destination);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint).map_err(io::Error::other)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
    }

    pub fn remove(&self, destination: &Path) -> io::Result<()> {
        match fs::remove_file(self.path_for(destination)) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn checkpoint(dest: &Path, confirmed: u64) -> Checkpoint {
        Checkpoint {
            source: PathBuf::from("/remote/backups/db.sql.gz"),
            destination: dest.to_path_buf(),
            confirmed_bytes: confirmed,
            source_size: 10,
            source_modified: None,
            source_digest: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn save_then_load() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path().join("cp"));
        let dest = temp.path().join("db.sql.gz");

        store.save(&checkpoint(&dest, 4)).unwrap();
        assert_eq!(store.load(&dest).unwrap().confirmed_bytes, 4);

        store.save(&checkpoint(&dest, 8)).unwrap();
        assert_eq!(store.load(&dest).unwrap().confirmed_bytes, 8);

        store.remove(&dest).unwrap();
        assert!(store.load(&dest).is_none());
        store.remove(&dest).unwrap();
    }

    #[test]
    fn corrupt_checkpoint_is_ignored() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path());
        let dest = temp.path().join("db.sql.gz");
        fs::write(store.path_for(&dest), b"{not json").unwrap();
        assert!(store.load(&dest).is_none());
    }

    #[test]
    fn source_signature_must_match() {
        let cp = checkpoint(Path::new("/tmp/x"), 4);
        assert!(cp.matches_source(10, None));
        assert!(!cp.matches_source(11, None));
        assert!(!cp.matches_source(10, Some(Utc::now())));
    }
}
