//! # Consensus State Storage
//!
//! Persists the minimum state a node needs to rejoin consensus after a crash:
//! its view, its committed index and hash, and the prepared certificates it
//! must carry into the next view change.
//!
//! All operations are synchronous blocking I/O. The runner writes on every
//! `Action::PersistState`, before any message produced by the same event is
//! sent, so a restarted node never contradicts what it already signed.

use crate::metrics;
use parking_lot::Mutex;
use pbft_core::PersistedState;
use pbft_messages::PreparedCertificate;
use pbft_types::{BlockNumber, Hash, View};
use sbor::prelude::BasicSbor;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt consensus state: {0}")]
    Corrupt(String),

    #[error("SBOR encode error: {0}")]
    Encode(String),
}

/// Durable home of [`PersistedState`].
pub trait ConsensusStore: Send + Sync {
    /// Load the last saved state. A fresh store returns `PersistedState::default()`.
    fn load(&self) -> Result<PersistedState, StorageError>;

    /// Replace the saved state. Must be durable when it returns.
    fn save(&self, state: &PersistedState) -> Result<(), StorageError>;
}

/// On-disk encoding of [`PersistedState`].
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
struct StoredState {
    view: View,
    committed_index: BlockNumber,
    committed_hash: Hash,
    prepared: Vec<PreparedCertificate>,
}

impl From<&PersistedState> for StoredState {
    fn from(state: &PersistedState) -> Self {
        Self {
            view: state.view,
            committed_index: state.committed_index,
            committed_hash: state.committed_hash,
            prepared: state.prepared.clone(),
        }
    }
}

impl From<StoredState> for PersistedState {
    fn from(stored: StoredState) -> Self {
        Self {
            view: stored.view,
            committed_index: stored.committed_index,
            committed_hash: stored.committed_hash,
            prepared: stored.prepared,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════

/// Store that lives as long as the process. Survives runner restarts within
/// one test, which is what the integration tests need.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<PersistedState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsensusStore for MemoryStore {
    fn load(&self) -> Result<PersistedState, StorageError> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistedState) -> Result<(), StorageError> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// File store
// ═══════════════════════════════════════════════════════════════════════════

/// Single-file store. Writes go to a sibling temp file that is synced and
/// renamed over the previous state, so a crash leaves either the old or the
/// new state on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    /// Serializes writers sharing this store.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError {
    let path = path.to_path_buf();
    move |source| StorageError::Io { path, source }
}

impl ConsensusStore for FileStore {
    fn load(&self) -> Result<PersistedState, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default())
            }
            Err(source) => {
                return Err(StorageError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let stored: StoredState = sbor::basic_decode(&bytes)
            .map_err(|e| StorageError::Corrupt(format!("{:?}", e)))?;
        let state = PersistedState::from(stored);

        tracing::info!(
            path = %self.path.display(),
            view = state.view.0,
            committed_index = state.committed_index.0,
            prepared = state.prepared.len(),
            "Loaded consensus state"
        );
        Ok(state)
    }

    fn save(&self, state: &PersistedState) -> Result<(), StorageError> {
        let start = Instant::now();
        let encoded = sbor::basic_encode(&StoredState::from(state))
            .map_err(|e| StorageError::Encode(format!("{:?}", e)))?;

        let _guard = self.write_lock.lock();
        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).map_err(io_error(&temp))?;
        file.write_all(&encoded).map_err(io_error(&temp))?;
        file.sync_all().map_err(io_error(&temp))?;
        fs::rename(&temp, &self.path).map_err(io_error(&self.path))?;

        metrics::record_storage_write(start.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_messages::PrePrepareMsg;
    use pbft_types::test_utils::test_keypair;
    use pbft_types::{NodeIndex, Proposal};
    use tempfile::TempDir;

    fn sample_state() -> PersistedState {
        let key = test_keypair(1);
        let hash = Hash::from_bytes(b"prepared");
        let proposal = Proposal::new(
            BlockNumber(6),
            View(2),
            hash,
            b"block".to_vec(),
            1,
            NodeIndex(0),
            &key,
        );
        PersistedState {
            view: View(3),
            committed_index: BlockNumber(5),
            committed_hash: Hash::from_bytes(b"committed"),
            prepared: vec![PreparedCertificate {
                pre_prepare: PrePrepareMsg::new(View(2), proposal, NodeIndex(0), false, &key),
                prepares: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_memory_store_starts_at_genesis() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_genesis());
        store.save(&sample_state()).unwrap();
        assert_eq!(store.load().unwrap(), sample_state());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node").join("consensus.state");

        let store = FileStore::open(&path).unwrap();
        assert!(store.load().unwrap().is_genesis());
        store.save(&sample_state()).unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap(), sample_state());
        assert!(!reopened.temp_path().exists());
    }

    #[test]
    fn test_file_store_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("state")).unwrap();

        store.save(&sample_state()).unwrap();
        let mut next = sample_state();
        next.view = View(4);
        next.prepared.clear();
        store.save(&next).unwrap();

        assert_eq!(store.load().unwrap(), next);
    }

    #[test]
    fn test_file_store_reports_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, b"not sbor").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(matches!(store.load(), Err(StorageError::Corrupt(_))));
    }
}
