//! Durable round state.
//!
//! A validator that has sent a Commit must never endorse another header at
//! the same height, restarts included. The engine saves a [`RoundSnapshot`]
//! right before it broadcasts its Commit and reloads it on start.

use {
    crate::{
        error::StoreError,
        message::{CommitCompact, PreparationCompact, PrepareRequest},
        types::Transaction,
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    std::{
        fs,
        io::{self, Write},
        path::{Path, PathBuf},
        sync::{PoisonError, RwLock},
    },
};

/// Everything needed to resume a round this node committed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub version: u32,
    pub height: u32,
    /// Hash of the block the round builds on.
    pub prev_hash: Hash,
    pub view_number: u8,
    pub prepare_request: PrepareRequest,
    pub preparation_hash: Hash,
    /// Proposed transactions, in proposal order.
    pub transactions: Vec<Transaction>,
    /// Verified preparations, the primary's included.
    pub preparations: Vec<PreparationCompact>,
    /// Verified commits for this view, this node's own included.
    pub commits: Vec<CommitCompact>,
}

impl RoundSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Where the engine keeps its latest [`RoundSnapshot`].
pub trait ConsensusStore: Send + Sync {
    /// Durably replace the stored snapshot. Must not return before the
    /// snapshot would survive a crash.
    fn save(&self, snapshot: &RoundSnapshot) -> Result<(), StoreError>;

    /// The last saved snapshot, if any.
    fn load(&self) -> Result<Option<RoundSnapshot>, StoreError>;
}

/// Keeps the snapshot in memory. Survives an engine rebuild, not a process
/// restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<Option<RoundSnapshot>>,
}

impl ConsensusStore for MemoryStore {
    fn save(&self, snapshot: &RoundSnapshot) -> Result<(), StoreError> {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<RoundSnapshot>, StoreError> {
        Ok(self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Keeps the snapshot in a single file. Each save writes a temporary file
/// next to it and renames it into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl ConsensusStore for FileStore {
    fn save(&self, snapshot: &RoundSnapshot) -> Result<(), StoreError> {
        let bytes = snapshot.encode()?;
        let temp_path = self.path.with_extension("tmp");
        {
            let mut file =
                fs::File::create(&temp_path).map_err(|err| Self::io_error(&temp_path, err))?;
            file.write_all(&bytes)
                .and_then(|()| file.sync_all())
                .map_err(|err| Self::io_error(&temp_path, err))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|err| Self::io_error(&self.path, err))
    }

    fn load(&self) -> Result<Option<RoundSnapshot>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => RoundSnapshot::decode(&bytes).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error(&self.path, err)),
        }
    }
}
