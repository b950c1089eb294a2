//! dBFT Consensus Engine
//!
//! This crate implements delegated Byzantine Fault Tolerance (dBFT), a
//! rotating-leader, two-phase commit protocol for a fixed set of `N`
//! validators that tolerates `f = (N - 1) / 3` Byzantine members:
//!
//! 1. **Prepare**: the primary for `(height, view)` proposes a block header
//!    and transaction set; backups endorse it with PrepareResponses.
//! 2. **Commit**: once `M = N - f` endorsements are in, every validator
//!    signs a Commit. `M` Commits finalize the block.
//!
//! A stalled or faulty primary is replaced by a ChangeView quorum, with
//! per-view exponential timeout backoff. Nodes that fall behind catch up
//! through RecoveryRequest / RecoveryMessage exchange. A node that committed
//! persists its round through a [`ConsensusStore`] and resumes it on restart.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ConsensusService                │
//! │  ┌────────────────────────────────────────┐  │
//! │  │            ConsensusEngine             │  │
//! │  │  ┌──────────────┐  ┌────────────────┐  │  │
//! │  │  │ConsensusState│  │TimeoutScheduler│  │  │
//! │  │  └──────────────┘  └────────────────┘  │  │
//! │  │  ┌──────────────┐  ┌────────────────┐  │  │
//! │  │  │ MessageCodec │  │  Signature     │  │  │
//! │  │  │              │  │  Aggregators   │  │  │
//! │  │  └──────────────┘  └────────────────┘  │  │
//! │  └────────────────────────────────────────┘  │
//! │    Ledger · Mempool · Wallet · Transport      │
//! └──────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod message;
pub mod quorum;
mod recovery;
pub mod service;
pub mod signatures;
pub mod state;
pub mod store;
pub mod timeout;
pub mod types;
pub mod validator_set;

// Re-exports for convenience
pub use config::{ConfigError, DbftConfig};
pub use engine::{ConsensusEngine, EngineOutput};
pub use error::{ConsensusError, FormatError, Result, SignerError, StoreError};
pub use interfaces::{
    ConsensusEvent, KeypairWallet, Ledger, Mempool, TransactionVerdict, Transport, Wallet,
};
pub use message::{
    ChangeViewReason, ConsensusMessage, ConsensusPayload, MessageCodec, MessageType,
};
pub use quorum::{fault_tolerance, is_primary, primary_index, quorum};
pub use service::ConsensusService;
pub use signatures::{Phase, SignatureAggregator};
pub use state::{ConsensusRole, ConsensusState, RoleFlags};
pub use store::{ConsensusStore, FileStore, MemoryStore, RoundSnapshot};
pub use timeout::{ScheduledTimeout, Timeout, TimeoutScheduler};
pub use types::{Block, BlockHeader, Transaction, Witness};
pub use validator_set::ValidatorSet;
