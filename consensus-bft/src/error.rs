//! Error types for the dBFT consensus engine.
//!
//! Every error raised while handling a consensus message is local to that
//! message: the engine logs it and moves on. None of these ever escape the
//! serialized handler loop.

use {solana_hash::Hash, thiserror::Error};

/// A message could not be decoded or violates a structural invariant.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Failed to (de)serialize the message body.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// The header carries a type byte outside the closed message set.
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// A ChangeView carries an unknown reason byte.
    #[error("unknown change view reason: {0:#04x}")]
    UnknownChangeViewReason(u8),

    /// The sender ordinal does not exist in the validator set.
    #[error("validator index {index} out of range (validators: {count})")]
    ValidatorIndexOutOfRange {
        /// Claimed ordinal.
        index: u8,
        /// Size of the validator set.
        count: usize,
    },

    /// A PrepareRequest lists the same transaction twice.
    #[error("duplicate transaction hash {0}")]
    DuplicateTransaction(Hash),

    /// A PrepareRequest lists more transactions than a block may hold.
    #[error("too many transactions: {count} (max {max})")]
    TooManyTransactions {
        /// Number of hashes in the request.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A recovery collection is longer than the validator set.
    #[error("oversized {field}: {count} entries (max {max})")]
    OversizedCollection {
        /// Which collection overflowed.
        field: &'static str,
        /// Number of entries present.
        count: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Bytes remained after a complete message was decoded.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A ChangeView from view 255 has no successor view.
    #[error("view number {0} cannot be advanced")]
    ViewOverflow(u8),
}

/// The wallet could not produce a signature.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// The wallet holds no key for the requested identity.
    #[error("no signing key for {0}")]
    UnknownKey(solana_pubkey::Pubkey),

    /// The signing backend failed.
    #[error("signing failed: {0}")]
    Backend(String),
}

/// The consensus store could not save or load the round snapshot.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Errors raised while processing a consensus message or timer event.
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Malformed or oversized message.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// The message or timer belongs to a superseded height or view.
    #[error("stale round: got h={height} v={view}, current h={current_height} v={current_view}")]
    StaleRound {
        height: u32,
        view: u8,
        current_height: u32,
        current_view: u8,
    },

    /// Bad signature, or the sender may not send this message.
    #[error("unauthorized sender {validator_index}: {reason}")]
    UnauthorizedSender {
        validator_index: u8,
        reason: &'static str,
    },

    /// Quorum assembly was attempted before quorum was reached.
    #[error("incomplete state: have {have} signatures, need {need}")]
    IncompleteState { have: usize, need: usize },

    /// The sender already contributed different data for this phase.
    #[error("conflicting vote from validator {validator_index} in {phase}")]
    ConflictingVote {
        validator_index: u8,
        phase: &'static str,
    },

    /// The local wallet failed to sign.
    #[error("signing error: {0}")]
    Signing(#[from] SignerError),

    /// The round snapshot could not be persisted or restored.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ConsensusError {
    /// Stale traffic is expected and only worth a debug line.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleRound { .. })
    }
}

/// Convenience result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
