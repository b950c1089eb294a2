//! Consensus message family and its wire codec.
//!
//! Every message starts with the same little-endian header:
//!
//! ```text
//! ┌─────────┬──────────────────┬──────────────────────┬──────────────────┐
//! │ type u8 │ block_index u32  │ validator_index u8   │ view_number u8   │
//! └─────────┴──────────────────┴──────────────────────┴──────────────────┘
//! ```
//!
//! followed by the variant body. Bodies are bincode-encoded with fixed-width
//! little-endian integers; lists carry a `u64` length prefix, hashes are 32
//! raw bytes and signatures 64 raw bytes.
//!
//! Decoding checks the sender ordinal against the validator count before the
//! body is interpreted, and enforces the structural invariants (no duplicate
//! transaction hashes, bounded collections, no trailing bytes).

use {
    crate::{config::DbftConfig, error::FormatError},
    bincode::Options,
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_signature::Signature,
    std::collections::HashSet,
};

/// Upper bound on an encoded message, enforced while decoding.
pub const MAX_PAYLOAD_SIZE: u64 = 2 * 1024 * 1024;

const CHANGE_VIEW_DOMAIN: &[u8] = b"dbft/change-view";

/// Bytes a validator signs when asking to leave `view_number` at
/// `block_index`. The reason is advisory and not covered, so the compact form
/// in a RecoveryMessage stays verifiable.
pub fn change_view_sign_data(
    block_index: u32,
    validator_index: u8,
    view_number: u8,
    timestamp: u64,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(CHANGE_VIEW_DOMAIN.len() + 4 + 1 + 1 + 8);
    data.extend_from_slice(CHANGE_VIEW_DOMAIN);
    data.extend_from_slice(&block_index.to_le_bytes());
    data.push(validator_index);
    data.push(view_number);
    data.extend_from_slice(&timestamp.to_le_bytes());
    data
}

/// Identifies the body that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ChangeView = 0x00,
    PrepareRequest = 0x20,
    PrepareResponse = 0x21,
    PreCommit = 0x22,
    Commit = 0x30,
    RecoveryRequest = 0x40,
    RecoveryMessage = 0x41,
}

impl TryFrom<u8> for MessageType {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::ChangeView,
            0x20 => Self::PrepareRequest,
            0x21 => Self::PrepareResponse,
            0x22 => Self::PreCommit,
            0x30 => Self::Commit,
            0x40 => Self::RecoveryRequest,
            0x41 => Self::RecoveryMessage,
            other => return Err(FormatError::UnknownMessageType(other)),
        })
    }
}

/// Why a validator asks to leave the current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ChangeViewReason {
    Timeout = 0x00,
    ChangeAgreement = 0x01,
    TxNotFound = 0x02,
    TxRejectedByPolicy = 0x03,
    TxInvalid = 0x04,
    BlockRejectedByPolicy = 0x05,
}

impl From<ChangeViewReason> for u8 {
    fn from(reason: ChangeViewReason) -> Self {
        reason as u8
    }
}

impl TryFrom<u8> for ChangeViewReason {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Timeout,
            0x01 => Self::ChangeAgreement,
            0x02 => Self::TxNotFound,
            0x03 => Self::TxRejectedByPolicy,
            0x04 => Self::TxInvalid,
            0x05 => Self::BlockRejectedByPolicy,
            other => return Err(FormatError::UnknownChangeViewReason(other)),
        })
    }
}

impl std::fmt::Display for ChangeViewReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// ── Message bodies ──────────────────────────────────────────────────────────

/// Request to move to `view_number + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeView {
    /// Sender's wall clock in milliseconds; makes repeated requests distinct.
    pub timestamp: u64,
    pub reason: ChangeViewReason,
    /// Sender's signature over [`change_view_sign_data`].
    pub signature: Signature,
}

/// The primary's block proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub version: u32,
    pub prev_hash: Hash,
    pub timestamp: u64,
    pub nonce: u64,
    pub transaction_hashes: Vec<Hash>,
    /// The primary's signature over the candidate header.
    pub signature: Signature,
}

/// A backup's endorsement of a PrepareRequest, identified by its payload hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub preparation_hash: Hash,
    /// Zero on the primary proposal track.
    pub round_id: u32,
    /// The sender's signature over the candidate header.
    pub signature: Signature,
}

/// Signature over the finalized block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub signature: Signature,
}

/// Endorsement on the fallback proposal track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCommit {
    pub preparation_hash: Hash,
    pub round_id: u32,
}

/// Ask peers for a [`RecoveryMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeViewCompact {
    pub validator_index: u8,
    /// View the ChangeView was sent from; the requested view is one higher.
    pub original_view_number: u8,
    pub timestamp: u64,
    /// The signature carried by the original ChangeView.
    pub signature: Signature,
}

impl ChangeViewCompact {
    pub fn sign_data(&self, block_index: u32) -> Vec<u8> {
        change_view_sign_data(
            block_index,
            self.validator_index,
            self.original_view_number,
            self.timestamp,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparationCompact {
    pub validator_index: u8,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCompact {
    pub view_number: u8,
    pub validator_index: u8,
    pub signature: Signature,
}

/// Snapshot of a node's round state for a peer that missed messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMessage {
    pub change_views: Vec<ChangeViewCompact>,
    /// The primary's proposal, when known.
    pub prepare_request: Option<PrepareRequest>,
    /// Hash the preparations endorse, sent only when the request is unknown.
    pub preparation_hash: Option<Hash>,
    pub preparations: Vec<PreparationCompact>,
    pub commits: Vec<CommitCompact>,
}

/// Closed set of consensus message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    ChangeView(ChangeView),
    PrepareRequest(PrepareRequest),
    PrepareResponse(PrepareResponse),
    PreCommit(PreCommit),
    Commit(Commit),
    RecoveryRequest(RecoveryRequest),
    RecoveryMessage(RecoveryMessage),
}

impl ConsensusMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ConsensusMessage::ChangeView(_) => MessageType::ChangeView,
            ConsensusMessage::PrepareRequest(_) => MessageType::PrepareRequest,
            ConsensusMessage::PrepareResponse(_) => MessageType::PrepareResponse,
            ConsensusMessage::PreCommit(_) => MessageType::PreCommit,
            ConsensusMessage::Commit(_) => MessageType::Commit,
            ConsensusMessage::RecoveryRequest(_) => MessageType::RecoveryRequest,
            ConsensusMessage::RecoveryMessage(_) => MessageType::RecoveryMessage,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::ChangeView(_) => "ChangeView",
            ConsensusMessage::PrepareRequest(_) => "PrepareRequest",
            ConsensusMessage::PrepareResponse(_) => "PrepareResponse",
            ConsensusMessage::PreCommit(_) => "PreCommit",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::RecoveryRequest(_) => "RecoveryRequest",
            ConsensusMessage::RecoveryMessage(_) => "RecoveryMessage",
        }
    }
}

// ── Payload envelope ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WireHeader {
    kind: u8,
    block_index: u32,
    validator_index: u8,
    view_number: u8,
}

/// A consensus message with its common header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusPayload {
    pub block_index: u32,
    pub validator_index: u8,
    pub view_number: u8,
    pub message: ConsensusMessage,
}

impl ConsensusPayload {
    pub fn new(
        block_index: u32,
        validator_index: u8,
        view_number: u8,
        message: ConsensusMessage,
    ) -> Self {
        Self {
            block_index,
            validator_index,
            view_number,
            message,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// For a ChangeView, the view it asks for. Not transmitted.
    pub fn new_view_number(&self) -> Option<u8> {
        match self.message {
            ConsensusMessage::ChangeView(_) => self.view_number.checked_add(1),
            _ => None,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::new();
        let header = WireHeader {
            kind: self.message_type() as u8,
            block_index: self.block_index,
            validator_index: self.validator_index,
            view_number: self.view_number,
        };
        wire_options().serialize_into(&mut buf, &header)?;
        match &self.message {
            ConsensusMessage::ChangeView(body) => wire_options().serialize_into(&mut buf, body)?,
            ConsensusMessage::PrepareRequest(body) => {
                wire_options().serialize_into(&mut buf, body)?
            }
            ConsensusMessage::PrepareResponse(body) => {
                wire_options().serialize_into(&mut buf, body)?
            }
            ConsensusMessage::PreCommit(body) => wire_options().serialize_into(&mut buf, body)?,
            ConsensusMessage::Commit(body) => wire_options().serialize_into(&mut buf, body)?,
            ConsensusMessage::RecoveryRequest(body) => {
                wire_options().serialize_into(&mut buf, body)?
            }
            ConsensusMessage::RecoveryMessage(body) => {
                wire_options().serialize_into(&mut buf, body)?
            }
        }
        Ok(buf)
    }

    /// SHA-256 of the encoded payload. Identifies a PrepareRequest in
    /// PrepareResponses and deduplicates recovery triggers.
    pub fn hash(&self) -> Result<Hash, FormatError> {
        Ok(solana_sha256_hasher::hash(&self.encode()?))
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
        .with_limit(MAX_PAYLOAD_SIZE)
}

// ── Codec ───────────────────────────────────────────────────────────────────

/// Decodes and validates consensus payloads for a fixed validator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCodec {
    validator_count: usize,
    max_transactions_per_block: usize,
}

impl MessageCodec {
    pub fn new(validator_count: usize, max_transactions_per_block: usize) -> Self {
        Self {
            validator_count,
            max_transactions_per_block,
        }
    }

    pub fn from_config(config: &DbftConfig) -> Self {
        Self::new(config.validators.len(), config.max_transactions_per_block)
    }

    pub fn validator_count(&self) -> usize {
        self.validator_count
    }

    pub fn encode(&self, payload: &ConsensusPayload) -> Result<Vec<u8>, FormatError> {
        payload.encode()
    }

    /// Decode wire bytes into a validated payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<ConsensusPayload, FormatError> {
        let mut reader = bytes;
        let header: WireHeader = wire_options().deserialize_from(&mut reader)?;
        // The sender must be a validator before anything else is read.
        self.check_index(header.validator_index)?;
        let message = match MessageType::try_from(header.kind)? {
            MessageType::ChangeView => {
                ConsensusMessage::ChangeView(wire_options().deserialize_from(&mut reader)?)
            }
            MessageType::PrepareRequest => {
                ConsensusMessage::PrepareRequest(wire_options().deserialize_from(&mut reader)?)
            }
            MessageType::PrepareResponse => {
                ConsensusMessage::PrepareResponse(wire_options().deserialize_from(&mut reader)?)
            }
            MessageType::PreCommit => {
                ConsensusMessage::PreCommit(wire_options().deserialize_from(&mut reader)?)
            }
            MessageType::Commit => {
                ConsensusMessage::Commit(wire_options().deserialize_from(&mut reader)?)
            }
            MessageType::RecoveryRequest => {
                ConsensusMessage::RecoveryRequest(wire_options().deserialize_from(&mut reader)?)
            }
            MessageType::RecoveryMessage => {
                ConsensusMessage::RecoveryMessage(wire_options().deserialize_from(&mut reader)?)
            }
        };
        if !reader.is_empty() {
            return Err(FormatError::TrailingBytes(reader.len()));
        }
        let payload = ConsensusPayload {
            block_index: header.block_index,
            validator_index: header.validator_index,
            view_number: header.view_number,
            message,
        };
        self.validate(&payload)?;
        Ok(payload)
    }

    /// Structural checks shared by decoding and recovery import.
    pub fn validate(&self, payload: &ConsensusPayload) -> Result<(), FormatError> {
        self.check_index(payload.validator_index)?;
        match &payload.message {
            ConsensusMessage::ChangeView(_) => {
                if payload.new_view_number().is_none() {
                    return Err(FormatError::ViewOverflow(payload.view_number));
                }
            }
            ConsensusMessage::PrepareRequest(request) => self.validate_request(request)?,
            ConsensusMessage::RecoveryMessage(recovery) => self.validate_recovery(recovery)?,
            ConsensusMessage::PrepareResponse(_)
            | ConsensusMessage::PreCommit(_)
            | ConsensusMessage::Commit(_)
            | ConsensusMessage::RecoveryRequest(_) => {}
        }
        Ok(())
    }

    fn check_index(&self, index: u8) -> Result<(), FormatError> {
        if usize::from(index) >= self.validator_count {
            return Err(FormatError::ValidatorIndexOutOfRange {
                index,
                count: self.validator_count,
            });
        }
        Ok(())
    }

    fn validate_request(&self, request: &PrepareRequest) -> Result<(), FormatError> {
        let count = request.transaction_hashes.len();
        if count > self.max_transactions_per_block {
            return Err(FormatError::TooManyTransactions {
                count,
                max: self.max_transactions_per_block,
            });
        }
        let mut seen = HashSet::with_capacity(count);
        for hash in &request.transaction_hashes {
            if !seen.insert(hash) {
                return Err(FormatError::DuplicateTransaction(*hash));
            }
        }
        Ok(())
    }

    fn validate_recovery(&self, recovery: &RecoveryMessage) -> Result<(), FormatError> {
        self.check_len("change_views", recovery.change_views.len())?;
        self.check_len("preparations", recovery.preparations.len())?;
        self.check_len("commits", recovery.commits.len())?;
        for change_view in &recovery.change_views {
            self.check_index(change_view.validator_index)?;
            if change_view.original_view_number == u8::MAX {
                return Err(FormatError::ViewOverflow(change_view.original_view_number));
            }
        }
        for preparation in &recovery.preparations {
            self.check_index(preparation.validator_index)?;
        }
        for commit in &recovery.commits {
            self.check_index(commit.validator_index)?;
        }
        if let Some(request) = &recovery.prepare_request {
            self.validate_request(request)?;
        }
        Ok(())
    }

    fn check_len(&self, field: &'static str, count: usize) -> Result<(), FormatError> {
        if count > self.validator_count {
            return Err(FormatError::OversizedCollection {
                field,
                count,
                max: self.validator_count,
            });
        }
        Ok(())
    }
}
