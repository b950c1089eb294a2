//! Per-round consensus state.
//!
//! One [`ConsensusState`] lives inside the engine. It is rebuilt from the
//! ledger tip at every new height and advanced in place when the view
//! changes. Nothing outside the engine mutates it.

use {
    crate::{
        message::{ChangeViewCompact, PrepareRequest},
        quorum,
        signatures::{Phase, SignatureAggregator},
        types::{merkle_root, BlockHeader, Transaction},
        validator_set::ValidatorSet,
    },
    bitflags::bitflags,
    solana_hash::Hash,
    solana_signature::Signature,
    std::collections::HashMap,
};

bitflags! {
    /// Round progress flags, orthogonal to the coarse [`ConsensusRole`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RoleFlags: u8 {
        const IS_PRIMARY = 1 << 0;
        const REQUEST_SENT = 1 << 1;
        const REQUEST_RECEIVED = 1 << 2;
        const COMMIT_SENT = 1 << 3;
        const BLOCK_SENT = 1 << 4;
    }
}

/// What this node does in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusRole {
    /// Not a validator this round.
    Idle,
    Primary,
    Backup,
}

impl std::fmt::Display for ConsensusRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusRole::Idle => write!(f, "Idle"),
            ConsensusRole::Primary => write!(f, "Primary"),
            ConsensusRole::Backup => write!(f, "Backup"),
        }
    }
}

/// A PrepareResponse (or the primary's own PrepareRequest) as recorded,
/// before or after its signature could be checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preparation {
    pub preparation_hash: Hash,
    pub signature: Signature,
}

/// A Commit as recorded, tagged with the view it was sent in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEntry {
    pub view_number: u8,
    pub signature: Signature,
}

/// The mutable per-round data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusState {
    pub height: u32,
    pub view_number: u8,
    /// This node's ordinal, or -1 when it is not a validator.
    pub self_index: i32,
    pub primary_index: usize,
    pub validator_count: usize,

    pub version: u32,
    pub prev_hash: Hash,
    pub prev_timestamp: u64,

    /// Proposed transaction set, in proposal order.
    pub transaction_hashes: Vec<Hash>,
    /// Resolved transaction bodies.
    pub transactions: HashMap<Hash, Transaction>,
    pub nonce: u64,
    pub timestamp: u64,

    /// The primary's proposal for this view, once sent or received.
    pub prepare_request: Option<PrepareRequest>,
    /// Payload hash of `prepare_request`.
    pub preparation_hash: Option<Hash>,

    /// Raw preparations per ordinal, verified or not.
    pub preparations: Vec<Option<Preparation>>,
    /// Verified prepare signatures over the current header.
    pub prepare_signatures: SignatureAggregator,
    /// Raw commits per ordinal for this height, in any view.
    pub commits: Vec<Option<CommitEntry>>,
    /// Verified commit signatures over the current header.
    pub commit_signatures: SignatureAggregator,

    /// Latest view each validator asked for.
    pub expected_view: Vec<u8>,
    /// The ChangeView behind each `expected_view` entry.
    pub change_views: Vec<Option<ChangeViewCompact>>,

    /// Fallback-track endorsements keyed by (round id, ordinal).
    pub fallback_endorsements: HashMap<(u32, u8), Hash>,

    pub flags: RoleFlags,
}

impl ConsensusState {
    /// Fresh state for `height` on top of `tip`, at view 0.
    pub fn new(
        height: u32,
        validators: &ValidatorSet,
        self_index: Option<usize>,
        tip: &BlockHeader,
        version: u32,
    ) -> Self {
        let n = validators.len();
        let mut state = Self {
            height,
            view_number: 0,
            self_index: self_index
                .and_then(|i| i32::try_from(i).ok())
                .unwrap_or(-1),
            primary_index: 0,
            validator_count: n,
            version,
            prev_hash: tip.hash(),
            prev_timestamp: tip.timestamp,
            transaction_hashes: Vec::new(),
            transactions: HashMap::new(),
            nonce: 0,
            timestamp: 0,
            prepare_request: None,
            preparation_hash: None,
            preparations: vec![None; n],
            prepare_signatures: SignatureAggregator::new(Phase::Prepare, n),
            commits: vec![None; n],
            commit_signatures: SignatureAggregator::new(Phase::Commit, n),
            expected_view: vec![0; n],
            change_views: vec![None; n],
            fallback_endorsements: HashMap::new(),
            flags: RoleFlags::empty(),
        };
        state.assign_roles();
        state
    }

    /// Move to `view` within the same height, clearing every per-view slot.
    /// Raw commits and view-change announcements are kept.
    pub fn advance_view(&mut self, view: u8) {
        self.view_number = view;
        self.transaction_hashes.clear();
        self.transactions.clear();
        self.nonce = 0;
        self.timestamp = 0;
        self.prepare_request = None;
        self.preparation_hash = None;
        self.preparations.iter_mut().for_each(|p| *p = None);
        self.prepare_signatures.clear();
        self.commit_signatures.clear();
        self.fallback_endorsements.clear();
        self.flags = RoleFlags::empty();
        self.assign_roles();
    }

    fn assign_roles(&mut self) {
        self.primary_index =
            quorum::primary_index(self.height, self.view_number, self.validator_count)
                .unwrap_or(0);
        if self.my_index() == Some(self.primary_index) {
            self.flags.insert(RoleFlags::IS_PRIMARY);
        }
    }

    /// This node's ordinal, if it is a validator.
    pub fn my_index(&self) -> Option<usize> {
        usize::try_from(self.self_index).ok()
    }

    pub fn role(&self) -> ConsensusRole {
        if self.my_index().is_none() {
            ConsensusRole::Idle
        } else if self.flags.contains(RoleFlags::IS_PRIMARY) {
            ConsensusRole::Primary
        } else {
            ConsensusRole::Backup
        }
    }

    pub fn watch_only(&self) -> bool {
        self.my_index().is_none()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == ConsensusRole::Primary
    }

    pub fn is_backup(&self) -> bool {
        self.role() == ConsensusRole::Backup
    }

    pub fn request_sent_or_received(&self) -> bool {
        self.flags
            .intersects(RoleFlags::REQUEST_SENT | RoleFlags::REQUEST_RECEIVED)
    }

    pub fn commit_sent(&self) -> bool {
        self.flags.contains(RoleFlags::COMMIT_SENT)
    }

    pub fn block_sent(&self) -> bool {
        self.flags.contains(RoleFlags::BLOCK_SENT)
    }

    pub fn fault_tolerance(&self) -> usize {
        quorum::fault_tolerance(self.validator_count)
    }

    pub fn quorum(&self) -> usize {
        quorum::quorum(self.validator_count)
    }

    /// True while this node has asked for a view above the current one.
    pub fn view_changing(&self) -> bool {
        self.my_index()
            .and_then(|i| self.expected_view.get(i))
            .is_some_and(|expected| *expected > self.view_number)
    }

    /// Number of validators known to have committed at this height.
    pub fn count_committed(&self) -> usize {
        self.commits.iter().filter(|c| c.is_some()).count()
    }

    /// True once the proposal is known and every transaction is resolved.
    pub fn transactions_complete(&self) -> bool {
        self.request_sent_or_received()
            && self
                .transaction_hashes
                .iter()
                .all(|hash| self.transactions.contains_key(hash))
    }

    /// Hashes in the proposal that are not yet resolved.
    pub fn missing_transactions(&self) -> Vec<Hash> {
        self.transaction_hashes
            .iter()
            .filter(|hash| !self.transactions.contains_key(*hash))
            .copied()
            .collect()
    }

    /// True once this node has endorsed the current proposal.
    pub fn response_sent(&self) -> bool {
        self.my_index()
            .and_then(|i| self.preparations.get(i))
            .is_some_and(Option::is_some)
    }

    /// Candidate header for the current proposal.
    pub fn header(&self) -> Option<BlockHeader> {
        self.request_sent_or_received()
            .then(|| self.candidate_header())
    }

    /// Header built from the proposal fields as they stand, whether or not a
    /// proposal was accepted yet.
    pub fn candidate_header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash: self.prev_hash,
            merkle_root: merkle_root(&self.transaction_hashes),
            timestamp: self.timestamp,
            nonce: self.nonce,
            index: self.height,
            primary_index: u8::try_from(self.primary_index).unwrap_or(u8::MAX),
        }
    }

    /// Resolved transactions in proposal order.
    pub fn ordered_transactions(&self) -> Vec<Transaction> {
        self.transaction_hashes
            .iter()
            .filter_map(|hash| self.transactions.get(hash).cloned())
            .collect()
    }
}
