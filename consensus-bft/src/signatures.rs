//! Per-phase signature bookkeeping.
//!
//! Each phase (prepare, commit) holds one slot per validator ordinal. The
//! first signature written to a slot wins; a different signature from the
//! same validator for the same phase is an equivocation and is dropped.

use {
    crate::{
        error::{ConsensusError, FormatError, Result},
        quorum,
        types::Witness,
    },
    solana_signature::Signature,
};

/// The protocol phase a signature belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prepare,
    Commit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Commit => "commit",
        }
    }

    /// Prefix mixed into every signed message of this phase, so a signature
    /// from one phase never verifies in another.
    pub fn domain(&self) -> &'static [u8] {
        match self {
            Phase::Prepare => b"dbft/prepare",
            Phase::Commit => b"dbft/commit",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collects partial signatures for one phase, keyed by validator ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureAggregator {
    phase: Phase,
    slots: Vec<Option<Signature>>,
    count: usize,
}

impl SignatureAggregator {
    /// Create an empty aggregator for a set of `validator_count` validators.
    pub fn new(phase: Phase, validator_count: usize) -> Self {
        Self {
            phase,
            slots: vec![None; validator_count],
            count: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Record `signature` for `ordinal`.
    ///
    /// Returns `Ok(true)` if the slot was empty, `Ok(false)` if the same
    /// signature was already recorded, and `ConflictingVote` if a different
    /// one was. The stored signature is never replaced.
    pub fn add(&mut self, ordinal: usize, signature: Signature) -> Result<bool> {
        let validator_count = self.slots.len();
        let Some(slot) = self.slots.get_mut(ordinal) else {
            return Err(FormatError::ValidatorIndexOutOfRange {
                index: u8::try_from(ordinal).unwrap_or(u8::MAX),
                count: validator_count,
            }
            .into());
        };
        match slot.as_ref() {
            Some(existing) if *existing == signature => Ok(false),
            Some(_) => Err(ConsensusError::ConflictingVote {
                validator_index: u8::try_from(ordinal).unwrap_or(u8::MAX),
                phase: self.phase.as_str(),
            }),
            None => {
                *slot = Some(signature);
                self.count = self.count.saturating_add(1);
                Ok(true)
            }
        }
    }

    /// Signature recorded for `ordinal`, if any.
    pub fn get(&self, ordinal: usize) -> Option<&Signature> {
        self.slots.get(ordinal).and_then(Option::as_ref)
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        self.get(ordinal).is_some()
    }

    /// Number of filled slots.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn validator_count(&self) -> usize {
        self.slots.len()
    }

    /// True once at least `quorum(N)` slots are filled.
    pub fn has_quorum(&self) -> bool {
        self.count >= quorum::quorum(self.slots.len())
    }

    /// Filled slots in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Signature)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|sig| (i, sig)))
    }

    /// Build the block witness from the first `quorum(N)` signatures in
    /// ordinal order.
    pub fn assemble_witness(&self) -> Result<Witness> {
        let need = quorum::quorum(self.slots.len());
        if self.count < need {
            return Err(ConsensusError::IncompleteState {
                have: self.count,
                need,
            });
        }
        let signatures = self
            .iter()
            .take(need)
            .filter_map(|(i, sig)| u8::try_from(i).ok().map(|i| (i, *sig)))
            .collect();
        Ok(Witness { signatures })
    }

    /// Drop every slot for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(usize, &Signature) -> bool) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot.as_ref(), Some(sig) if !keep(i, sig)) {
                *slot = None;
            }
        }
        self.count = self.slots.iter().filter(|slot| slot.is_some()).count();
    }

    /// Empty every slot.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.count = 0;
    }
}
