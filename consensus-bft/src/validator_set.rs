//! Ordered validator set.
//!
//! The position of a validator in the configured list is its ordinal. The
//! set is immutable for the duration of a round.

use {
    solana_pubkey::Pubkey,
    std::collections::HashMap,
};

/// An ordered set of validator identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    /// Validators in ordinal order.
    validators: Vec<Pubkey>,
    /// Fast lookup from pubkey to ordinal.
    index: HashMap<Pubkey, usize>,
}

impl ValidatorSet {
    /// Create a validator set. Order is preserved; a repeated key keeps its
    /// first ordinal for lookups.
    pub fn new(validators: Vec<Pubkey>) -> Self {
        let mut index = HashMap::with_capacity(validators.len());
        for (i, pubkey) in validators.iter().enumerate() {
            index.entry(*pubkey).or_insert(i);
        }
        Self { validators, index }
    }

    /// Returns the number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns true if the validator set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Returns the validator with the given ordinal.
    pub fn get(&self, ordinal: usize) -> Option<&Pubkey> {
        self.validators.get(ordinal)
    }

    /// Ordinal of `pubkey`, if it is a validator.
    pub fn index_of(&self, pubkey: &Pubkey) -> Option<usize> {
        self.index.get(pubkey).copied()
    }

    /// Check whether a key is in the set.
    pub fn contains(&self, pubkey: &Pubkey) -> bool {
        self.index.contains_key(pubkey)
    }

    /// Returns an iterator over validators in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = &Pubkey> {
        self.validators.iter()
    }

    pub fn pubkeys(&self) -> &[Pubkey] {
        &self.validators
    }
}
