//! dBFT consensus configuration.
//!
//! Holds the validator list, block timing and the policy limits every node
//! must agree on. The configuration is loaded once at startup and passed by
//! value into the engine; it is never reloaded mid-round.

use {
    crate::quorum,
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    std::{collections::HashSet, fs, path::Path, time::Duration},
};

/// Largest validator set addressable by the `u8` validator index on the wire.
pub const MAX_VALIDATORS: usize = 255;

/// Configuration for the dBFT consensus engine.
///
/// All durations are in milliseconds. Defaults follow a 15-second block
/// interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbftConfig {
    /// Ordered validator identities. The position in this list is the
    /// validator's ordinal.
    #[serde(with = "pubkey_list")]
    pub validators: Vec<Pubkey>,

    /// Target block interval.
    /// Default: 15000.
    pub block_interval_ms: u64,

    /// Upper bound on transactions in a proposal, fee transaction included.
    /// Default: 512.
    pub max_transactions_per_block: usize,

    /// How far into the future a proposal timestamp may lie.
    /// Default: 8 block intervals.
    pub clock_skew_tolerance_ms: u64,

    /// Cap on the exponent of the per-view timeout backoff
    /// (`block_interval << min(view + 1, cap)`).
    /// Default: 10.
    pub max_backoff_exponent: u32,

    /// Block header version proposed and accepted by this node.
    /// Default: 0.
    pub block_version: u32,
}

impl Default for DbftConfig {
    fn default() -> Self {
        Self {
            validators: Vec::new(),
            block_interval_ms: 15_000,
            max_transactions_per_block: 512,
            clock_skew_tolerance_ms: 8 * 15_000,
            max_backoff_exponent: 10,
            block_version: 0,
        }
    }
}

impl DbftConfig {
    /// Default configuration over the given validator list.
    pub fn with_validators(validators: Vec<Pubkey>) -> Self {
        Self {
            validators,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            source: err,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Number of validators.
    pub fn validator_count(&self) -> usize {
        self.validators.len()
    }

    /// Maximum number of faulty validators tolerated.
    pub fn fault_tolerance(&self) -> usize {
        quorum::fault_tolerance(self.validators.len())
    }

    /// Votes needed to complete a phase.
    pub fn quorum(&self) -> usize {
        quorum::quorum(self.validators.len())
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_millis(self.clock_skew_tolerance_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validators.is_empty() {
            return Err(ConfigError::NoValidators);
        }
        if self.validators.len() > MAX_VALIDATORS {
            return Err(ConfigError::TooManyValidators(self.validators.len()));
        }
        let mut seen = HashSet::with_capacity(self.validators.len());
        for validator in &self.validators {
            if !seen.insert(validator) {
                return Err(ConfigError::DuplicateValidator(*validator));
            }
        }
        if self.block_interval_ms == 0 {
            return Err(ConfigError::InvalidBlockInterval);
        }
        if self.max_transactions_per_block == 0 {
            return Err(ConfigError::InvalidMaxTransactions);
        }
        if self.max_backoff_exponent == 0
            || self.block_interval_ms.leading_zeros() < self.max_backoff_exponent
        {
            return Err(ConfigError::InvalidBackoffExponent(
                self.max_backoff_exponent,
            ));
        }
        Ok(())
    }
}

/// Errors in dBFT configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("validator list must not be empty")]
    NoValidators,
    #[error("at most {MAX_VALIDATORS} validators are supported, got {0}")]
    TooManyValidators(usize),
    #[error("duplicate validator {0}")]
    DuplicateValidator(Pubkey),
    #[error("block_interval_ms must be > 0")]
    InvalidBlockInterval,
    #[error("max_transactions_per_block must be > 0")]
    InvalidMaxTransactions,
    #[error("max_backoff_exponent {0} is zero or overflows the block interval")]
    InvalidBackoffExponent(u32),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Validators are written as base58 strings in configuration files.
mod pubkey_list {
    use {
        serde::{de::Error, Deserialize, Deserializer, Serializer},
        solana_pubkey::Pubkey,
        std::str::FromStr,
    };

    pub fn serialize<S: Serializer>(keys: &[Pubkey], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(keys.iter().map(|key| key.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Pubkey>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|key| Pubkey::from_str(key).map_err(D::Error::custom))
            .collect()
    }
}
