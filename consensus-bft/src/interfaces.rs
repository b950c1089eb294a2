//! Collaborators consumed by the consensus engine.
//!
//! The engine never talks to the network, the chain store or the key store
//! directly. It queries these traits for local reads and hands slow effects
//! (relay, block submission, transaction fetches) back to the service, which
//! performs them outside the engine.

use {
    crate::{
        error::SignerError,
        timeout::Timeout,
        types::{Block, BlockHeader, Transaction},
    },
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    solana_signer::Signer,
    std::sync::Arc,
};

/// Outcome of local transaction verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionVerdict {
    Valid,
    /// Malformed, double-spending or otherwise invalid.
    Invalid,
    /// Valid but refused by local policy.
    RejectedByPolicy,
}

/// Read access to the chain plus block submission.
pub trait Ledger: Send + Sync {
    /// Header of the highest persisted block.
    fn tip_header(&self) -> BlockHeader;

    /// Whether the transaction is already on chain.
    fn contains_transaction(&self, hash: &Hash) -> bool;

    /// Verify a transaction against current chain state.
    fn verify_transaction(&self, _transaction: &Transaction) -> TransactionVerdict {
        TransactionVerdict::Valid
    }

    /// Persist and relay a finalized block. Returns false if the ledger
    /// refused it.
    fn submit_block(&self, block: Block) -> bool;
}

/// The local transaction pool.
pub trait Mempool: Send + Sync {
    /// Candidate transactions in priority order.
    fn get_pool(&self) -> Vec<Transaction>;

    fn get_transaction(&self, hash: &Hash) -> Option<Transaction>;

    /// The primary's own fee transaction, placed first in its proposal.
    fn fee_transaction(&self, _primary: &Pubkey, _nonce: u64) -> Option<Transaction> {
        None
    }
}

/// Peer-to-peer delivery of opaque payloads.
pub trait Transport: Send + Sync {
    /// Broadcast an encoded consensus payload. Returns false if it was not
    /// accepted for relay.
    fn relay(&self, payload: &[u8]) -> bool;

    /// Ask peers for transactions missing from the local pool.
    fn request_missing(&self, hashes: &[Hash]);
}

/// Raw signing capability.
pub trait Wallet: Send + Sync {
    /// Sign `data` with the key identified by `key`.
    fn sign(&self, data: &[u8], key: &Pubkey) -> Result<Signature, SignerError>;

    /// Check `signature` over `data` against `pubkey`.
    fn verify(&self, data: &[u8], signature: &Signature, pubkey: &Pubkey) -> bool;
}

/// Events pushed into the consensus service by collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// Encoded consensus payload received from a peer.
    Payload(Vec<u8>),
    /// A transaction arrived in the local pool.
    NewInventory(Transaction),
    /// The ledger persisted the block at this height.
    BlockPersisted(u32),
    /// A timer deadline passed.
    Timeout(Timeout),
}

/// [`Wallet`] backed by a single ed25519 keypair.
pub struct KeypairWallet {
    keypair: Arc<Keypair>,
}

impl KeypairWallet {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self { keypair }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }
}

impl Wallet for KeypairWallet {
    fn sign(&self, data: &[u8], key: &Pubkey) -> Result<Signature, SignerError> {
        if *key != self.keypair.pubkey() {
            return Err(SignerError::UnknownKey(*key));
        }
        self.keypair
            .try_sign_message(data)
            .map_err(|err| SignerError::Backend(err.to_string()))
    }

    fn verify(&self, data: &[u8], signature: &Signature, pubkey: &Pubkey) -> bool {
        signature.verify(pubkey.as_ref(), data)
    }
}
