//! Shared test utilities for dBFT end-to-end tests.
//!
//! Provides a simulated network that orchestrates:
//! - Several validators, each with its own ledger view and mempool
//! - A FIFO (or shuffled) message queue carrying encoded payloads
//! - Manual timer firing, so view changes are deterministic
//! - Block persistence and height advancement

use {
    dbft_consensus::{
        Block, BlockHeader, ConsensusEngine, ConsensusPayload, DbftConfig, EngineOutput,
        KeypairWallet, Ledger, Mempool, MessageCodec, Phase, ScheduledTimeout, Transaction,
    },
    rand::Rng,
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_signature::Signature,
    solana_signer::Signer,
    std::{
        collections::{HashSet, VecDeque},
        sync::{Arc, RwLock},
    },
};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Block interval used by simulated networks.
pub const BLOCK_INTERVAL_MS: u64 = 1_000;

/// Timestamp of the genesis header every node starts from.
pub const GENESIS_TIMESTAMP: u64 = 1_000;

/// Upper bound on deliveries in one `deliver_all`, so a message storm fails
/// the test instead of hanging it.
pub const MAX_DELIVERIES: usize = 100_000;

// ─────────────────────────────────────────────────────────────────────────────
// Simulated collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// One node's view of the chain.
pub struct SimLedger {
    tip: RwLock<BlockHeader>,
    on_chain: RwLock<HashSet<Hash>>,
    /// Blocks this node finalized, in submission order.
    submitted: RwLock<Vec<Block>>,
}

impl SimLedger {
    pub fn genesis() -> Self {
        Self {
            tip: RwLock::new(BlockHeader {
                timestamp: GENESIS_TIMESTAMP,
                ..BlockHeader::default()
            }),
            on_chain: RwLock::new(HashSet::new()),
            submitted: RwLock::new(Vec::new()),
        }
    }

    /// Append `block` to the chain.
    pub fn persist(&self, block: &Block) {
        *self.tip.write().unwrap() = block.header.clone();
        self.on_chain
            .write()
            .unwrap()
            .extend(block.transactions.iter().map(Transaction::hash));
    }

    pub fn submitted(&self) -> Vec<Block> {
        self.submitted.read().unwrap().clone()
    }
}

impl Ledger for SimLedger {
    fn tip_header(&self) -> BlockHeader {
        self.tip.read().unwrap().clone()
    }

    fn contains_transaction(&self, hash: &Hash) -> bool {
        self.on_chain.read().unwrap().contains(hash)
    }

    fn submit_block(&self, block: Block) -> bool {
        self.submitted.write().unwrap().push(block);
        true
    }
}

pub struct SimMempool {
    pool: RwLock<Vec<Transaction>>,
}

impl SimMempool {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self {
            pool: RwLock::new(transactions),
        }
    }
}

impl Mempool for SimMempool {
    fn get_pool(&self) -> Vec<Transaction> {
        self.pool.read().unwrap().clone()
    }

    fn get_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.pool
            .read()
            .unwrap()
            .iter()
            .find(|tx| tx.hash() == *hash)
            .cloned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SimNetwork
// ─────────────────────────────────────────────────────────────────────────────

/// A simulated validator node.
pub struct SimNode {
    pub engine: ConsensusEngine,
    pub ledger: Arc<SimLedger>,
    pub online: bool,
}

/// An encoded payload in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: usize,
    pub bytes: Vec<u8>,
}

pub struct SimNetwork {
    pub nodes: Vec<SimNode>,
    pub keypairs: Vec<Arc<Keypair>>,
    pub config: DbftConfig,
    pub codec: MessageCodec,
    queue: VecDeque<Envelope>,
    /// Every payload that left the queue, in delivery order.
    pub delivered: Vec<ConsensusPayload>,
}

impl SimNetwork {
    /// `n` validators, each with `transactions` in its mempool.
    pub fn new(n: usize, transactions: Vec<Transaction>) -> Self {
        let keypairs: Vec<Arc<Keypair>> = (0..n).map(|_| Arc::new(Keypair::new())).collect();
        let mut config = DbftConfig::with_validators(keypairs.iter().map(|k| k.pubkey()).collect());
        config.block_interval_ms = BLOCK_INTERVAL_MS;
        config.clock_skew_tolerance_ms = 8 * BLOCK_INTERVAL_MS;
        config.validate().unwrap();

        let nodes = keypairs
            .iter()
            .map(|keypair| {
                let ledger = Arc::new(SimLedger::genesis());
                let engine = ConsensusEngine::new(
                    config.clone(),
                    keypair.pubkey(),
                    Arc::new(KeypairWallet::new(keypair.clone())),
                    ledger.clone(),
                    Arc::new(SimMempool::new(transactions.clone())),
                );
                SimNode {
                    engine,
                    ledger,
                    online: true,
                }
            })
            .collect();

        Self {
            nodes,
            codec: MessageCodec::from_config(&config),
            keypairs,
            config,
            queue: VecDeque::new(),
            delivered: Vec::new(),
        }
    }

    /// A watch-only engine on a fresh genesis ledger with an empty mempool.
    pub fn observer(&self) -> ConsensusEngine {
        let keypair = Arc::new(Keypair::new());
        ConsensusEngine::new(
            self.config.clone(),
            keypair.pubkey(),
            Arc::new(KeypairWallet::new(keypair)),
            Arc::new(SimLedger::genesis()),
            Arc::new(SimMempool::new(Vec::new())),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn set_offline(&mut self, index: usize) {
        self.nodes[index].online = false;
    }

    pub fn set_online(&mut self, index: usize) {
        self.nodes[index].online = true;
    }

    pub fn engine(&self, index: usize) -> &ConsensusEngine {
        &self.nodes[index].engine
    }

    pub fn online(&self) -> Vec<usize> {
        (0..self.len()).filter(|i| self.nodes[*i].online).collect()
    }

    /// Start every online engine.
    pub fn start_all(&mut self) {
        for index in self.online() {
            self.start(index);
        }
    }

    pub fn start(&mut self, index: usize) {
        let output = self.nodes[index].engine.start();
        self.apply(index, output);
    }

    /// Fire node `index`'s pending timer immediately. Returns false if no
    /// timer was armed.
    pub fn fire_timeout(&mut self, index: usize) -> bool {
        let Some(timeout) = self.nodes[index]
            .engine
            .pending_timeout()
            .map(ScheduledTimeout::timeout)
        else {
            return false;
        };
        let output = self.nodes[index].engine.on_timeout(timeout);
        self.apply(index, output);
        true
    }

    /// Queue a hand-built payload as if `from` had sent it.
    pub fn inject(&mut self, from: usize, payload: &ConsensusPayload) {
        self.queue.push_back(Envelope {
            from,
            bytes: self.codec.encode(payload).unwrap(),
        });
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Deliver queued messages in FIFO order until the queue drains.
    pub fn deliver_all(&mut self) -> usize {
        let mut count = 0;
        while let Some(envelope) = self.queue.pop_front() {
            self.deliver(envelope);
            count += 1;
            assert!(count < MAX_DELIVERIES, "message storm");
        }
        count
    }

    /// Deliver queued messages in random order until the queue drains.
    pub fn deliver_shuffled<R: Rng>(&mut self, rng: &mut R) -> usize {
        let mut count = 0;
        while !self.queue.is_empty() {
            let pick = rng.random_range(0..self.queue.len());
            if let Some(envelope) = self.queue.remove(pick) {
                self.deliver(envelope);
            }
            count += 1;
            assert!(count < MAX_DELIVERIES, "message storm");
        }
        count
    }

    /// The block node `index` finalized at `height`, if any.
    pub fn finalized(&self, index: usize, height: u32) -> Option<Block> {
        self.nodes[index]
            .ledger
            .submitted()
            .into_iter()
            .find(|block| block.index() == height)
    }

    /// Persist the block finalized at the current height on every node, as
    /// block sync would, and move every engine to the next height.
    pub fn persist_all(&mut self, height: u32) -> Block {
        let block = (0..self.len())
            .find_map(|i| self.finalized(i, height))
            .unwrap_or_else(|| panic!("no node finalized height {height}"));
        for index in 0..self.len() {
            self.nodes[index].ledger.persist(&block);
            let output = self.nodes[index].engine.on_block_persisted(height);
            self.apply(index, output);
        }
        block
    }

    pub fn sign(&self, index: usize, header: &BlockHeader, phase: Phase) -> Signature {
        self.keypairs[index].sign_message(&header.signing_bytes(phase))
    }

    /// Run one height with every online node cooperating: fire the
    /// primary's timer, drain the queue and persist the result.
    pub fn run_height(&mut self) -> Block {
        let height = self.engine(0).height();
        let primary = self.engine(0).state().primary_index;
        assert!(self.fire_timeout(primary), "primary {primary} has no timer");
        self.deliver_all();
        self.persist_all(height)
    }

    fn deliver(&mut self, envelope: Envelope) {
        let payload = match self.codec.decode(&envelope.bytes) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("undecodable envelope from {}: {err}", envelope.from);
                return;
            }
        };
        for index in 0..self.len() {
            if index == envelope.from || !self.nodes[index].online {
                continue;
            }
            let output = self.nodes[index].engine.on_payload(payload.clone());
            self.apply(index, output);
        }
        self.delivered.push(payload);
    }

    fn apply(&mut self, from: usize, output: EngineOutput) {
        if !self.nodes[from].online {
            return;
        }
        for payload in &output.messages {
            self.queue.push_back(Envelope {
                from,
                bytes: self.codec.encode(payload).unwrap(),
            });
        }
        if let Some(block) = output.block {
            self.nodes[from].ledger.submit_block(block);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

pub fn make_transactions(n: usize) -> Vec<Transaction> {
    (0..n)
        .map(|i| Transaction::new(format!("transfer #{i}").into_bytes()))
        .collect()
}

/// Initialize logging once for test output.
pub fn init_logging() {
    dbft_logger::setup_with_default_filter();
}
