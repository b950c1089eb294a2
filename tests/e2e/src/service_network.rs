//! E2E Test: Threaded Consensus Services
//!
//! Runs four `ConsensusService` threads wired together by channels, with
//! real timers, on top of one shared chain. Verifies that heights advance
//! and that no two validators ever finalize different blocks at a height.

use {
    crossbeam_channel::{unbounded, Sender},
    dbft_consensus::{
        Block, BlockHeader, ConsensusEngine, ConsensusEvent, DbftConfig, KeypairWallet, Ledger,
        Transaction, Transport,
    },
    dbft_e2e_tests::helpers::*,
    log::*,
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_signer::Signer,
    std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, RwLock,
        },
        thread,
        time::{Duration, Instant},
    },
};

const SERVICE_BLOCK_INTERVAL_MS: u64 = 100;
const TARGET_HEIGHT: u32 = 3;

/// The chain every validator persists to. The first submission at a height
/// wins; later ones must match it.
struct SharedChain {
    blocks: RwLock<Vec<Block>>,
    on_chain: RwLock<HashSet<Hash>>,
    conflicts: AtomicUsize,
    subscribers: RwLock<Vec<Sender<ConsensusEvent>>>,
}

impl SharedChain {
    fn new() -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            on_chain: RwLock::new(HashSet::new()),
            conflicts: AtomicUsize::new(0),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    fn height(&self) -> u32 {
        self.blocks.read().unwrap().len() as u32
    }
}

impl Ledger for SharedChain {
    fn tip_header(&self) -> BlockHeader {
        self.blocks
            .read()
            .unwrap()
            .last()
            .map(|block| block.header.clone())
            .unwrap_or_else(|| BlockHeader {
                timestamp: GENESIS_TIMESTAMP,
                ..BlockHeader::default()
            })
    }

    fn contains_transaction(&self, hash: &Hash) -> bool {
        self.on_chain.read().unwrap().contains(hash)
    }

    fn submit_block(&self, block: Block) -> bool {
        let height = block.index();
        {
            let mut blocks = self.blocks.write().unwrap();
            if let Some(existing) = blocks.get(height as usize - 1) {
                if existing.hash() != block.hash() {
                    error!("conflicting block at height {height}");
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                return true;
            }
            if height as usize != blocks.len() + 1 {
                return false;
            }
            self.on_chain
                .write()
                .unwrap()
                .extend(block.transactions.iter().map(Transaction::hash));
            blocks.push(block);
        }
        for subscriber in self.subscribers.read().unwrap().iter() {
            let _ = subscriber.send(ConsensusEvent::BlockPersisted(height));
        }
        true
    }
}

/// Relays every payload to all other validators' event channels.
struct ChannelTransport {
    me: usize,
    peers: Vec<Sender<ConsensusEvent>>,
}

impl Transport for ChannelTransport {
    fn relay(&self, payload: &[u8]) -> bool {
        for (index, peer) in self.peers.iter().enumerate() {
            if index != self.me {
                let _ = peer.send(ConsensusEvent::Payload(payload.to_vec()));
            }
        }
        true
    }

    fn request_missing(&self, hashes: &[Hash]) {
        warn!("validator {} missing {} transactions", self.me, hashes.len());
    }
}

#[test]
fn test_service_threads_reach_consensus() {
    init_logging();
    let n = 4;
    let keypairs: Vec<Arc<Keypair>> = (0..n).map(|_| Arc::new(Keypair::new())).collect();
    let mut config = DbftConfig::with_validators(keypairs.iter().map(|k| k.pubkey()).collect());
    config.block_interval_ms = SERVICE_BLOCK_INTERVAL_MS;
    config.validate().unwrap();

    let chain = Arc::new(SharedChain::new());
    let channels: Vec<_> = (0..n).map(|_| unbounded()).collect();
    let senders: Vec<Sender<ConsensusEvent>> = channels.iter().map(|(s, _)| s.clone()).collect();
    *chain.subscribers.write().unwrap() = senders.clone();
    let mempool = Arc::new(SimMempool::new(make_transactions(3)));
    let exit = Arc::new(AtomicBool::new(false));

    let services: Vec<_> = channels
        .into_iter()
        .enumerate()
        .map(|(index, (_, receiver))| {
            let engine = ConsensusEngine::new(
                config.clone(),
                keypairs[index].pubkey(),
                Arc::new(KeypairWallet::new(keypairs[index].clone())),
                chain.clone(),
                mempool.clone(),
            );
            dbft_consensus::ConsensusService::new(
                engine,
                chain.clone(),
                Arc::new(ChannelTransport {
                    me: index,
                    peers: senders.clone(),
                }),
                receiver,
                exit.clone(),
            )
            .unwrap()
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(20);
    while chain.height() < TARGET_HEIGHT && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    exit.store(true, Ordering::Relaxed);
    // Drop the chain's senders so no thread blocks on a full queue.
    chain.subscribers.write().unwrap().clear();
    drop(senders);
    for service in services {
        service.join().unwrap();
    }

    assert!(chain.height() >= TARGET_HEIGHT, "stalled at {}", chain.height());
    assert_eq!(chain.conflicts.load(Ordering::Relaxed), 0);
    let blocks = chain.blocks.read().unwrap();
    assert_eq!(blocks[0].transactions.len(), 3);
    for pair in blocks.windows(2) {
        assert_eq!(pair[1].header.prev_hash, pair[0].hash());
        assert_eq!(pair[1].index(), pair[0].index() + 1);
    }
    for block in blocks.iter() {
        assert_eq!(block.witness.len(), 3);
    }
}
