//! E2E Test: View Changes
//!
//! Verifies leader replacement:
//! - A silent primary is replaced once `M` validators time out
//! - A validator that never timed out follows the quorum (ChangeAgreement)
//! - A proposal with a stale timestamp is never accepted
//! - Timeouts back off exponentially as views advance

use {
    dbft_consensus::{
        message::PrepareRequest, types::merkle_root, BlockHeader, ConsensusMessage,
        ConsensusPayload, Ledger, Phase,
    },
    dbft_e2e_tests::helpers::*,
    std::time::{Duration, Instant},
};

// ─────────────────────────────────────────────────────────────────────────────
// Test: 7 validators, silent primary
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_silent_primary_replaced_by_next_view() {
    init_logging();
    let mut net = SimNetwork::new(7, make_transactions(2));
    // Height 1, view 0: primary 1 never speaks.
    net.set_offline(1);
    net.start_all();
    net.deliver_all();
    assert_eq!(net.engine(0).state().primary_index, 1);

    // Five backups time out; the sixth (6) only learns from the others.
    for index in [0, 2, 3, 4, 5] {
        assert!(net.fire_timeout(index));
    }
    net.deliver_all();

    for index in net.online() {
        let engine = net.engine(index);
        assert_eq!(engine.view_number(), 1, "validator {index}");
        assert_eq!(engine.state().primary_index, 2);
        let pending = engine.pending_timeout().expect("timer armed");
        assert_eq!((pending.height, pending.view), (1, 1));
    }

    assert!(net.fire_timeout(2));
    net.deliver_all();

    let block = net.finalized(2, 1).expect("new primary finalized");
    assert_eq!(block.header.primary_index, 2);
    assert_eq!(block.witness.len(), 5);
    for index in net.online() {
        assert_eq!(net.finalized(index, 1).map(|b| b.hash()), Some(block.hash()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: Byzantine primary proposes a stale timestamp
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_stale_timestamp_rejected_then_view_change() {
    init_logging();
    let mut net = SimNetwork::new(4, make_transactions(1));
    net.set_offline(1);
    net.start_all();
    net.deliver_all();

    // Equal to the previous block's timestamp, so not strictly increasing.
    let genesis = SimLedger::genesis().tip_header();
    let header = BlockHeader {
        version: net.config.block_version,
        prev_hash: genesis.hash(),
        merkle_root: merkle_root(&[]),
        timestamp: GENESIS_TIMESTAMP,
        nonce: 42,
        index: 1,
        primary_index: 1,
    };
    let request = ConsensusPayload::new(
        1,
        1,
        0,
        ConsensusMessage::PrepareRequest(PrepareRequest {
            version: header.version,
            prev_hash: header.prev_hash,
            timestamp: header.timestamp,
            nonce: header.nonce,
            transaction_hashes: Vec::new(),
            signature: net.sign(1, &header, Phase::Prepare),
        }),
    );
    net.inject(1, &request);
    net.deliver_all();

    for index in net.online() {
        let state = net.engine(index).state();
        assert!(!state.request_sent_or_received(), "validator {index}");
        assert!(!state.response_sent());
    }

    for index in net.online() {
        assert!(net.fire_timeout(index));
    }
    net.deliver_all();
    assert_eq!(net.engine(0).view_number(), 1);
    assert_eq!(net.engine(0).state().primary_index, 2);

    assert!(net.fire_timeout(2));
    net.deliver_all();
    let block = net.finalized(0, 1).expect("finalized at view 1");
    assert_eq!(block.header.primary_index, 2);
    assert!(block.header.timestamp > GENESIS_TIMESTAMP);
    assert_eq!(net.finalized(3, 1), Some(block));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: consecutive silent primaries, exponential backoff
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_backoff_grows_across_views() {
    init_logging();
    let mut net = SimNetwork::new(7, make_transactions(1));
    // Primaries of views 0 and 1 at height 1.
    net.set_offline(1);
    net.set_offline(2);
    net.start_all();
    net.deliver_all();
    let interval = Duration::from_millis(BLOCK_INTERVAL_MS);

    let mut previous = Duration::ZERO;
    for view in 1..=2u8 {
        for index in net.online() {
            assert!(net.fire_timeout(index));
        }
        net.deliver_all();

        let remaining = net
            .engine(0)
            .time_to_next_timeout(Instant::now())
            .expect("timer armed");
        for index in net.online() {
            assert_eq!(net.engine(index).view_number(), view);
        }
        // Backups wait `interval << (view + 1)`.
        let full = interval * (1 << (u32::from(view) + 1));
        assert!(remaining <= full, "view {view}: {remaining:?} > {full:?}");
        assert!(remaining > full / 2, "view {view}: {remaining:?}");
        assert!(remaining > previous);
        previous = remaining;
    }

    assert_eq!(net.engine(0).state().primary_index, 3);
    assert!(net.fire_timeout(3));
    net.deliver_all();
    let block = net.finalized(0, 1).expect("third primary finalized");
    assert_eq!(block.header.primary_index, 3);
}
