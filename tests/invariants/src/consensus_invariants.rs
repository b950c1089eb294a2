//! Property-based tests for dBFT consensus invariants.
//!
//! Properties tested:
//! 1. Quorum: any two quorums overlap in at least `f + 1` validators.
//! 2. Rotation: over `n` consecutive views every validator leads once.
//! 3. Aggregation: first write wins and duplicates are no-ops.
//! 4. Witness: exactly `M` signers, ascending, drawn from the recorded set.
//! 5. Codec: a proposal listing a transaction twice never decodes.

#[cfg(test)]
mod tests {
    use {
        dbft_consensus::{
            fault_tolerance,
            message::PrepareRequest,
            primary_index, quorum, ConsensusError, ConsensusMessage, ConsensusPayload,
            FormatError, MessageCodec, Phase, SignatureAggregator,
        },
        proptest::prelude::*,
        solana_hash::Hash,
        solana_signature::Signature,
        std::collections::{BTreeMap, HashSet},
    };

    // ── Helpers ──

    fn sig(byte: u8) -> Signature {
        Signature::from([byte; 64])
    }

    fn tx_hash(i: u16) -> Hash {
        solana_sha256_hasher::hash(&i.to_le_bytes())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 1. Quorum arithmetic
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn quorum_intersection_exceeds_fault_tolerance(n in 1..=255usize) {
            let f = fault_tolerance(n);
            let m = quorum(n);
            prop_assert_eq!(f, (n - 1) / 3);
            prop_assert_eq!(m, n - f);
            prop_assert!(3 * f < n);
            // Two quorums share at least one honest validator.
            prop_assert!(2 * m >= n + f + 1);
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 2. Primary rotation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn rotation_covers_every_validator(
            n in 1..=100usize,
            height in 0..=u32::MAX,
        ) {
            let views = u8::try_from(n.min(usize::from(u8::MAX))).unwrap();
            let leaders: HashSet<usize> = (0..views)
                .map(|view| primary_index(height, view, n).unwrap())
                .collect();
            prop_assert_eq!(leaders.len(), usize::from(views));
            prop_assert!(leaders.iter().all(|leader| *leader < n));
        }

        #[test]
        fn next_height_shifts_leader_by_one(
            n in 1..=100usize,
            height in 0..u32::MAX,
            view in 0..u8::MAX,
        ) {
            prop_assert_eq!(
                primary_index(height + 1, view, n),
                primary_index(height, view + 1, n)
            );
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 3. Signature aggregation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn aggregator_keeps_first_signature(
            n in 1..=16usize,
            adds in prop::collection::vec((0..16usize, 0..4u8), 0..64),
        ) {
            let mut aggregator = SignatureAggregator::new(Phase::Commit, n);
            let mut expected: BTreeMap<usize, u8> = BTreeMap::new();

            for (ordinal, byte) in adds {
                let result = aggregator.add(ordinal, sig(byte));
                if ordinal >= n {
                    prop_assert!(
                        matches!(result, Err(ConsensusError::Format(
                            FormatError::ValidatorIndexOutOfRange { .. }
                        ))),
                        "out-of-range ordinal {} accepted", ordinal
                    );
                    continue;
                }
                match expected.get(&ordinal) {
                    None => {
                        prop_assert!(matches!(result, Ok(true)));
                        expected.insert(ordinal, byte);
                    }
                    Some(first) if *first == byte => prop_assert!(matches!(result, Ok(false))),
                    Some(_) => prop_assert!(
                        matches!(result, Err(ConsensusError::ConflictingVote { .. })),
                        "conflicting signature for {} accepted", ordinal
                    ),
                }
            }

            prop_assert_eq!(aggregator.count(), expected.len());
            for (ordinal, byte) in &expected {
                prop_assert_eq!(aggregator.get(*ordinal), Some(&sig(*byte)));
            }
            prop_assert_eq!(aggregator.has_quorum(), expected.len() >= quorum(n));
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 4. Witness assembly
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn witness_has_quorum_ascending_signers(
            n in 1..=32usize,
            order in Just((0..32).collect::<Vec<usize>>()).prop_shuffle(),
            fill in 0..=32usize,
        ) {
            let mut aggregator = SignatureAggregator::new(Phase::Commit, n);
            let recorded: Vec<usize> = order
                .into_iter()
                .filter(|ordinal| *ordinal < n)
                .take(fill.min(n))
                .collect();
            for ordinal in &recorded {
                aggregator.add(*ordinal, sig(*ordinal as u8)).unwrap();
            }

            let m = quorum(n);
            match aggregator.assemble_witness() {
                Ok(witness) => {
                    prop_assert!(recorded.len() >= m);
                    prop_assert_eq!(witness.len(), m);
                    let signers: Vec<u8> = witness.signers().collect();
                    prop_assert!(signers.windows(2).all(|pair| pair[0] < pair[1]));
                    let mut lowest: Vec<usize> = recorded.clone();
                    lowest.sort_unstable();
                    lowest.truncate(m);
                    let signers: Vec<usize> = signers.into_iter().map(usize::from).collect();
                    prop_assert_eq!(signers, lowest);
                    for (ordinal, signature) in &witness.signatures {
                        prop_assert_eq!(*signature, sig(*ordinal));
                    }
                }
                Err(ConsensusError::IncompleteState { have, need }) => {
                    prop_assert_eq!(have, recorded.len());
                    prop_assert_eq!(need, m);
                    prop_assert!(have < need);
                }
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 5. Codec structural checks
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn duplicate_transaction_hash_never_decodes(
            count in 1..=32u16,
            duplicate in any::<prop::sample::Index>(),
            insert_at in any::<prop::sample::Index>(),
        ) {
            let mut hashes: Vec<Hash> = (0..count).map(tx_hash).collect();
            let dup = hashes[duplicate.index(hashes.len())];
            hashes.insert(insert_at.index(hashes.len() + 1), dup);

            let payload = ConsensusPayload::new(
                5,
                1,
                0,
                ConsensusMessage::PrepareRequest(PrepareRequest {
                    version: 0,
                    prev_hash: Hash::default(),
                    timestamp: 1,
                    nonce: 2,
                    transaction_hashes: hashes,
                    signature: sig(9),
                }),
            );
            let codec = MessageCodec::new(4, 64);
            let bytes = payload.encode().unwrap();
            prop_assert!(matches!(
                codec.decode(&bytes),
                Err(FormatError::DuplicateTransaction(hash)) if hash == dup
            ));
        }

        #[test]
        fn truncated_payload_never_decodes(
            count in 0..=8u16,
            cut in any::<prop::sample::Index>(),
        ) {
            let payload = ConsensusPayload::new(
                5,
                1,
                0,
                ConsensusMessage::PrepareRequest(PrepareRequest {
                    version: 0,
                    prev_hash: Hash::default(),
                    timestamp: 1,
                    nonce: 2,
                    transaction_hashes: (0..count).map(tx_hash).collect(),
                    signature: sig(9),
                }),
            );
            let codec = MessageCodec::new(4, 64);
            let bytes = payload.encode().unwrap();
            prop_assert!(codec.decode(&bytes).is_ok());
            let cut = cut.index(bytes.len());
            prop_assert!(codec.decode(&bytes[..cut]).is_err());
        }
    }
}
