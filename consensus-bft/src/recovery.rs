//! Recovery: catching a validator up on the round it missed.
//!
//! A lagging node broadcasts a RecoveryRequest. A bounded set of peers
//! answers with a RecoveryMessage, a compact snapshot of everything they know
//! about the current height. The receiver rebuilds the individual payloads
//! from the snapshot and feeds them through the normal handlers, so every
//! signature is checked exactly as if the messages had arrived one by one.

use {
    crate::{
        engine::{ConsensusEngine, EngineOutput},
        error::Result,
        message::{
            ChangeView, ChangeViewReason, Commit, CommitCompact, ConsensusMessage,
            ConsensusPayload, PrepareResponse, PreparationCompact, RecoveryMessage,
        },
    },
    log::*,
    solana_hash::Hash,
};

/// Valid and total counts for one import stage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ImportTally {
    valid: usize,
    total: usize,
}

impl std::fmt::Display for ImportTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.valid, self.total)
    }
}

impl ConsensusEngine {
    /// Snapshot of this node's knowledge of the current height.
    pub fn make_recovery_message(&self) -> RecoveryMessage {
        let state = &self.state;
        let view = u16::from(state.view_number);
        let change_views = state
            .change_views
            .iter()
            .flatten()
            .filter(|compact| u16::from(compact.original_view_number) + 1 >= view)
            .take(state.quorum())
            .cloned()
            .collect();

        let preparation_hash = if state.prepare_request.is_none() {
            self.majority_preparation_hash()
        } else {
            None
        };

        let preparations = state
            .preparations
            .iter()
            .enumerate()
            .filter_map(|(index, preparation)| {
                let preparation = preparation.as_ref()?;
                Some(PreparationCompact {
                    validator_index: u8::try_from(index).ok()?,
                    signature: preparation.signature,
                })
            })
            .collect();

        let commits = if state.commit_sent() {
            state
                .commits
                .iter()
                .enumerate()
                .filter_map(|(index, commit)| {
                    let commit = commit.as_ref()?;
                    Some(CommitCompact {
                        view_number: commit.view_number,
                        validator_index: u8::try_from(index).ok()?,
                        signature: commit.signature,
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        RecoveryMessage {
            change_views,
            prepare_request: state.prepare_request.clone(),
            preparation_hash,
            preparations,
            commits,
        }
    }

    /// The hash most preparations endorse. Ties go to the lowest ordinal.
    fn majority_preparation_hash(&self) -> Option<Hash> {
        let mut tally: Vec<(Hash, usize)> = Vec::new();
        for preparation in self.state.preparations.iter().flatten() {
            match tally
                .iter_mut()
                .find(|(hash, _)| *hash == preparation.preparation_hash)
            {
                Some((_, count)) => *count += 1,
                None => tally.push((preparation.preparation_hash, 1)),
            }
        }
        tally
            .into_iter()
            .fold(None, |best: Option<(Hash, usize)>, (hash, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((hash, count)),
            })
            .map(|(hash, _)| hash)
    }

    /// Answer a RecoveryRequest, or a ChangeView for a view this node already
    /// left. Only `f + 1` validators after the sender answer, unless this node
    /// has committed, in which case it always does.
    pub(crate) fn on_recovery_request(
        &mut self,
        payload: &ConsensusPayload,
        out: &mut EngineOutput,
    ) -> Result<()> {
        if !self.known_hashes.insert(payload.hash()?) {
            return Ok(());
        }
        debug!(
            "{} received: height={} index={} view={}",
            payload.message.kind(),
            payload.block_index,
            payload.validator_index,
            payload.view_number
        );
        let Some(me) = self.state.my_index() else {
            return Ok(());
        };
        if !self.state.commit_sent() {
            let n = self.state.validator_count;
            let sender = usize::from(payload.validator_index);
            let selected = (1..=self.state.fault_tolerance() + 1).any(|i| (sender + i) % n == me);
            if !selected {
                return Ok(());
            }
        }
        info!(
            "Sending RecoveryMessage: height={} view={} nc={} nf={}",
            self.state.height,
            self.state.view_number,
            self.state.count_committed(),
            self.count_failed()
        );
        let recovery = self.make_recovery_message();
        self.broadcast(ConsensusMessage::RecoveryMessage(recovery), out)?;
        Ok(())
    }

    pub(crate) fn on_recovery_message(
        &mut self,
        payload: &ConsensusPayload,
        recovery: &RecoveryMessage,
        out: &mut EngineOutput,
    ) -> Result<()> {
        debug!(
            "RecoveryMessage received: height={} index={} view={}",
            payload.block_index, payload.validator_index, payload.view_number
        );
        self.recovering = true;
        self.import_recovery(payload, recovery, out);
        self.recovering = false;
        Ok(())
    }

    fn import_recovery(
        &mut self,
        payload: &ConsensusPayload,
        recovery: &RecoveryMessage,
        out: &mut EngineOutput,
    ) {
        let mut change_views = ImportTally::default();
        let mut requests = ImportTally::default();
        let mut responses = ImportTally::default();
        let mut commits = ImportTally::default();

        if payload.view_number > self.state.view_number {
            if self.state.commit_sent() {
                return;
            }
            let rebuilt = rebuild_change_views(payload.block_index, recovery);
            change_views = self.replay(rebuilt, out);
        }

        if payload.view_number == self.state.view_number
            && !self.not_accepting_payloads()
            && !self.state.commit_sent()
        {
            if !self.state.request_sent_or_received() {
                if let Some(request) = &recovery.prepare_request {
                    let rebuilt = ConsensusPayload::new(
                        payload.block_index,
                        u8::try_from(self.state.primary_index).unwrap_or(u8::MAX),
                        payload.view_number,
                        ConsensusMessage::PrepareRequest(request.clone()),
                    );
                    requests = self.replay(vec![rebuilt], out);
                }
            }
            if let Some(preparation_hash) = recovery.preparation_hash.or(self.state.preparation_hash)
            {
                let primary = self.state.primary_index;
                let rebuilt = recovery
                    .preparations
                    .iter()
                    .filter(|compact| usize::from(compact.validator_index) != primary)
                    .map(|compact| {
                        ConsensusPayload::new(
                            payload.block_index,
                            compact.validator_index,
                            payload.view_number,
                            ConsensusMessage::PrepareResponse(PrepareResponse {
                                preparation_hash,
                                round_id: 0,
                                signature: compact.signature,
                            }),
                        )
                    })
                    .collect();
                responses = self.replay(rebuilt, out);
            }
        }

        if payload.view_number <= self.state.view_number {
            let view = self.state.view_number;
            // Commits from other views cannot be checked against a header, so
            // only the sender's own are taken on its word.
            let rebuilt = recovery
                .commits
                .iter()
                .filter(|compact| {
                    compact.view_number == view || compact.validator_index == payload.validator_index
                })
                .map(|compact| {
                    ConsensusPayload::new(
                        payload.block_index,
                        compact.validator_index,
                        compact.view_number,
                        ConsensusMessage::Commit(Commit {
                            signature: compact.signature,
                        }),
                    )
                })
                .collect();
            commits = self.replay(rebuilt, out);
        }

        info!(
            "Recovery finished: (valid/total) ChgView: {change_views} PrepReq: {requests} \
             PrepResp: {responses} Commits: {commits}"
        );
    }

    /// Feed rebuilt payloads through the normal handlers.
    fn replay(&mut self, payloads: Vec<ConsensusPayload>, out: &mut EngineOutput) -> ImportTally {
        let mut tally = ImportTally {
            valid: 0,
            total: payloads.len(),
        };
        for payload in payloads {
            match self.process_payload(&payload, out) {
                Ok(()) => tally.valid += 1,
                Err(err) => debug!(
                    "Recovered {} from validator {} rejected: {err}",
                    payload.message.kind(),
                    payload.validator_index
                ),
            }
        }
        tally
    }
}

fn rebuild_change_views(block_index: u32, recovery: &RecoveryMessage) -> Vec<ConsensusPayload> {
    recovery
        .change_views
        .iter()
        .map(|compact| {
            ConsensusPayload::new(
                block_index,
                compact.validator_index,
                compact.original_view_number,
                ConsensusMessage::ChangeView(ChangeView {
                    timestamp: compact.timestamp,
                    reason: ChangeViewReason::Timeout,
                    signature: compact.signature,
                }),
            )
        })
        .collect()
}
