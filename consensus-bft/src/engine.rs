//! The dBFT consensus state machine.
//!
//! Rotating-leader, two-phase Byzantine agreement: the primary of each
//! (height, view) broadcasts a PrepareRequest, validators endorse it with
//! PrepareResponses, and once `M = N - f` endorsements are in every honest
//! validator broadcasts a Commit. `M` Commits over the same header finalize
//! the block. A primary that stalls is replaced through ChangeView quorums.
//!
//! The engine is sans-IO. Every entry point mutates the round state and
//! returns an [`EngineOutput`] describing what the caller should send,
//! fetch, or submit. The only timer is a single [`ScheduledTimeout`] value
//! owned by the engine; the caller polls it and feeds expirations back via
//! [`ConsensusEngine::on_timeout`].
//!
//! With a [`ConsensusStore`] attached, the round is saved before this node's
//! Commit leaves and restored by [`ConsensusEngine::start`], so a restarted
//! validator resumes as committed instead of joining a view change.

use {
    crate::{
        config::DbftConfig,
        error::{ConsensusError, Result},
        interfaces::{Ledger, Mempool, TransactionVerdict, Wallet},
        message::{
            change_view_sign_data, ChangeView, ChangeViewCompact, ChangeViewReason, Commit,
            CommitCompact, ConsensusMessage, ConsensusPayload, MessageCodec, PreCommit,
            PreparationCompact, PrepareRequest, PrepareResponse, RecoveryRequest,
        },
        signatures::Phase,
        state::{CommitEntry, ConsensusRole, ConsensusState, Preparation, RoleFlags},
        store::{ConsensusStore, RoundSnapshot},
        timeout::{self, ScheduledTimeout, Timeout, TimeoutScheduler},
        types::{Block, BlockHeader, Transaction},
        validator_set::ValidatorSet,
    },
    log::*,
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// Effects requested by one engine step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    /// Payloads to relay to every validator, in send order.
    pub messages: Vec<ConsensusPayload>,
    /// Transaction hashes the proposal needs but the mempool lacks.
    pub missing_transactions: Vec<Hash>,
    /// A block that reached commit quorum, ready for the ledger.
    pub block: Option<Block>,
}

impl EngineOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.missing_transactions.is_empty() && self.block.is_none()
    }
}

/// The dBFT consensus engine for one node.
pub struct ConsensusEngine {
    config: DbftConfig,
    validators: ValidatorSet,
    codec: MessageCodec,
    identity: Pubkey,
    wallet: Arc<dyn Wallet>,
    ledger: Arc<dyn Ledger>,
    mempool: Arc<dyn Mempool>,
    store: Option<Arc<dyn ConsensusStore>>,
    pub(crate) state: ConsensusState,
    timer: TimeoutScheduler,
    /// Height of the last message seen from each validator.
    last_seen: Vec<u32>,
    /// Payloads already answered with a RecoveryMessage at this height.
    pub(crate) known_hashes: HashSet<Hash>,
    block_received_time: Instant,
    block_received_index: u32,
    /// Set while a RecoveryMessage is being imported.
    pub(crate) recovering: bool,
}

impl ConsensusEngine {
    /// Create an engine for `identity`. The round state starts at the height
    /// above the ledger tip; call [`start`](Self::start) to begin.
    pub fn new(
        config: DbftConfig,
        identity: Pubkey,
        wallet: Arc<dyn Wallet>,
        ledger: Arc<dyn Ledger>,
        mempool: Arc<dyn Mempool>,
    ) -> Self {
        let validators = ValidatorSet::new(config.validators.clone());
        let codec = MessageCodec::from_config(&config);
        let tip = ledger.tip_header();
        let height = tip.index.saturating_add(1);
        let state = ConsensusState::new(
            height,
            &validators,
            validators.index_of(&identity),
            &tip,
            config.block_version,
        );
        let last_seen = vec![height; validators.len()];
        Self {
            config,
            validators,
            codec,
            identity,
            wallet,
            ledger,
            mempool,
            store: None,
            state,
            timer: TimeoutScheduler::new(),
            last_seen,
            known_hashes: HashSet::new(),
            block_received_time: Instant::now(),
            block_received_index: 0,
            recovering: false,
        }
    }

    /// Persist the committed round to `store` and resume from it on start.
    pub fn with_store(mut self, store: Arc<dyn ConsensusStore>) -> Self {
        self.store = Some(store);
        self
    }

    // -- Public API --

    /// Initialize view 0 on top of the ledger tip and ask peers for their
    /// round state. If the store holds a round this node committed in at the
    /// current height, resume it and resend the Commit instead.
    pub fn start(&mut self) -> EngineOutput {
        let mut output = EngineOutput::default();
        info!("Starting dBFT consensus as {}", self.identity);
        self.initialize_consensus(0);
        if self.state.watch_only() {
            return output;
        }
        match self.restore_round() {
            Ok(true) => {
                let result = self.resend_commit(&mut output);
                self.log_result("start", result);
                return output;
            }
            Ok(false) => {}
            Err(err) => warn!("Ignoring saved consensus state: {err}"),
        }
        let result = self.request_recovery(&mut output);
        self.log_result("start", result);
        output
    }

    /// The ledger persisted block `height`; start consensus on the next one.
    pub fn on_block_persisted(&mut self, height: u32) -> EngineOutput {
        if height < self.state.height.saturating_sub(1) || height < self.block_received_index {
            debug!(
                "Ignoring persisted block {height}, consensus is at height {}",
                self.state.height
            );
            return EngineOutput::default();
        }
        info!("Persisted block: height={height}");
        self.block_received_time = Instant::now();
        self.block_received_index = height;
        self.known_hashes.clear();
        self.initialize_consensus(0);
        EngineOutput::default()
    }

    /// Handle a decoded consensus payload from a peer.
    pub fn on_payload(&mut self, payload: ConsensusPayload) -> EngineOutput {
        let mut output = EngineOutput::default();
        let result = self.process_payload(&payload, &mut output);
        self.log_result(payload.message.kind(), result);
        output
    }

    /// A transaction arrived in the local pool.
    pub fn on_transaction(&mut self, transaction: Transaction) -> EngineOutput {
        let mut output = EngineOutput::default();
        let result = self.process_transaction(transaction, &mut output);
        self.log_result("transaction", result);
        output
    }

    /// A timer deadline passed.
    pub fn on_timeout(&mut self, timeout: Timeout) -> EngineOutput {
        let mut output = EngineOutput::default();
        let result = self.process_timeout(timeout, &mut output);
        self.log_result("timeout", result);
        output
    }

    /// Take the pending deadline if it has passed.
    pub fn take_expired_timeout(&mut self, now: Instant) -> Option<Timeout> {
        self.timer.take_expired(now)
    }

    /// Time left before the pending deadline.
    pub fn time_to_next_timeout(&self, now: Instant) -> Option<Duration> {
        self.timer.remaining(now)
    }

    pub fn pending_timeout(&self) -> Option<&ScheduledTimeout> {
        self.timer.pending()
    }

    // -- Accessors --

    pub fn state(&self) -> &ConsensusState {
        &self.state
    }

    pub fn height(&self) -> u32 {
        self.state.height
    }

    pub fn view_number(&self) -> u8 {
        self.state.view_number
    }

    pub fn role(&self) -> ConsensusRole {
        self.state.role()
    }

    pub fn identity(&self) -> &Pubkey {
        &self.identity
    }

    pub fn validator_set(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn config(&self) -> &DbftConfig {
        &self.config
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    // -- Round lifecycle --

    pub(crate) fn initialize_consensus(&mut self, view: u8) {
        if view == 0 {
            let tip = self.ledger.tip_header();
            self.state = ConsensusState::new(
                tip.index.saturating_add(1),
                &self.validators,
                self.validators.index_of(&self.identity),
                &tip,
                self.config.block_version,
            );
        } else {
            self.state.advance_view(view);
            warn!(
                "View changed: height={} view={view} primary={}",
                self.state.height, self.state.primary_index
            );
        }
        let height = self.state.height;
        if let Some(seen) = self.state.my_index().and_then(|i| self.last_seen.get_mut(i)) {
            *seen = height;
        }
        info!(
            "Initialize: height={height} view={view} index={} role={}",
            self.state.self_index,
            self.state.role()
        );

        let interval = self.config.block_interval();
        match self.state.role() {
            ConsensusRole::Idle => self.timer.cancel(),
            ConsensusRole::Primary if !self.recovering => {
                let delay = if self.block_received_index.saturating_add(1) == height {
                    timeout::leader_delay(interval, self.block_received_time.elapsed())
                } else {
                    interval
                };
                self.change_timer(delay);
            }
            ConsensusRole::Primary | ConsensusRole::Backup => {
                self.change_timer(self.backoff(view));
            }
        }
    }

    fn process_timeout(&mut self, timeout: Timeout, out: &mut EngineOutput) -> Result<()> {
        if self.state.watch_only() || self.state.block_sent() {
            return Ok(());
        }
        if timeout.height != self.state.height || timeout.view != self.state.view_number {
            return Err(self.stale(timeout.height, timeout.view));
        }
        if self.state.is_primary() && !self.state.request_sent_or_received() {
            self.send_prepare_request(out)
        } else if self.state.commit_sent() {
            info!("Sending RecoveryMessage to resend Commit");
            let recovery = self.make_recovery_message();
            self.broadcast(ConsensusMessage::RecoveryMessage(recovery), out)?;
            self.change_timer(self.config.block_interval().saturating_mul(2));
            Ok(())
        } else {
            let reason = if self.state.request_sent_or_received()
                && !self.state.transactions_complete()
            {
                ChangeViewReason::TxNotFound
            } else {
                ChangeViewReason::Timeout
            };
            self.request_change_view(reason, out)
        }
    }

    // -- Primary --

    fn send_prepare_request(&mut self, out: &mut EngineOutput) -> Result<()> {
        let max = self.config.max_transactions_per_block;
        let nonce: u64 = rand::random();
        let mut hashes = Vec::new();
        let mut transactions = HashMap::new();
        let fee = self.mempool.fee_transaction(&self.identity, nonce);
        for transaction in fee.into_iter().chain(self.mempool.get_pool()) {
            if hashes.len() >= max {
                break;
            }
            let hash = transaction.hash();
            if transactions.contains_key(&hash) || self.ledger.contains_transaction(&hash) {
                continue;
            }
            if self.ledger.verify_transaction(&transaction) != TransactionVerdict::Valid {
                debug!("Leaving unverifiable transaction {hash} out of the proposal");
                continue;
            }
            hashes.push(hash);
            transactions.insert(hash, transaction);
        }

        self.state.nonce = nonce;
        self.state.timestamp = now_ms().max(self.state.prev_timestamp.saturating_add(1));
        self.state.transaction_hashes = hashes;
        self.state.transactions = transactions;

        let header = self.state.candidate_header();
        let signature = match self.sign(&header, Phase::Prepare) {
            Ok(signature) => signature,
            Err(err) => return self.abort_round(err, out),
        };
        let request = PrepareRequest {
            version: self.state.version,
            prev_hash: self.state.prev_hash,
            timestamp: self.state.timestamp,
            nonce,
            transaction_hashes: self.state.transaction_hashes.clone(),
            signature,
        };
        info!(
            "Sending PrepareRequest: height={} view={} tx={}",
            self.state.height,
            self.state.view_number,
            request.transaction_hashes.len()
        );
        let payload = self.broadcast(ConsensusMessage::PrepareRequest(request.clone()), out)?;
        let preparation_hash = payload.hash()?;
        self.state.prepare_request = Some(request);
        self.state.preparation_hash = Some(preparation_hash);
        self.state.flags.insert(RoleFlags::REQUEST_SENT);
        self.reverify_pending(&header, preparation_hash);
        self.record_preparation(self.state.primary_index, preparation_hash, signature, true)?;

        let interval = self.config.block_interval();
        let mut delay = self.backoff(self.state.view_number);
        if self.state.view_number == 0 {
            delay = delay.saturating_sub(interval);
        }
        self.change_timer(delay);
        self.check_preparations(out)
    }

    // -- Message handlers --

    pub(crate) fn process_payload(
        &mut self,
        payload: &ConsensusPayload,
        out: &mut EngineOutput,
    ) -> Result<()> {
        if self.state.block_sent() {
            return Err(self.stale(payload.block_index, payload.view_number));
        }
        self.codec.validate(payload)?;
        if payload.block_index != self.state.height {
            if payload.block_index > self.state.height {
                debug!(
                    "Received {} for future block {} from validator {}",
                    payload.message.kind(),
                    payload.block_index,
                    payload.validator_index
                );
            }
            return Err(self.stale(payload.block_index, payload.view_number));
        }
        if let Some(seen) = self.last_seen.get_mut(usize::from(payload.validator_index)) {
            *seen = (*seen).max(payload.block_index);
        }
        trace!(
            "Processing {} from validator {} view {}",
            payload.message.kind(),
            payload.validator_index,
            payload.view_number
        );
        match &payload.message {
            ConsensusMessage::ChangeView(change_view) => {
                self.on_change_view(payload, change_view, out)
            }
            ConsensusMessage::PrepareRequest(request) => {
                self.on_prepare_request(payload, request, out)
            }
            ConsensusMessage::PrepareResponse(response) => {
                self.on_prepare_response(payload, response, out)
            }
            ConsensusMessage::PreCommit(pre_commit) => self.on_pre_commit(payload, pre_commit),
            ConsensusMessage::Commit(commit) => self.on_commit(payload, commit, out),
            ConsensusMessage::RecoveryRequest(_) => self.on_recovery_request(payload, out),
            ConsensusMessage::RecoveryMessage(recovery) => {
                self.on_recovery_message(payload, recovery, out)
            }
        }
    }

    fn on_prepare_request(
        &mut self,
        payload: &ConsensusPayload,
        request: &PrepareRequest,
        out: &mut EngineOutput,
    ) -> Result<()> {
        if self.state.request_sent_or_received() || self.not_accepting_payloads() {
            debug!("Ignoring PrepareRequest from validator {}", payload.validator_index);
            return Ok(());
        }
        let primary = self.state.primary_index;
        if usize::from(payload.validator_index) != primary {
            return Err(ConsensusError::UnauthorizedSender {
                validator_index: payload.validator_index,
                reason: "PrepareRequest from a validator that is not the primary",
            });
        }
        if payload.view_number != self.state.view_number {
            return Err(self.stale(payload.block_index, payload.view_number));
        }
        if request.version != self.state.version || request.prev_hash != self.state.prev_hash {
            warn!(
                "PrepareRequest does not extend the local tip: version={} prev_hash={}",
                request.version, request.prev_hash
            );
            return Ok(());
        }
        let now = now_ms();
        let max_timestamp = now.saturating_add(self.config.clock_skew_tolerance_ms);
        if request.timestamp <= self.state.prev_timestamp || request.timestamp > max_timestamp {
            warn!(
                "Timestamp incorrect: {} (previous block {}, local clock {now})",
                request.timestamp, self.state.prev_timestamp
            );
            return Ok(());
        }

        // Check the primary's signature before touching the round state.
        let header = BlockHeader {
            timestamp: request.timestamp,
            nonce: request.nonce,
            merkle_root: crate::types::merkle_root(&request.transaction_hashes),
            ..self.state.candidate_header()
        };
        if !self.verify(&header, Phase::Prepare, primary, &request.signature) {
            return Err(ConsensusError::UnauthorizedSender {
                validator_index: payload.validator_index,
                reason: "invalid PrepareRequest signature",
            });
        }
        if let Some(hash) = request
            .transaction_hashes
            .iter()
            .find(|hash| self.ledger.contains_transaction(hash))
        {
            warn!("Invalid PrepareRequest: transaction {hash} is already on chain");
            return self.request_change_view(ChangeViewReason::TxInvalid, out);
        }

        self.extend_timer_by_factor(2);
        let preparation_hash = payload.hash()?;
        info!(
            "PrepareRequest received: height={} view={} index={} tx={}",
            payload.block_index,
            payload.view_number,
            payload.validator_index,
            request.transaction_hashes.len()
        );
        self.state.timestamp = request.timestamp;
        self.state.nonce = request.nonce;
        self.state.transaction_hashes = request.transaction_hashes.clone();
        self.state.transactions.clear();
        self.state.prepare_request = Some(request.clone());
        self.state.preparation_hash = Some(preparation_hash);
        self.state.flags.insert(RoleFlags::REQUEST_RECEIVED);

        self.reverify_pending(&header, preparation_hash);
        self.record_preparation(primary, preparation_hash, request.signature, true)?;

        if self.state.transaction_hashes.is_empty() {
            return self.check_prepare_response(out);
        }
        let hashes = self.state.transaction_hashes.clone();
        for hash in &hashes {
            let Some(transaction) = self.mempool.get_transaction(hash) else {
                continue;
            };
            if !self.add_transaction(transaction, out)? {
                return Ok(());
            }
        }
        let missing = self.state.missing_transactions();
        if !missing.is_empty() {
            debug!("Requesting {} missing transactions", missing.len());
            out.missing_transactions.extend(missing);
        }
        Ok(())
    }

    fn on_prepare_response(
        &mut self,
        payload: &ConsensusPayload,
        response: &PrepareResponse,
        out: &mut EngineOutput,
    ) -> Result<()> {
        if payload.view_number != self.state.view_number {
            return Err(self.stale(payload.block_index, payload.view_number));
        }
        if response.round_id != 0 {
            return self.record_fallback_endorsement(
                payload.validator_index,
                response.round_id,
                response.preparation_hash,
                "fallback prepare",
            );
        }
        let index = usize::from(payload.validator_index);
        if index == self.state.primary_index {
            return Err(ConsensusError::UnauthorizedSender {
                validator_index: payload.validator_index,
                reason: "the primary endorses through its PrepareRequest",
            });
        }
        if let Some(existing) = self.state.preparations.get(index).copied().flatten() {
            if existing.preparation_hash == response.preparation_hash
                && existing.signature == response.signature
            {
                debug!("Duplicate PrepareResponse from validator {index}");
                return Ok(());
            }
            // An entry stored before the header was known may be replaced.
            if self.state.prepare_signatures.contains(index) {
                return Err(ConsensusError::ConflictingVote {
                    validator_index: payload.validator_index,
                    phase: Phase::Prepare.as_str(),
                });
            }
        }
        if self.not_accepting_payloads() {
            debug!("View changing, ignoring PrepareResponse from validator {index}");
            return Ok(());
        }
        let header = self.state.header();
        if let (Some(header), Some(expected)) = (&header, self.state.preparation_hash) {
            if response.preparation_hash != expected {
                return Err(ConsensusError::UnauthorizedSender {
                    validator_index: payload.validator_index,
                    reason: "PrepareResponse endorses a different proposal",
                });
            }
            if !self.verify(header, Phase::Prepare, index, &response.signature) {
                return Err(ConsensusError::UnauthorizedSender {
                    validator_index: payload.validator_index,
                    reason: "invalid PrepareResponse signature",
                });
            }
        }

        self.extend_timer_by_factor(2);
        info!(
            "PrepareResponse received: height={} view={} index={index}",
            payload.block_index, payload.view_number
        );
        self.record_preparation(
            index,
            response.preparation_hash,
            response.signature,
            header.is_some(),
        )?;
        if self.state.watch_only() || self.state.commit_sent() {
            return Ok(());
        }
        if self.state.request_sent_or_received() {
            self.check_preparations(out)?;
        }
        Ok(())
    }

    fn on_pre_commit(&mut self, payload: &ConsensusPayload, pre_commit: &PreCommit) -> Result<()> {
        if payload.view_number != self.state.view_number {
            return Err(self.stale(payload.block_index, payload.view_number));
        }
        self.record_fallback_endorsement(
            payload.validator_index,
            pre_commit.round_id,
            pre_commit.preparation_hash,
            "precommit",
        )
    }

    fn on_commit(
        &mut self,
        payload: &ConsensusPayload,
        commit: &Commit,
        out: &mut EngineOutput,
    ) -> Result<()> {
        let index = usize::from(payload.validator_index);
        let entry = CommitEntry {
            view_number: payload.view_number,
            signature: commit.signature,
        };
        if let Some(existing) = self.state.commits.get(index).copied().flatten() {
            if existing == entry {
                debug!("Duplicate Commit from validator {index}");
                return Ok(());
            }
            if self.state.commit_signatures.contains(index) {
                warn!(
                    "Rejected Commit: height={} index={index} view={} existing view={}",
                    payload.block_index, payload.view_number, existing.view_number
                );
                return Err(ConsensusError::ConflictingVote {
                    validator_index: payload.validator_index,
                    phase: Phase::Commit.as_str(),
                });
            }
        }
        if payload.view_number != self.state.view_number {
            debug!(
                "Recording Commit from validator {index} in view {}",
                payload.view_number
            );
            self.state.commits[index] = Some(entry);
            return Ok(());
        }

        self.extend_timer_by_factor(4);
        info!(
            "Commit received: height={} view={} index={index}",
            payload.block_index, payload.view_number
        );
        let Some(header) = self.state.header() else {
            self.state.commits[index] = Some(entry);
            return Ok(());
        };
        if !self.verify(&header, Phase::Commit, index, &commit.signature) {
            return Err(ConsensusError::UnauthorizedSender {
                validator_index: payload.validator_index,
                reason: "invalid Commit signature",
            });
        }
        self.state.commits[index] = Some(entry);
        self.state.commit_signatures.add(index, commit.signature)?;
        self.check_commits(out)
    }

    fn on_change_view(
        &mut self,
        payload: &ConsensusPayload,
        change_view: &ChangeView,
        out: &mut EngineOutput,
    ) -> Result<()> {
        let Some(new_view) = payload.new_view_number() else {
            return Err(crate::error::FormatError::ViewOverflow(payload.view_number).into());
        };
        let sign_data = change_view_sign_data(
            payload.block_index,
            payload.validator_index,
            payload.view_number,
            change_view.timestamp,
        );
        let index = usize::from(payload.validator_index);
        if !self.verify_data(&sign_data, index, &change_view.signature) {
            return Err(ConsensusError::UnauthorizedSender {
                validator_index: payload.validator_index,
                reason: "invalid ChangeView signature",
            });
        }
        if new_view <= self.state.view_number {
            self.on_recovery_request(payload, out)?;
        }
        if self.state.commit_sent() {
            return Ok(());
        }
        if new_view <= self.state.expected_view[index] {
            return Ok(());
        }
        warn!(
            "ChangeView received: height={} view={} index={index} nv={new_view} reason={}",
            payload.block_index, payload.view_number, change_view.reason
        );
        self.state.expected_view[index] = new_view;
        self.state.change_views[index] = Some(ChangeViewCompact {
            validator_index: payload.validator_index,
            original_view_number: payload.view_number,
            timestamp: change_view.timestamp,
            signature: change_view.signature,
        });
        self.check_expected_view(out)
    }

    fn process_transaction(&mut self, transaction: Transaction, out: &mut EngineOutput) -> Result<()> {
        if !self.state.is_backup()
            || self.not_accepting_payloads()
            || !self.state.request_sent_or_received()
            || self.state.response_sent()
            || self.state.block_sent()
        {
            return Ok(());
        }
        let hash = transaction.hash();
        if self.state.transactions.contains_key(&hash)
            || !self.state.transaction_hashes.contains(&hash)
        {
            return Ok(());
        }
        if self.ledger.contains_transaction(&hash) {
            warn!("Proposed transaction {hash} is already on chain");
            return self.request_change_view(ChangeViewReason::TxInvalid, out);
        }
        self.add_transaction(transaction, out).map(|_| ())
    }

    // -- Progress checks --

    /// Verify and store a proposed transaction. Returns false if it was
    /// rejected and a view change was requested.
    fn add_transaction(&mut self, transaction: Transaction, out: &mut EngineOutput) -> Result<bool> {
        let hash = transaction.hash();
        let reason = match self.ledger.verify_transaction(&transaction) {
            TransactionVerdict::Valid => None,
            TransactionVerdict::Invalid => Some(ChangeViewReason::TxInvalid),
            TransactionVerdict::RejectedByPolicy => Some(ChangeViewReason::TxRejectedByPolicy),
        };
        if let Some(reason) = reason {
            warn!("Rejected transaction {hash}: {reason}");
            self.request_change_view(reason, out)?;
            return Ok(false);
        }
        self.state.transactions.insert(hash, transaction);
        self.check_prepare_response(out)?;
        Ok(true)
    }

    fn check_prepare_response(&mut self, out: &mut EngineOutput) -> Result<()> {
        if !self.state.transactions_complete()
            || self.state.is_primary()
            || self.state.watch_only()
            || self.state.response_sent()
        {
            return Ok(());
        }
        let (Some(header), Some(preparation_hash), Some(me)) = (
            self.state.header(),
            self.state.preparation_hash,
            self.state.my_index(),
        ) else {
            return Ok(());
        };
        self.extend_timer_by_factor(2);
        let signature = match self.sign(&header, Phase::Prepare) {
            Ok(signature) => signature,
            Err(err) => return self.abort_round(err, out),
        };
        info!(
            "Sending PrepareResponse: height={} view={}",
            self.state.height, self.state.view_number
        );
        self.broadcast(
            ConsensusMessage::PrepareResponse(PrepareResponse {
                preparation_hash,
                round_id: 0,
                signature,
            }),
            out,
        )?;
        self.record_preparation(me, preparation_hash, signature, true)?;
        self.check_preparations(out)
    }

    fn check_preparations(&mut self, out: &mut EngineOutput) -> Result<()> {
        if self.state.watch_only()
            || self.state.commit_sent()
            || !self.state.prepare_signatures.has_quorum()
            || !self.state.transactions_complete()
        {
            return Ok(());
        }
        let (Some(header), Some(me)) = (self.state.header(), self.state.my_index()) else {
            return Ok(());
        };
        let signature = match self.sign(&header, Phase::Commit) {
            Ok(signature) => signature,
            Err(err) => return self.abort_round(err, out),
        };
        if let Err(err) = self.save_round(me, signature) {
            return self.abort_round(err, out);
        }
        info!(
            "Sending Commit: height={} view={}",
            self.state.height, self.state.view_number
        );
        self.broadcast(ConsensusMessage::Commit(Commit { signature }), out)?;
        self.state.commits[me] = Some(CommitEntry {
            view_number: self.state.view_number,
            signature,
        });
        self.state.commit_signatures.add(me, signature)?;
        self.state.flags.insert(RoleFlags::COMMIT_SENT);
        self.change_timer(self.config.block_interval());
        self.check_commits(out)
    }

    fn check_commits(&mut self, out: &mut EngineOutput) -> Result<()> {
        if self.state.block_sent()
            || !self.state.commit_signatures.has_quorum()
            || !self.state.transactions_complete()
        {
            return Ok(());
        }
        let Some(header) = self.state.header() else {
            return Ok(());
        };
        let witness = self.state.commit_signatures.assemble_witness()?;
        let block = Block {
            header,
            transactions: self.state.ordered_transactions(),
            witness,
        };
        info!(
            "Block finalized: height={} view={} hash={} tx={}",
            block.index(),
            self.state.view_number,
            block.hash(),
            block.transactions.len()
        );
        self.state.flags.insert(RoleFlags::BLOCK_SENT);
        self.timer.cancel();
        out.block = Some(block);
        Ok(())
    }

    /// Move to the highest view that `M` validators have asked for, if it is
    /// ahead of the current one.
    pub(crate) fn check_expected_view(&mut self, out: &mut EngineOutput) -> Result<()> {
        let mut requested = self.state.expected_view.clone();
        requested.sort_unstable_by(|a, b| b.cmp(a));
        // The M-th highest request is the highest view a quorum supports.
        let Some(&view) = requested.get(self.state.quorum().saturating_sub(1)) else {
            return Ok(());
        };
        if view <= self.state.view_number {
            return Ok(());
        }
        if let Some(me) = self.state.my_index() {
            if self.state.expected_view[me] < view {
                // The quorum moves on whether or not this node can sign.
                if let Err(err) = self.send_change_view(ChangeViewReason::ChangeAgreement, out) {
                    warn!("Could not send ChangeAgreement: {err}");
                }
            }
        }
        self.initialize_consensus(view);
        Ok(())
    }

    // -- View change --

    pub(crate) fn request_change_view(
        &mut self,
        reason: ChangeViewReason,
        out: &mut EngineOutput,
    ) -> Result<()> {
        if self.state.watch_only() {
            return Ok(());
        }
        let Some(expected) = self.state.view_number.checked_add(1) else {
            warn!("View number exhausted at height {}", self.state.height);
            return Ok(());
        };
        self.change_timer(self.backoff(expected));
        if self.more_than_f_committed_or_lost() {
            return self.request_recovery(out);
        }
        info!(
            "Sending ChangeView: height={} view={} nv={expected} nc={} nf={} reason={reason}",
            self.state.height,
            self.state.view_number,
            self.state.count_committed(),
            self.count_failed()
        );
        self.send_change_view(reason, out)?;
        self.check_expected_view(out)
    }

    fn send_change_view(&mut self, reason: ChangeViewReason, out: &mut EngineOutput) -> Result<()> {
        let Some(me) = self.state.my_index() else {
            return Ok(());
        };
        let timestamp = now_ms();
        let sign_data = change_view_sign_data(
            self.state.height,
            u8::try_from(me).unwrap_or(u8::MAX),
            self.state.view_number,
            timestamp,
        );
        let signature = self.wallet.sign(&sign_data, &self.identity)?;
        let payload = self.broadcast(
            ConsensusMessage::ChangeView(ChangeView {
                timestamp,
                reason,
                signature,
            }),
            out,
        )?;
        if let Some(new_view) = payload.new_view_number() {
            self.state.expected_view[me] = self.state.expected_view[me].max(new_view);
            self.state.change_views[me] = Some(ChangeViewCompact {
                validator_index: payload.validator_index,
                original_view_number: payload.view_number,
                timestamp,
                signature,
            });
        }
        Ok(())
    }

    // -- Persistence --

    /// Save the round with this node's Commit `signature` in it.
    fn save_round(&self, me: usize, signature: Signature) -> Result<()> {
        let (Some(store), Some(prepare_request), Some(preparation_hash)) = (
            &self.store,
            &self.state.prepare_request,
            self.state.preparation_hash,
        ) else {
            return Ok(());
        };
        let view_number = self.state.view_number;
        let preparations = self
            .state
            .prepare_signatures
            .iter()
            .filter_map(|(index, signature)| {
                Some(PreparationCompact {
                    validator_index: u8::try_from(index).ok()?,
                    signature: *signature,
                })
            })
            .collect();
        let commits = self
            .state
            .commit_signatures
            .iter()
            .map(|(index, signature)| (index, *signature))
            .chain(std::iter::once((me, signature)))
            .filter_map(|(index, signature)| {
                Some(CommitCompact {
                    view_number,
                    validator_index: u8::try_from(index).ok()?,
                    signature,
                })
            })
            .collect();
        store.save(&RoundSnapshot {
            version: self.state.version,
            height: self.state.height,
            prev_hash: self.state.prev_hash,
            view_number,
            prepare_request: prepare_request.clone(),
            preparation_hash,
            transactions: self.state.ordered_transactions(),
            preparations,
            commits,
        })?;
        debug!(
            "Saved consensus state: height={} view={view_number}",
            self.state.height
        );
        Ok(())
    }

    /// Load the saved round if it is this node's commit at the current
    /// height. Every stored signature is checked again before it counts.
    fn restore_round(&mut self) -> Result<bool> {
        let Some(store) = self.store.clone() else {
            return Ok(false);
        };
        let Some(snapshot) = store.load()? else {
            return Ok(false);
        };
        let Some(me) = self.state.my_index() else {
            return Ok(false);
        };
        if snapshot.height != self.state.height
            || snapshot.version != self.state.version
            || snapshot.prev_hash != self.state.prev_hash
        {
            debug!(
                "Saved consensus state is for height {}, consensus is at height {}",
                snapshot.height, self.state.height
            );
            return Ok(false);
        }

        if snapshot.view_number != self.state.view_number {
            self.state.advance_view(snapshot.view_number);
        }
        let request = snapshot.prepare_request;
        self.state.timestamp = request.timestamp;
        self.state.nonce = request.nonce;
        self.state.transaction_hashes = request.transaction_hashes.clone();
        self.state.transactions = snapshot
            .transactions
            .into_iter()
            .map(|transaction| (transaction.hash(), transaction))
            .collect();
        self.state.prepare_request = Some(request);
        self.state.preparation_hash = Some(snapshot.preparation_hash);
        self.state.flags.insert(if self.state.is_primary() {
            RoleFlags::REQUEST_SENT
        } else {
            RoleFlags::REQUEST_RECEIVED
        });
        for compact in snapshot.preparations {
            let index = usize::from(compact.validator_index);
            if let Some(slot) = self.state.preparations.get_mut(index) {
                *slot = Some(Preparation {
                    preparation_hash: snapshot.preparation_hash,
                    signature: compact.signature,
                });
            }
        }
        let view_number = self.state.view_number;
        for compact in snapshot
            .commits
            .into_iter()
            .filter(|compact| compact.view_number == view_number)
        {
            let index = usize::from(compact.validator_index);
            if let Some(slot) = self.state.commits.get_mut(index) {
                *slot = Some(CommitEntry {
                    view_number,
                    signature: compact.signature,
                });
            }
        }
        let header = self.state.candidate_header();
        self.reverify_pending(&header, snapshot.preparation_hash);

        if !self.state.commit_signatures.contains(me) {
            warn!(
                "Saved consensus state at height {} holds no valid Commit of ours",
                self.state.height
            );
            self.initialize_consensus(0);
            return Ok(false);
        }
        self.state.flags.insert(RoleFlags::COMMIT_SENT);
        self.change_timer(self.config.block_interval());
        info!(
            "Restored committed round: height={} view={} commits={}",
            self.state.height,
            self.state.view_number,
            self.state.commit_signatures.count()
        );
        Ok(true)
    }

    /// Broadcast this node's recorded Commit again.
    fn resend_commit(&mut self, out: &mut EngineOutput) -> Result<()> {
        let Some(commit) = self
            .state
            .my_index()
            .and_then(|me| self.state.commits.get(me).copied().flatten())
        else {
            return Ok(());
        };
        info!(
            "Resending Commit: height={} view={}",
            self.state.height, self.state.view_number
        );
        self.broadcast(
            ConsensusMessage::Commit(Commit {
                signature: commit.signature,
            }),
            out,
        )?;
        self.check_commits(out)
    }

    fn request_recovery(&mut self, out: &mut EngineOutput) -> Result<()> {
        info!(
            "Sending RecoveryRequest: height={} view={} nc={} nf={}",
            self.state.height,
            self.state.view_number,
            self.state.count_committed(),
            self.count_failed()
        );
        self.broadcast(
            ConsensusMessage::RecoveryRequest(RecoveryRequest {
                timestamp: now_ms(),
            }),
            out,
        )
        .map(|_| ())
    }

    /// A local fault stops this node from contributing to the round; ask to
    /// move on.
    fn abort_round(&mut self, err: ConsensusError, out: &mut EngineOutput) -> Result<()> {
        error!(
            "Local fault at height={} view={}: {err}",
            self.state.height, self.state.view_number
        );
        self.request_change_view(ChangeViewReason::Timeout, out)
    }

    // -- Bookkeeping helpers --

    fn record_preparation(
        &mut self,
        index: usize,
        preparation_hash: Hash,
        signature: Signature,
        verified: bool,
    ) -> Result<()> {
        self.state.preparations[index] = Some(Preparation {
            preparation_hash,
            signature,
        });
        if verified {
            self.state.prepare_signatures.add(index, signature)?;
        }
        Ok(())
    }

    /// Drop early preparations for another proposal and check the signatures
    /// of everything stored before the header was known.
    fn reverify_pending(&mut self, header: &BlockHeader, preparation_hash: Hash) {
        for index in 0..self.state.validator_count {
            let Some(preparation) = self.state.preparations[index] else {
                continue;
            };
            if preparation.preparation_hash != preparation_hash
                || !self.verify(header, Phase::Prepare, index, &preparation.signature)
            {
                debug!("Discarding early PrepareResponse from validator {index}");
                self.state.preparations[index] = None;
            } else if let Err(err) = self
                .state
                .prepare_signatures
                .add(index, preparation.signature)
            {
                warn!("Early PrepareResponse from validator {index}: {err}");
            }
        }
        for index in 0..self.state.validator_count {
            let Some(commit) = self.state.commits[index] else {
                continue;
            };
            if commit.view_number != self.state.view_number {
                continue;
            }
            if !self.verify(header, Phase::Commit, index, &commit.signature) {
                debug!("Discarding early Commit from validator {index}");
                self.state.commits[index] = None;
            } else if let Err(err) = self.state.commit_signatures.add(index, commit.signature) {
                warn!("Early Commit from validator {index}: {err}");
            }
        }
    }

    fn record_fallback_endorsement(
        &mut self,
        validator_index: u8,
        round_id: u32,
        preparation_hash: Hash,
        phase: &'static str,
    ) -> Result<()> {
        if let Some(expected) = self.state.preparation_hash {
            if preparation_hash != expected {
                return Err(ConsensusError::UnauthorizedSender {
                    validator_index,
                    reason: "fallback endorsement for a different proposal",
                });
            }
        }
        let key = (round_id, validator_index);
        match self.state.fallback_endorsements.get(&key) {
            Some(existing) if *existing == preparation_hash => Ok(()),
            Some(_) => Err(ConsensusError::ConflictingVote {
                validator_index,
                phase,
            }),
            None => {
                debug!(
                    "Recorded {phase} endorsement: round_id={round_id} index={validator_index}"
                );
                self.state
                    .fallback_endorsements
                    .insert(key, preparation_hash);
                Ok(())
            }
        }
    }

    pub(crate) fn broadcast(
        &self,
        message: ConsensusMessage,
        out: &mut EngineOutput,
    ) -> Result<ConsensusPayload> {
        let Some(me) = self
            .state
            .my_index()
            .and_then(|i| u8::try_from(i).ok())
        else {
            return Err(ConsensusError::UnauthorizedSender {
                validator_index: u8::MAX,
                reason: "watch-only node cannot send",
            });
        };
        let payload = ConsensusPayload::new(self.state.height, me, self.state.view_number, message);
        out.messages.push(payload.clone());
        Ok(payload)
    }

    fn sign(&self, header: &BlockHeader, phase: Phase) -> Result<Signature> {
        Ok(self.wallet.sign(&header.signing_bytes(phase), &self.identity)?)
    }

    fn verify(
        &self,
        header: &BlockHeader,
        phase: Phase,
        index: usize,
        signature: &Signature,
    ) -> bool {
        self.verify_data(&header.signing_bytes(phase), index, signature)
    }

    fn verify_data(&self, data: &[u8], index: usize, signature: &Signature) -> bool {
        self.validators
            .get(index)
            .is_some_and(|pubkey| self.wallet.verify(data, signature, pubkey))
    }

    fn change_timer(&mut self, delay: Duration) {
        self.timer.arm(
            self.state.height,
            self.state.view_number,
            delay,
            Instant::now(),
        );
    }

    /// Push the deadline back by `factor * block_interval / M`.
    fn extend_timer_by_factor(&mut self, factor: u32) {
        if self.state.watch_only() || self.state.view_changing() || self.state.commit_sent() {
            return;
        }
        let quorum = u32::try_from(self.state.quorum()).unwrap_or(u32::MAX).max(1);
        let extra = self.config.block_interval().saturating_mul(factor) / quorum;
        self.timer.extend(extra);
    }

    fn backoff(&self, view: u8) -> Duration {
        timeout::backoff_delay(
            self.config.block_interval(),
            view,
            self.config.max_backoff_exponent,
        )
    }

    /// Validators not heard from since before the previous height.
    pub fn count_failed(&self) -> usize {
        let threshold = self.state.height.saturating_sub(1);
        self.last_seen.iter().filter(|seen| **seen < threshold).count()
    }

    pub fn more_than_f_committed_or_lost(&self) -> bool {
        self.state.count_committed().saturating_add(self.count_failed())
            > self.state.fault_tolerance()
    }

    pub(crate) fn not_accepting_payloads(&self) -> bool {
        self.state.view_changing() && !self.more_than_f_committed_or_lost()
    }

    fn stale(&self, height: u32, view: u8) -> ConsensusError {
        ConsensusError::StaleRound {
            height,
            view,
            current_height: self.state.height,
            current_view: self.state.view_number,
        }
    }

    fn log_result(&self, what: &str, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(err) if err.is_stale() => debug!("Dropped {what}: {err}"),
            Err(err) => warn!("Dropped {what}: {err}"),
        }
    }
}

fn now_ms() -> u64 {
    solana_time_utils::timestamp()
}
