//! dBFT consensus service.
//!
//! Owns a [`ConsensusEngine`] on a dedicated thread and drives it from a
//! channel of [`ConsensusEvent`]s:
//!
//! ```text
//!  events ──▶ ┌──────────────────────┐ ──▶ Transport::relay
//!             │   ConsensusService   │ ──▶ Transport::request_missing
//!   timer ──▶ │  (ConsensusEngine)   │ ──▶ Ledger::submit_block
//!             └──────────────────────┘
//! ```
//!
//! The engine never blocks; every side effect it asks for is performed here,
//! after the engine step returns.

use {
    crate::{
        engine::{ConsensusEngine, EngineOutput},
        interfaces::{ConsensusEvent, Ledger, Transport},
        message::MessageCodec,
    },
    crossbeam_channel::{Receiver, RecvTimeoutError},
    log::*,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Upper bound on how long the loop blocks, so `exit` is noticed promptly.
const TIMEOUT_POLL_INTERVAL_MS: u64 = 50;

pub struct ConsensusService {
    thread: JoinHandle<()>,
}

impl ConsensusService {
    /// Spawn the consensus thread. The engine is started on the new thread.
    pub fn new(
        engine: ConsensusEngine,
        ledger: Arc<dyn Ledger>,
        transport: Arc<dyn Transport>,
        event_receiver: Receiver<ConsensusEvent>,
        exit: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let thread = Builder::new()
            .name("dbftConsensus".to_string())
            .spawn(move || {
                let mut driver = Driver {
                    codec: *engine.codec(),
                    engine,
                    ledger,
                    transport,
                };
                driver.run(&event_receiver, &exit);
            })?;
        Ok(Self { thread })
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

struct Driver {
    engine: ConsensusEngine,
    codec: MessageCodec,
    ledger: Arc<dyn Ledger>,
    transport: Arc<dyn Transport>,
}

impl Driver {
    fn run(&mut self, event_receiver: &Receiver<ConsensusEvent>, exit: &AtomicBool) {
        info!(
            "ConsensusService: starting at height {} (identity: {})",
            self.engine.height(),
            self.engine.identity()
        );
        let output = self.engine.start();
        self.perform(output);

        loop {
            if exit.load(Ordering::Relaxed) {
                info!("ConsensusService: exit signal received, shutting down");
                break;
            }

            let poll = Duration::from_millis(TIMEOUT_POLL_INTERVAL_MS);
            let wait = self
                .engine
                .time_to_next_timeout(Instant::now())
                .map_or(poll, |remaining| remaining.min(poll));

            match event_receiver.recv_timeout(wait) {
                Ok(event) => {
                    let output = self.handle_event(event);
                    self.perform(output);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("ConsensusService: event channel disconnected, shutting down");
                    break;
                }
            }

            if let Some(timeout) = self.engine.take_expired_timeout(Instant::now()) {
                debug!(
                    "ConsensusService: timeout at height={} view={}",
                    timeout.height, timeout.view
                );
                let output = self.engine.on_timeout(timeout);
                self.perform(output);
            }
        }

        info!(
            "ConsensusService: consensus loop exited at height {}",
            self.engine.height()
        );
    }

    fn handle_event(&mut self, event: ConsensusEvent) -> EngineOutput {
        match event {
            ConsensusEvent::Payload(bytes) => match self.codec.decode(&bytes) {
                Ok(payload) => {
                    trace!(
                        "ConsensusService: received {} for height={} view={}",
                        payload.message.kind(),
                        payload.block_index,
                        payload.view_number
                    );
                    self.engine.on_payload(payload)
                }
                Err(err) => {
                    warn!("ConsensusService: dropping malformed payload: {err}");
                    EngineOutput::default()
                }
            },
            ConsensusEvent::NewInventory(transaction) => self.engine.on_transaction(transaction),
            ConsensusEvent::BlockPersisted(height) => self.engine.on_block_persisted(height),
            ConsensusEvent::Timeout(timeout) => self.engine.on_timeout(timeout),
        }
    }

    fn perform(&self, output: EngineOutput) {
        let EngineOutput {
            messages,
            missing_transactions,
            block,
        } = output;
        for payload in &messages {
            match self.codec.encode(payload) {
                Ok(bytes) => {
                    trace!("ConsensusService: relaying {}", payload.message.kind());
                    if !self.transport.relay(&bytes) {
                        warn!(
                            "ConsensusService: transport refused {}",
                            payload.message.kind()
                        );
                    }
                }
                Err(err) => error!(
                    "ConsensusService: failed to encode {}: {err}",
                    payload.message.kind()
                ),
            }
        }
        if !missing_transactions.is_empty() {
            self.transport.request_missing(&missing_transactions);
        }
        if let Some(block) = block {
            let height = block.index();
            if !self.ledger.submit_block(block) {
                error!("ConsensusService: ledger rejected block {height}");
            }
        }
    }
}
