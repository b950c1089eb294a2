//! dBFT End-to-End Test Suite
//!
//! Simulates a validator network by wiring several consensus engines to an
//! in-memory message queue, plus one run of real service threads over
//! channels. No sockets and no persistent storage.
//!
//! Each test file can be run independently:
//!
//! ```bash
//! cargo test -p dbft-e2e-tests --test basic_network -- --nocapture
//! cargo test -p dbft-e2e-tests --test view_change -- --nocapture
//! cargo test -p dbft-e2e-tests --test recovery -- --nocapture
//! cargo test -p dbft-e2e-tests --test service_network -- --nocapture
//! ```

pub mod helpers;
