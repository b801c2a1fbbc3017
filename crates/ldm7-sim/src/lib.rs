//! Deterministic end-to-end simulation of the LDM-7 core.
//!
//! Pairs a real upstream and downstream over loopback TCP and an
//! in-process multicast channel, injects seeded loss, and checks the
//! observable outcomes: queue contents, signatures, session memory, and
//! backstop/backlog accounting.

pub mod harness;
pub mod loss;
pub mod scenarios;

pub use harness::{wait_until, Pair, SimJoiner};
pub use loss::{expected_deletions, seed_from_triple, LossyTransport};
pub use scenarios::{all, Scenario};
