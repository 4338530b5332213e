//! Autonomous terminal agent.
//!
//! A language model drives a shell (local or over SSH) one JSON action at a
//! time until the goal is reached. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (command validation, reply
//!   parsing, action decoding, the bounded context store, the plan tracker).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (configuration, processes, shells,
//!   the model transport, file operations, the human operator). Behind traits
//!   to enable scripted doubles in tests.
//!
//! Orchestration modules ([`session`], [`dispatch`], [`planning`],
//! [`summarize`], [`analysis`]) coordinate core logic with I/O to run the
//! control loop. [`ask`] is the question-only mode that runs nothing.

pub mod analysis;
pub mod ask;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod planning;
pub mod session;
pub mod summarize;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
