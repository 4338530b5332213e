//! Deterministic, pure logic shared by the agent.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests. The
//! only collaborator a core module talks to is passed in as a trait object
//! (see [`context::Summarizer`]).

pub mod action;
pub mod context;
pub mod parser;
pub mod plan;
pub mod types;
pub mod validator;
