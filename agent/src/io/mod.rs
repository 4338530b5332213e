//! I/O helpers: configuration, processes, shells, the model transport, the
//! operator, file operations, prompts and plan persistence.

pub mod config;
pub mod files;
pub mod model;
pub mod operator;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod shell;
pub mod web_search;
