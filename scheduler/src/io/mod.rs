//! I/O helpers for scheduler commands.

pub mod backend;
pub mod config;
pub mod lock;
pub mod memory;
pub mod platform;
pub mod process;
pub mod prompt;
pub mod roster;
pub mod run_state;
pub mod task_log;
