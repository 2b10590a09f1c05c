//! Deterministic, pure logic shared by the scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod deferral;
pub mod events;
pub mod exclusion;
pub mod frontmatter;
pub mod redact;
pub mod remediation;
pub mod selector;
pub mod types;
