//! Shared plumbing for the demo binaries.

pub mod common;
