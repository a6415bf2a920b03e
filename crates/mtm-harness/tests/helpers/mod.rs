//! Shared integration test helpers

pub mod harness;

pub use harness::{fast_config, init_tracing, TestHarness};
