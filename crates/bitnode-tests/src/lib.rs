//! # bitnode-tests
//!
//! Integration tests for the bitnode connection engine.
//!
//! This crate provides:
//! - Wire-level tests driving real connection workers over in-memory pipes
//! - Connection pool tests under concurrent registration
//! - End-to-end service tests over loopback TCP
//! - Property-based tests for framing and inventory handling

pub mod generators;
pub mod harness;


#[cfg(test)]
mod pool_tests;



pub use generators::*;
pub use harness::*;
