//! Plugin Loader Unsafe Primitives - Consolidated Unsafe Code
//!
//! Every `unsafe impl` the kernel model needs lives here so the other crates
//! can stay `#![deny(unsafe_code)]`.
//!
//! # Module Organization
//!
//! - `sync` - Recursive owner-tagged spin lock guarding the scheduler state
//! - `loom_tests` - Concurrency tests using loom (with `loom` feature)
//!
//! # Verification
//!
//! 1. **Loom tests** (`cargo test --features loom`): every interleaving of
//!    two contending owners is explored
//! 2. **Unit tests**: reentrancy and release bookkeeping

#![no_std]

pub mod sync;

#[cfg(any(test, feature = "loom"))]
mod loom_tests;

pub use sync::{LockOwner, RecursiveLock, RecursiveLockGuard};
