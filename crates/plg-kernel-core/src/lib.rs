//! Plugin Loader Kernel Core - Threads, Scheduling Masks, Process Control
//!
//! This crate models the part of the kernel the plugin loader extends: the
//! global thread list with per-thread scheduling masks, one scheduler per
//! core with cross-core reschedule requests, reference-counted process
//! objects behind per-process handle tables, and the privileged
//! process-control operation used to lock and unlock a plugin's threads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     plg-kernel-core                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌────────────────────┐               │
//! │   │  KernelState  │    │  control_process() │               │
//! │   │  - processes  │───▶│  lock / unlock     │               │
//! │   │  - threads    │    │  handles, MMU, VA  │               │
//! │   │  - cores      │    └────────────────────┘               │
//! │   └───────────────┘               │                         │
//! │          ▲                        ▼                         │
//! │   ┌───────────────┐    ┌────────────────────┐               │
//! │   │    Kernel     │    │   ScheduleReport   │               │
//! │   │ RecursiveLock │    │  locked / unlocked │               │
//! │   │  (per core)   │    │  interrupted cores │               │
//! │   └───────────────┘    └────────────────────┘               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                plg-hal / plg-loader                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The core never logs. What a schedule operation changed is returned in a
//! `ScheduleReport` so the caller decides what to record.
//!
//! # Module Organization
//!
//! - `types` - ids, `SchedulingMask`, process flags, kernel objects
//! - `capability` - per-process handle tables
//! - `state` - `KernelState` and the per-core schedulers
//! - `process_op` - `control_process` and the `ThreadPredicate` seam
//! - `kernel` - `Kernel`, the state behind the recursive critical section
//! - `invariants` - runtime-checkable invariants

#![no_std]
#![deny(unsafe_code)]
extern crate alloc;

pub mod capability;
pub mod error;
pub mod invariants;
pub mod kernel;
pub mod process_op;
pub mod state;
pub mod types;

pub use capability::HandleTable;
pub use error::KernelError;
pub use invariants::{check_all_invariants, InvariantViolation};
pub use kernel::Kernel;
pub use process_op::{
    control_process, Caller, ProcessOp, ProcessOpOutput, ScheduleMode, ScheduleReport,
    ThreadPredicate,
};
pub use state::{CoreScheduler, KernelState};
pub use types::{
    CoreId, Handle, MemoryPermissions, ObjectClass, ObjectId, ProcessFlags, ProcessId,
    SchedulingMask, Thread, ThreadId, ThreadState, ThreadView, PAGE_SIZE, TLS_WORDS,
};
