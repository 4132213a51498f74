//! Plugin Loader Service
//!
//! Loads one plugin into a host process and keeps it alive across the host's
//! lifecycle: memory-pressure swaps out to storage and back, and teardown
//! when the host exits. Hosts and plugins drive it over a synchronous
//! command channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           plg-loader                             │
//! │                                                                  │
//! │  ┌───────────────┐   ┌─────────────────────────────────────┐     │
//! │  │ LoaderService │──▶│            PluginLoader             │     │
//! │  │ (RPC 1..13)   │   │  LoaderContext   Handshake  Journal │     │
//! │  └───────────────┘   │  TaskQueue       PluginMemoryBlock  │     │
//! │                      └─────────────────────────────────────┘     │
//! │      kernel notification ───▶ handle_lifecycle_notification()    │
//! └──────────────────────────────────────────────────────────────────┘
//!                │                                  │
//!                ▼                                  ▼
//!      ┌───────────────────┐              ┌───────────────────┐
//!      │  plg_hal::Hal     │              │ plg_hal::SwapStore│
//!      │  schedule_threads │              │ write / read swap │
//!      └───────────────────┘              └───────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `lifecycle` - `PluginLoader`, the lifecycle state machine
//! - `memory_block` - the plugin's memory region and swap configuration
//! - `handshake` - loader/plugin event words
//! - `predicate` - plugin thread membership
//! - `service` - RPC dispatcher
//! - `tasks` - deferred teardown queue
//! - `journal` - lifecycle audit trail
//! - `config`, `params` - configuration and RPC-set value types
//! - `testing` - in-memory collaborators

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod handshake;
pub mod journal;
pub mod lifecycle;
pub mod memory_block;
pub mod params;
pub mod predicate;
pub mod service;
pub mod tasks;
pub mod testing;

pub use config::LoaderConfig;
pub use error::{LoaderError, MemoryBlockError};
pub use handshake::{Ack, Handshake};
pub use journal::{HandshakeKind, LifecycleEvent, LifecycleJournal, LifecycleRecord, PluginState};
pub use lifecycle::{PendingError, PluginLoader};
pub use memory_block::{BlockState, PluginMemoryBlock};
pub use params::{ExeLoadParams, PluginLoadParameters, SwapSettings};
pub use predicate::{PluginThreadPredicate, PLUGIN_THREAD_TAG, PLUGIN_THREAD_TLS_SLOT};
pub use service::{IpcDescriptor, IpcRequest, IpcResponse, LoaderService};
pub use testing::MemorySwapStore;
