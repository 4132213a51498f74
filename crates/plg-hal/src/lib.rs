//! Platform Abstraction for the Plugin Loader
//!
//! This crate defines the traits the loader service is written against, so
//! the lifecycle logic can run on the real console, on a model kernel, or on
//! a fake in tests.
//!
//! # Traits
//!
//! - **`Hal`**: kernel control (thread lock/unlock, handles), the shared
//!   status word, the address arbiter, plugin injection and mapping, UI glue,
//!   time and debug output
//! - **`SwapStore`**: persists and restores the plugin's memory region
//!
//! `TestHal` is a single-threaded stub for unit tests that don't need a
//! kernel behind the HAL.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use plg_ipc::result::{self, ResultCode};
use plg_kernel_core::{Handle, KernelError, ScheduleMode, ScheduleReport, ThreadPredicate};

/// Platform abstraction consumed by the loader.
///
/// Methods with default bodies are optional glue; a platform without a
/// screen, for instance, keeps the no-op UI methods.
pub trait Hal: Send + Sync + 'static {
    // === Kernel control ===

    /// Lock or unlock the threads of `target` accepted by `predicate`.
    fn schedule_threads(
        &self,
        target: Handle,
        mode: ScheduleMode,
        predicate: &dyn ThreadPredicate,
    ) -> Result<ScheduleReport, HalError>;

    /// Close a handle owned by the loader.
    fn close_handle(&self, handle: Handle) -> Result<(), HalError>;

    /// 64-bit program id of the process behind `target`.
    fn process_title_id(&self, target: Handle) -> Result<u64, HalError>;

    /// Create the address arbiter used for the plugin handshake.
    fn create_address_arbiter(&self) -> Result<Handle, HalError>;

    /// Create the lifecycle notification event and register it with the
    /// kernel, which signals it after writing an event to the status word.
    fn create_lifecycle_event(&self) -> Result<Handle, HalError>;

    /// Boot-time value of the "plugin loader enabled" system setting.
    fn loader_enabled_at_boot(&self) -> bool {
        false
    }

    // === Shared status word ===

    /// Read the kernel-maintained status word.
    fn read_status_word(&self) -> u32;

    /// Overwrite the status word.
    fn write_status_word(&self, value: u32);

    // === Address arbiter ===

    /// Wake up to `count` waiters blocked on `word` (-1 for all).
    fn arbiter_signal(&self, arbiter: Handle, word: &AtomicI32, count: i32) -> Result<(), HalError>;

    /// Block while `word < value`, at most `timeout_ns`.
    ///
    /// Returns `Err(HalError::Timeout)` if the deadline passed first.
    fn arbiter_wait_if_less_than(
        &self,
        arbiter: Handle,
        word: &AtomicI32,
        value: i32,
        timeout_ns: u64,
    ) -> Result<(), HalError>;

    // === Plugin memory ===

    /// Read the plugin at `path`, set up its threads in `target` and return
    /// the initial contents of its memory region.
    fn inject_plugin(&self, target: Handle, path: &str, config: &[u32]) -> Result<Vec<u8>, HalError>;

    /// Map `len` bytes of plugin memory into `target`.
    fn map_plugin_memory(&self, target: Handle, len: usize) -> Result<(), HalError>;

    /// Unmap the plugin memory from `target`.
    fn unmap_plugin_memory(&self, target: Handle, len: usize) -> Result<(), HalError>;

    fn invalidate_instruction_cache(&self) {}

    // === UI glue ===

    /// Blink the "plugin loaded" indicator.
    fn flash_load_indicator(&self) {}

    /// Show a menu; the user may toggle entry states in place.
    fn display_menu(&self, _menu: &mut PluginMenu) -> Result<(), HalError> {
        Err(HalError::NotSupported)
    }

    fn display_message(&self, _title: &str, _body: &str) {}

    fn display_error(&self, _title: &str, _code: u32, _body: &str) {}

    /// Persist the loader's settings (enabled flag).
    fn request_save_settings(&self) {}

    /// Publish a notification id to platform subscribers.
    fn publish_notification(&self, _id: u32) {}

    // === Time & debug ===

    /// Monotonic time in nanoseconds.
    fn now_nanos(&self) -> u64;

    /// Write a diagnostic line.
    fn debug_write(&self, msg: &str);
}

/// Backing storage for swapped-out plugin memory.
pub trait SwapStore: Send + Sync {
    /// Persist `data` under `filename`, through the plugin's save routine at
    /// `save_addr`.
    fn write_swap(&self, filename: &str, save_addr: u32, data: &[u8]) -> Result<(), HalError>;

    /// Restore exactly `len` bytes from `filename`, through the load routine
    /// at `load_addr`.
    fn read_swap(&self, filename: &str, load_addr: u32, len: usize) -> Result<Vec<u8>, HalError>;
}

/// HAL errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// A bounded wait expired
    Timeout,
    /// Plugin file or object not found
    NotFound,
    /// Operation not supported on this platform
    NotSupported,
    /// Invalid argument
    InvalidArgument,
    /// Storage operation failed
    StorageFailed,
    /// Mapping or unmapping memory failed
    MappingFailed,
    /// Kernel operation failed
    Kernel(KernelError),
}

impl HalError {
    pub fn code(self) -> ResultCode {
        match self {
            HalError::Timeout => result::TIMEOUT,
            HalError::NotFound => result::LOAD_FAILED,
            HalError::NotSupported => result::NOT_SUPPORTED,
            HalError::InvalidArgument => result::INVALID_ARGUMENT,
            HalError::StorageFailed => result::STORAGE_FAILED,
            HalError::MappingFailed => result::MAPPING_FAILED,
            HalError::Kernel(e) => e.code(),
        }
    }
}

impl From<KernelError> for HalError {
    fn from(e: KernelError) -> Self {
        HalError::Kernel(e)
    }
}

/// One menu entry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MenuEntry {
    pub label: String,
    pub hint: String,
    /// Entry state byte (toggled by the user)
    pub state: u8,
}

/// A menu shown on behalf of the plugin.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PluginMenu {
    pub title: String,
    pub entries: Vec<MenuEntry>,
}

// ============================================================================
// Test stub
// ============================================================================

/// A minimal HAL for unit tests.
///
/// No kernel behind it: schedule operations report nothing, waits never
/// block (they succeed if the word already satisfies the condition and time
/// out otherwise), and debug lines are captured.
#[derive(Default)]
pub struct TestHal {
    status: AtomicU32,
    time: AtomicU64,
    next_handle: AtomicU32,
    mapped: AtomicU32,
    log: spin::Mutex<Vec<String>>,
}

impl TestHal {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU32::new(0x100),
            ..Default::default()
        }
    }

    /// Captured debug lines.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Bytes currently mapped into the target.
    pub fn mapped_len(&self) -> usize {
        self.mapped.load(Ordering::Acquire) as usize
    }

    fn fresh_handle(&self) -> Handle {
        Handle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

impl Hal for TestHal {
    fn schedule_threads(
        &self,
        _target: Handle,
        _mode: ScheduleMode,
        _predicate: &dyn ThreadPredicate,
    ) -> Result<ScheduleReport, HalError> {
        Ok(ScheduleReport::default())
    }

    fn close_handle(&self, _handle: Handle) -> Result<(), HalError> {
        Ok(())
    }

    fn process_title_id(&self, target: Handle) -> Result<u64, HalError> {
        Ok(0x0004_0000_0000_0000 | u64::from(target.0))
    }

    fn create_address_arbiter(&self) -> Result<Handle, HalError> {
        Ok(self.fresh_handle())
    }

    fn create_lifecycle_event(&self) -> Result<Handle, HalError> {
        Ok(self.fresh_handle())
    }

    fn read_status_word(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    fn write_status_word(&self, value: u32) {
        self.status.store(value, Ordering::Release);
    }

    fn arbiter_signal(&self, _arbiter: Handle, _word: &AtomicI32, _count: i32) -> Result<(), HalError> {
        Ok(())
    }

    fn arbiter_wait_if_less_than(
        &self,
        _arbiter: Handle,
        word: &AtomicI32,
        value: i32,
        timeout_ns: u64,
    ) -> Result<(), HalError> {
        if word.load(Ordering::Acquire) < value {
            self.time.fetch_add(timeout_ns, Ordering::Relaxed);
            return Err(HalError::Timeout);
        }
        Ok(())
    }

    fn inject_plugin(&self, _target: Handle, _path: &str, _config: &[u32]) -> Result<Vec<u8>, HalError> {
        Ok(alloc::vec![0u8; 0x1000])
    }

    fn map_plugin_memory(&self, _target: Handle, len: usize) -> Result<(), HalError> {
        self.mapped.store(len as u32, Ordering::Release);
        Ok(())
    }

    fn unmap_plugin_memory(&self, _target: Handle, _len: usize) -> Result<(), HalError> {
        self.mapped.store(0, Ordering::Release);
        Ok(())
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::Relaxed)
    }

    fn debug_write(&self, msg: &str) {
        self.log.lock().push(String::from(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_errors_keep_kernel_codes() {
        let e: HalError = KernelError::InvalidHandle.into();
        assert_eq!(e.code(), result::KERNEL_INVALID_HANDLE);
        assert_eq!(HalError::Timeout.code(), result::TIMEOUT);
    }

    #[test]
    fn test_stub_wait_times_out_on_pending_reply() {
        let hal = TestHal::new();
        let word = AtomicI32::new(plg_ipc::handshake::PLG_WAIT);
        let arbiter = hal.create_address_arbiter().unwrap();
        assert_eq!(
            hal.arbiter_wait_if_less_than(arbiter, &word, plg_ipc::handshake::PLG_OK, 5),
            Err(HalError::Timeout)
        );
        assert_eq!(hal.now_nanos(), 5);
        word.store(plg_ipc::handshake::PLG_OK, Ordering::Release);
        assert!(hal.arbiter_wait_if_less_than(arbiter, &word, plg_ipc::handshake::PLG_OK, 5).is_ok());
    }
}
