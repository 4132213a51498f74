//! Protocol Constants for the Plugin Loader
//!
//! This crate defines:
//! - **Command ids** and the IPC header codec for the loader's request channel
//! - **Result codes** returned to RPC callers and by the kernel extension
//! - **Shared status word** layout (kernel-maintained, loader-written)
//! - **Handshake values** exchanged between the loader and the plugin
//!
//! It is the **single source of truth** for all wire-level values, so the
//! kernel model, the loader and test doubles never drift apart.
//!
//! # Command Catalogue
//!
//! | id | name                 | normal words | translate words |
//! |----|----------------------|--------------|-----------------|
//! | 1  | Load plugin          | 0            | 2 (handle)      |
//! | 2  | Query enabled        | 0            | 0               |
//! | 3  | Set enabled          | 1            | 0               |
//! | 4  | Set load params      | 2            | 4 (2 buffers)   |
//! | 5  | Display menu         | 1            | 8 (4 buffers)   |
//! | 6  | Display message      | 0            | 4 (2 buffers)   |
//! | 7  | Display error        | 1            | 4 (2 buffers)   |
//! | 8  | Get version          | 0            | 0               |
//! | 9  | Get sync primitive   | 0            | 0               |
//! | 10 | Get plugin path      | 0            | 2 (1 buffer)    |
//! | 11 | Set UI-block flag    | 1            | 0               |
//! | 12 | Set swap addresses   | 2            | 4 (2 buffers)   |
//! | 13 | Set code-load entry  | 1            | 2 (1 buffer)    |

#![no_std]
#![deny(unsafe_code)]

// =============================================================================
// IPC Header Codec
// =============================================================================

/// Build a request/response header word.
///
/// Layout: `command_id << 16 | normal_words << 6 | translate_words`.
pub const fn make_header(command_id: u16, normal_words: u8, translate_words: u8) -> u32 {
    ((command_id as u32) << 16) | (((normal_words as u32) & 0x3F) << 6) | ((translate_words as u32) & 0x3F)
}

/// Decoded IPC header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcHeader {
    /// Command id (upper 16 bits)
    pub command_id: u16,
    /// Number of plain parameter words
    pub normal_words: u8,
    /// Number of translate parameter words (two per descriptor)
    pub translate_words: u8,
}

impl IpcHeader {
    /// Decode a raw header word.
    pub const fn decode(raw: u32) -> Self {
        Self {
            command_id: (raw >> 16) as u16,
            normal_words: ((raw >> 6) & 0x3F) as u8,
            translate_words: (raw & 0x3F) as u8,
        }
    }

    /// Re-encode into a raw header word.
    pub const fn encode(&self) -> u32 {
        make_header(self.command_id, self.normal_words, self.translate_words)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Loader command ids and their exact request/response headers.
pub mod command {
    use super::make_header;

    /// Load a plugin into the target process
    pub const CMD_LOAD_PLUGIN: u16 = 1;
    /// Query whether the loader is enabled
    pub const CMD_IS_ENABLED: u16 = 2;
    /// Enable or disable the loader
    pub const CMD_SET_ENABLED: u16 = 3;
    /// Define the parameters used by the next load
    pub const CMD_SET_LOAD_PARAMS: u16 = 4;
    /// Display a plugin menu
    pub const CMD_DISPLAY_MENU: u16 = 5;
    /// Display a message box
    pub const CMD_DISPLAY_MESSAGE: u16 = 6;
    /// Display an error box
    pub const CMD_DISPLAY_ERROR: u16 = 7;
    /// Get the loader version
    pub const CMD_GET_VERSION: u16 = 8;
    /// Hand the address arbiter to the plugin
    pub const CMD_GET_ARBITER: u16 = 9;
    /// Get the path of the loaded plugin
    pub const CMD_GET_PLUGIN_PATH: u16 = 10;
    /// Block or unblock the overlay menu
    pub const CMD_SET_UI_BLOCK: u16 = 11;
    /// Configure the swap save/load addresses
    pub const CMD_SET_SWAP_PARAMS: u16 = 12;
    /// Configure the plugin's code-load entry point
    pub const CMD_SET_EXE_LOAD_PARAMS: u16 = 13;

    // === Expected request headers ===
    pub const REQ_LOAD_PLUGIN: u32 = make_header(CMD_LOAD_PLUGIN, 0, 2);
    pub const REQ_IS_ENABLED: u32 = make_header(CMD_IS_ENABLED, 0, 0);
    pub const REQ_SET_ENABLED: u32 = make_header(CMD_SET_ENABLED, 1, 0);
    pub const REQ_SET_LOAD_PARAMS: u32 = make_header(CMD_SET_LOAD_PARAMS, 2, 4);
    pub const REQ_DISPLAY_MENU: u32 = make_header(CMD_DISPLAY_MENU, 1, 8);
    pub const REQ_DISPLAY_MESSAGE: u32 = make_header(CMD_DISPLAY_MESSAGE, 0, 4);
    pub const REQ_DISPLAY_ERROR: u32 = make_header(CMD_DISPLAY_ERROR, 1, 4);
    pub const REQ_GET_VERSION: u32 = make_header(CMD_GET_VERSION, 0, 0);
    pub const REQ_GET_ARBITER: u32 = make_header(CMD_GET_ARBITER, 0, 0);
    pub const REQ_GET_PLUGIN_PATH: u32 = make_header(CMD_GET_PLUGIN_PATH, 0, 2);
    pub const REQ_SET_UI_BLOCK: u32 = make_header(CMD_SET_UI_BLOCK, 1, 0);
    pub const REQ_SET_SWAP_PARAMS: u32 = make_header(CMD_SET_SWAP_PARAMS, 2, 4);
    pub const REQ_SET_EXE_LOAD_PARAMS: u32 = make_header(CMD_SET_EXE_LOAD_PARAMS, 1, 2);

    /// Maximum plugin path length carried on the wire (bytes, excluding NUL)
    pub const MAX_PATH_LEN: usize = 255;
    /// Number of opaque configuration words in the load parameters
    pub const CONFIG_WORDS: usize = 32;
}

// =============================================================================
// Result Codes
// =============================================================================

/// 32-bit result word returned to callers. Zero is success; failures have the
/// top bit set.
pub type ResultCode = u32;

/// Compose a result code from its four fields.
pub const fn make_result(level: u32, summary: u32, module: u32, description: u32) -> ResultCode {
    ((level & 0x1F) << 27) | ((summary & 0x3F) << 21) | ((module & 0xFF) << 10) | (description & 0x3FF)
}

/// Check whether a result code denotes failure.
pub const fn is_failure(code: ResultCode) -> bool {
    (code as i32) < 0
}

/// Result codes.
pub mod result {
    use super::make_result;
    pub use super::ResultCode;

    // === Levels ===
    pub const LEVEL_STATUS: u32 = 25;
    pub const LEVEL_PERMANENT: u32 = 27;
    pub const LEVEL_USAGE: u32 = 28;
    pub const LEVEL_FATAL: u32 = 31;

    // === Summaries ===
    pub const SUMMARY_OUT_OF_RESOURCE: u32 = 3;
    pub const SUMMARY_NOT_FOUND: u32 = 4;
    pub const SUMMARY_INVALID_STATE: u32 = 5;
    pub const SUMMARY_NOT_SUPPORTED: u32 = 6;
    pub const SUMMARY_INVALID_ARG: u32 = 7;
    pub const SUMMARY_WRONG_ARG: u32 = 8;
    pub const SUMMARY_CANCELED: u32 = 9;

    // === Modules ===
    pub const MODULE_KERNEL: u32 = 1;
    pub const MODULE_OS: u32 = 6;
    pub const MODULE_LOADER: u32 = 29;

    // === Descriptions ===
    pub const DESC_TOO_LARGE: u32 = 1001;
    pub const DESC_INVALID_COMBINATION: u32 = 1006;
    pub const DESC_NO_DATA: u32 = 1007;
    pub const DESC_BUSY: u32 = 1008;
    pub const DESC_INVALID_ENUM_VALUE: u32 = 1010;
    pub const DESC_OUT_OF_MEMORY: u32 = 1011;
    pub const DESC_NOT_IMPLEMENTED: u32 = 1012;
    pub const DESC_INVALID_ADDRESS: u32 = 1013;
    pub const DESC_INVALID_HANDLE: u32 = 1015;
    pub const DESC_NOT_INITIALIZED: u32 = 1016;
    pub const DESC_NOT_FOUND: u32 = 1018;
    pub const DESC_TIMEOUT: u32 = 1022;

    /// Success
    pub const SUCCESS: ResultCode = 0;

    // === Kernel extension ===
    /// Handle does not reference a live process
    pub const KERNEL_INVALID_HANDLE: ResultCode = 0xD8E0_07F7;
    /// Unknown process operation code
    pub const KERNEL_NOT_IMPLEMENTED: ResultCode = 0xF8C0_07F4;
    /// Virtual address is not mapped in the target
    pub const KERNEL_INVALID_ADDRESS: ResultCode = 0xE0E0_1BF5;
    /// Operation argument outside its accepted range
    pub const KERNEL_INVALID_ENUM_VALUE: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_INVALID_ARG, MODULE_KERNEL, DESC_INVALID_ENUM_VALUE);
    /// Handle table or id space exhausted
    pub const KERNEL_OUT_OF_RESOURCE: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_OUT_OF_RESOURCE, MODULE_KERNEL, DESC_TOO_LARGE);

    // === Loader service ===
    /// Request header or shape does not match the command
    pub const MALFORMED_REQUEST: ResultCode = 0xD900_1830;
    /// Unknown command id
    pub const UNKNOWN_COMMAND: ResultCode = 0xD900_182F;
    /// A required address parameter is null
    pub const INVALID_ADDRESS: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_INVALID_ARG, MODULE_LOADER, DESC_INVALID_ADDRESS);
    /// A parameter exceeds its capacity
    pub const TOO_LARGE: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_INVALID_ARG, MODULE_LOADER, DESC_TOO_LARGE);
    /// Swap requested but no swap configuration is set
    pub const SWAP_NOT_CONFIGURED: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_INVALID_STATE, MODULE_LOADER, DESC_NOT_INITIALIZED);
    /// Plugin region is larger than the configured swap bound
    pub const SWAP_REGION_TOO_LARGE: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_OUT_OF_RESOURCE, MODULE_LOADER, DESC_TOO_LARGE);
    /// The target rejected plugin injection
    pub const LOAD_FAILED: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_NOT_FOUND, MODULE_LOADER, DESC_NOT_FOUND);
    /// Operation not valid in the current lifecycle state
    pub const INVALID_STATE: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_INVALID_STATE, MODULE_LOADER, DESC_BUSY);
    /// Wait exceeded its timeout
    pub const TIMEOUT: ResultCode =
        make_result(LEVEL_STATUS, SUMMARY_CANCELED, MODULE_LOADER, DESC_TIMEOUT);
    /// Platform operation not supported
    pub const NOT_SUPPORTED: ResultCode =
        make_result(LEVEL_USAGE, SUMMARY_NOT_SUPPORTED, MODULE_LOADER, DESC_NOT_IMPLEMENTED);
    /// Platform rejected an argument
    pub const INVALID_ARGUMENT: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_INVALID_ARG, MODULE_LOADER, DESC_INVALID_COMBINATION);
    /// Backing storage read or write failed
    pub const STORAGE_FAILED: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_NOT_FOUND, MODULE_LOADER, DESC_NO_DATA);
    /// Plugin memory could not be mapped or unmapped
    pub const MAPPING_FAILED: ResultCode =
        make_result(LEVEL_PERMANENT, SUMMARY_OUT_OF_RESOURCE, MODULE_LOADER, DESC_OUT_OF_MEMORY);
}

// =============================================================================
// Shared Status Word
// =============================================================================

/// Layout of the kernel-maintained status word.
///
/// Low 16 bits: lifecycle state, written by the loader.
/// High 16 bits: pending notification, written by the kernel and cleared by
/// the loader once consumed.
pub mod status {
    /// No plugin loaded
    pub const PLG_CFG_NONE: u32 = 0;
    /// Plugin loaded and running
    pub const PLG_CFG_RUNNING: u32 = 1;
    /// Plugin loaded, memory swapped out
    pub const PLG_CFG_SWAPPED: u32 = 2;

    /// Host process is about to exit
    pub const PLG_CFG_EXIT_EVENT: u32 = 1 << 16;
    /// Memory pressure: swap the plugin out (or back in)
    pub const PLG_CFG_SWAP_EVENT: u32 = 2 << 16;

    /// Mask for the state half
    pub const STATE_MASK: u32 = 0xFFFF;
    /// Mask for the event half
    pub const EVENT_MASK: u32 = !STATE_MASK;

    /// Extract the state half.
    pub const fn state_of(word: u32) -> u32 {
        word & STATE_MASK
    }

    /// Extract the event half.
    pub const fn event_of(word: u32) -> u32 {
        word & EVENT_MASK
    }
}

// =============================================================================
// Handshake Values
// =============================================================================

/// Values of the two handshake words shared with the plugin.
///
/// `event` is written by the loader, `reply` by the plugin. The loader waits
/// on `reply` with "wait if less than `PLG_OK`", so `PLG_WAIT` must stay
/// negative.
pub mod handshake {
    /// Reply not yet given
    pub const PLG_WAIT: i32 = -1;
    /// Continue / acknowledged
    pub const PLG_OK: i32 = 0;
    /// Plugin memory is about to be swapped out
    pub const PLG_ABOUT_TO_SWAP: i32 = 3;
    /// Host process is about to exit
    pub const PLG_ABOUT_TO_EXIT: i32 = 4;

    /// Reply timeout used by the loader (10 seconds)
    pub const REPLY_TIMEOUT_NS: u64 = 10_000_000_000;
}

// =============================================================================
// Kernel Extension
// =============================================================================

/// Kernel-side constants shared with callers of the process-control operation.
pub mod kernel {
    /// Pseudo-handle that always resolves to the calling process
    pub const CURRENT_PROCESS_HANDLE: u32 = 0xFFFF_8001;

    /// List handles in the target's table
    pub const PROCESSOP_GET_ALL_HANDLES: u32 = 0;
    /// Force RWX pages for the target
    pub const PROCESSOP_SET_MMU_TO_RWX: u32 = 1;
    /// Get the memory-layout-change event of the current process
    pub const PROCESSOP_GET_ON_MEMORY_CHANGE_EVENT: u32 = 2;
    /// Signal the loader when the target exits
    pub const PROCESSOP_SIGNAL_ON_EXIT: u32 = 3;
    /// Translate a virtual address of the target
    pub const PROCESSOP_GET_PA_FROM_VA: u32 = 4;
    /// Lock or unlock the target's threads
    pub const PROCESSOP_SCHEDULE_THREADS: u32 = 5;

    /// `ScheduleThreads` argument: unlock
    pub const SCHEDULE_UNLOCK: u32 = 0;
    /// `ScheduleThreads` argument: lock
    pub const SCHEDULE_LOCK: u32 = 1;
}

// =============================================================================
// Platform Notifications
// =============================================================================

/// Notification ids published by the loader.
pub mod notification {
    /// Published after a lifecycle notification has been handled
    pub const LIFECYCLE_HANDLED: u32 = 0x1002;
}

// =============================================================================
// Version
// =============================================================================

/// Pack a `major.minor.revision` version word.
pub const fn make_version(major: u8, minor: u8, revision: u8) -> u32 {
    ((major as u32) << 24) | ((minor as u32) << 16) | ((revision as u32) << 8)
}

/// Loader version reported by `CMD_GET_VERSION`
pub const LOADER_VERSION: u32 = make_version(1, 0, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_matches_catalogue() {
        let h = IpcHeader::decode(command::REQ_SET_LOAD_PARAMS);
        assert_eq!(h.command_id, 4);
        assert_eq!(h.normal_words, 2);
        assert_eq!(h.translate_words, 4);
        assert_eq!(h.encode(), command::REQ_SET_LOAD_PARAMS);
        assert_eq!(command::REQ_LOAD_PLUGIN, 0x0001_0002);
    }

    #[test]
    fn test_known_result_codes_decompose() {
        use result::*;
        assert_eq!(KERNEL_INVALID_HANDLE, make_result(LEVEL_PERMANENT, SUMMARY_INVALID_ARG, MODULE_KERNEL, DESC_INVALID_HANDLE));
        assert_eq!(KERNEL_NOT_IMPLEMENTED, make_result(LEVEL_FATAL, SUMMARY_NOT_SUPPORTED, MODULE_KERNEL, DESC_NOT_IMPLEMENTED));
        assert_eq!(KERNEL_INVALID_ADDRESS, make_result(LEVEL_USAGE, SUMMARY_INVALID_ARG, MODULE_OS, DESC_INVALID_ADDRESS));
        assert_eq!(MALFORMED_REQUEST, make_result(LEVEL_PERMANENT, SUMMARY_WRONG_ARG, MODULE_OS, 48));
        assert_eq!(UNKNOWN_COMMAND, make_result(LEVEL_PERMANENT, SUMMARY_WRONG_ARG, MODULE_OS, 47));
    }

    #[test]
    fn test_failure_bit() {
        assert!(!is_failure(result::SUCCESS));
        assert!(is_failure(result::INVALID_ADDRESS));
        assert!(is_failure(result::TIMEOUT));
        assert_ne!(result::INVALID_ADDRESS, result::TOO_LARGE);
    }

    #[test]
    fn test_status_word_halves_do_not_overlap() {
        let word = status::PLG_CFG_SWAP_EVENT | status::PLG_CFG_RUNNING;
        assert_eq!(status::state_of(word), status::PLG_CFG_RUNNING);
        assert_eq!(status::event_of(word), status::PLG_CFG_SWAP_EVENT);
        assert_ne!(status::PLG_CFG_EXIT_EVENT, status::PLG_CFG_SWAP_EVENT);
    }

    #[test]
    fn test_handshake_wait_is_below_ok() {
        const { assert!(handshake::PLG_WAIT < handshake::PLG_OK) };
        assert_eq!(LOADER_VERSION, 0x0100_0000);
    }
}
