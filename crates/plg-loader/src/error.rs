//! Loader error types.

use plg_hal::HalError;
use plg_ipc::result::{self, ResultCode};

/// Errors from `PluginMemoryBlock` operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryBlockError {
    /// Swap requested while no swap configuration is set
    SwapNotConfigured,
    /// Region larger than the configured bound
    SwapRegionTooLarge {
        /// Region size in bytes
        size: usize,
        /// Configured bound in bytes
        bound: usize,
    },
    /// Operation not valid for the block's current state
    InvalidState,
    /// Swap store or mapping failure
    Store(HalError),
}

impl From<HalError> for MemoryBlockError {
    fn from(e: HalError) -> Self {
        MemoryBlockError::Store(e)
    }
}

impl core::fmt::Display for MemoryBlockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryBlockError::SwapNotConfigured => write!(f, "swap not configured"),
            MemoryBlockError::SwapRegionTooLarge { size, bound } => {
                write!(f, "region of {size:#x} bytes exceeds swap bound {bound:#x}")
            }
            MemoryBlockError::InvalidState => write!(f, "invalid memory block state"),
            MemoryBlockError::Store(e) => write!(f, "platform error: {e:?}"),
        }
    }
}

/// Errors surfaced by the loader service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderError {
    /// Bad capability reference
    InvalidHandle,
    /// Request header or shape does not match the command
    MalformedRequest,
    /// Unknown command id
    NotImplemented,
    SwapNotConfigured,
    SwapRegionTooLarge,
    /// Target rejected plugin injection
    LoadFailed,
    /// Null address parameter
    InvalidAddress,
    /// Parameter exceeds its capacity
    TooLarge,
    /// Operation not valid in the current lifecycle state
    InvalidState,
    /// Lifecycle notification not valid in the current state
    UnexpectedNotification,
    Hal(HalError),
}

impl LoaderError {
    /// 32-bit result code written to the RPC response.
    pub fn result_code(self) -> ResultCode {
        match self {
            LoaderError::InvalidHandle => result::KERNEL_INVALID_HANDLE,
            LoaderError::MalformedRequest => result::MALFORMED_REQUEST,
            LoaderError::NotImplemented => result::UNKNOWN_COMMAND,
            LoaderError::SwapNotConfigured => result::SWAP_NOT_CONFIGURED,
            LoaderError::SwapRegionTooLarge => result::SWAP_REGION_TOO_LARGE,
            LoaderError::LoadFailed => result::LOAD_FAILED,
            LoaderError::InvalidAddress => result::INVALID_ADDRESS,
            LoaderError::TooLarge => result::TOO_LARGE,
            LoaderError::InvalidState | LoaderError::UnexpectedNotification => result::INVALID_STATE,
            LoaderError::Hal(e) => e.code(),
        }
    }
}

impl From<HalError> for LoaderError {
    fn from(e: HalError) -> Self {
        match e {
            HalError::Kernel(plg_kernel_core::KernelError::InvalidHandle) => LoaderError::InvalidHandle,
            other => LoaderError::Hal(other),
        }
    }
}

impl From<MemoryBlockError> for LoaderError {
    fn from(e: MemoryBlockError) -> Self {
        match e {
            MemoryBlockError::SwapNotConfigured => LoaderError::SwapNotConfigured,
            MemoryBlockError::SwapRegionTooLarge { .. } => LoaderError::SwapRegionTooLarge,
            MemoryBlockError::InvalidState => LoaderError::InvalidState,
            MemoryBlockError::Store(h) => LoaderError::from(h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_block_errors_map_to_loader_codes() {
        let e: LoaderError = MemoryBlockError::SwapRegionTooLarge { size: 2, bound: 1 }.into();
        assert_eq!(e, LoaderError::SwapRegionTooLarge);
        assert_eq!(e.result_code(), result::SWAP_REGION_TOO_LARGE);
    }

    #[test]
    fn test_invalid_kernel_handle_surfaces_as_invalid_handle() {
        let e: LoaderError = HalError::Kernel(plg_kernel_core::KernelError::InvalidHandle).into();
        assert_eq!(e, LoaderError::InvalidHandle);
        assert_eq!(e.result_code(), 0xD8E0_07F7);
    }

    #[test]
    fn test_unknown_command_code() {
        assert_eq!(LoaderError::NotImplemented.result_code(), 0xD900_182F);
        assert_eq!(LoaderError::MalformedRequest.result_code(), 0xD900_1830);
    }
}
