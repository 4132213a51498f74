//! Kernel errors

use plg_ipc::result::{self, ResultCode};

/// Errors returned by kernel operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Handle does not resolve to a live object
    InvalidHandle,
    /// Unknown operation code
    NotImplemented,
    /// Address not mapped in the target
    InvalidAddress,
    /// Handle resolves to an object of another class
    WrongObjectType,
    /// Handle table or id space exhausted
    OutOfResource,
    /// Operation argument outside its accepted range
    InvalidEnumValue,
}

impl KernelError {
    /// 32-bit result code reported to callers.
    pub fn code(self) -> ResultCode {
        match self {
            KernelError::InvalidHandle | KernelError::WrongObjectType => {
                result::KERNEL_INVALID_HANDLE
            }
            KernelError::NotImplemented => result::KERNEL_NOT_IMPLEMENTED,
            KernelError::InvalidAddress => result::KERNEL_INVALID_ADDRESS,
            KernelError::OutOfResource => result::KERNEL_OUT_OF_RESOURCE,
            KernelError::InvalidEnumValue => result::KERNEL_INVALID_ENUM_VALUE,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::InvalidHandle => write!(f, "invalid handle"),
            KernelError::NotImplemented => write!(f, "operation not implemented"),
            KernelError::InvalidAddress => write!(f, "address not mapped"),
            KernelError::WrongObjectType => write!(f, "handle has the wrong object class"),
            KernelError::OutOfResource => write!(f, "kernel resource exhausted"),
            KernelError::InvalidEnumValue => write!(f, "argument out of range"),
        }
    }
}
