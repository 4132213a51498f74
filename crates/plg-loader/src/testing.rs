//! In-memory collaborators for tests.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use plg_hal::{HalError, SwapStore};

/// A swap file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapImage {
    pub save_addr: u32,
    pub data: Vec<u8>,
}

/// Swap store backed by a map of filename to image.
///
/// `fail_writes` and `fail_reads` make every write or read fail with
/// `StorageFailed`, for exercising the swap failure paths.
#[derive(Default)]
pub struct MemorySwapStore {
    files: spin::Mutex<BTreeMap<String, SwapImage>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicUsize,
    reads: AtomicUsize,
}

impl MemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    pub fn file(&self, filename: &str) -> Option<SwapImage> {
        self.files.lock().get(filename).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

impl SwapStore for MemorySwapStore {
    fn write_swap(&self, filename: &str, save_addr: u32, data: &[u8]) -> Result<(), HalError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(HalError::StorageFailed);
        }
        self.files.lock().insert(
            String::from(filename),
            SwapImage {
                save_addr,
                data: data.to_vec(),
            },
        );
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn read_swap(&self, filename: &str, _load_addr: u32, len: usize) -> Result<Vec<u8>, HalError> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(HalError::StorageFailed);
        }
        let files = self.files.lock();
        let image = files.get(filename).ok_or(HalError::NotFound)?;
        if image.data.len() != len {
            return Err(HalError::StorageFailed);
        }
        self.reads.fetch_add(1, Ordering::AcqRel);
        Ok(image.data.clone())
    }
}
