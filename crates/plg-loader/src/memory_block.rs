//! Plugin memory block
//!
//! Owns the plugin's memory region and its swap configuration. The region is
//! in exactly one place at a time:
//!
//! ```text
//!   Free ──allocate──▶ Resident{unmounted} ◀──mount/unmount──▶ Resident{mounted}
//!                          │        ▲
//!        to_swap_file+free │        │ from_swap_file
//!                          ▼        │
//!                        SwappedOut{len}
//! ```
//!
//! Mounting and swapping are mutually exclusive: a mounted region can be
//! neither serialized nor freed.

use alloc::vec::Vec;

use plg_hal::{Hal, SwapStore};
use plg_kernel_core::Handle;

use crate::error::MemoryBlockError;
use crate::params::SwapSettings;

/// Where the region currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// No region
    Free,
    /// Region held in memory
    Resident {
        mounted: bool,
    },
    /// Region only exists in the swap store
    SwappedOut {
        len: usize,
    },
}

pub struct PluginMemoryBlock {
    state: BlockState,
    data: Vec<u8>,
    /// Settings the current contents were written with, if any. A swapped-out
    /// image is restored through these, whatever the configuration is now.
    persisted: Option<SwapSettings>,
    swap: SwapSettings,
    default_swap_filename: alloc::string::String,
}

impl PluginMemoryBlock {
    pub fn new(default_swap_filename: &str) -> Self {
        Self {
            state: BlockState::Free,
            data: Vec::new(),
            persisted: None,
            swap: SwapSettings::unset(default_swap_filename),
            default_swap_filename: alloc::string::String::from(default_swap_filename),
        }
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn is_mounted(&self) -> bool {
        matches!(self.state, BlockState::Resident { mounted: true })
    }

    pub fn is_swapped_out(&self) -> bool {
        matches!(self.state, BlockState::SwappedOut { .. })
    }

    /// Region size in bytes (also while swapped out).
    pub fn len(&self) -> usize {
        match self.state {
            BlockState::SwappedOut { len } => len,
            _ => self.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Region contents; empty unless resident.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable contents of a resident region.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self.state {
            BlockState::Resident { .. } => {
                self.persisted = None;
                Some(&mut self.data)
            }
            _ => None,
        }
    }

    pub fn swap_settings(&self) -> &SwapSettings {
        &self.swap
    }

    /// Take ownership of a freshly loaded image.
    pub fn allocate(&mut self, data: Vec<u8>) -> Result<(), MemoryBlockError> {
        if self.state != BlockState::Free {
            return Err(MemoryBlockError::InvalidState);
        }
        self.data = data;
        self.persisted = None;
        self.state = BlockState::Resident { mounted: false };
        Ok(())
    }

    pub fn mount_in_process<H: Hal + ?Sized>(&mut self, hal: &H, target: Handle) -> Result<(), MemoryBlockError> {
        if self.state != (BlockState::Resident { mounted: false }) {
            return Err(MemoryBlockError::InvalidState);
        }
        hal.map_plugin_memory(target, self.data.len())?;
        self.state = BlockState::Resident { mounted: true };
        Ok(())
    }

    pub fn unmount_from_process<H: Hal + ?Sized>(&mut self, hal: &H, target: Handle) -> Result<(), MemoryBlockError> {
        if !self.is_mounted() {
            return Err(MemoryBlockError::InvalidState);
        }
        hal.unmap_plugin_memory(target, self.data.len())?;
        self.state = BlockState::Resident { mounted: false };
        Ok(())
    }

    /// Write the region to the swap store. The region must be unmounted.
    ///
    /// A failure leaves both the region and the configuration untouched.
    pub fn to_swap_file<S: SwapStore + ?Sized>(&mut self, store: &S) -> Result<(), MemoryBlockError> {
        if self.state != (BlockState::Resident { mounted: false }) {
            return Err(MemoryBlockError::InvalidState);
        }
        if !self.swap.configured {
            return Err(MemoryBlockError::SwapNotConfigured);
        }
        if self.data.len() > self.swap.bound {
            return Err(MemoryBlockError::SwapRegionTooLarge {
                size: self.data.len(),
                bound: self.swap.bound,
            });
        }
        store.write_swap(&self.swap.filename, self.swap.save_addr, &self.data)?;
        self.persisted = Some(self.swap.clone());
        Ok(())
    }

    /// Restore a swapped-out region through the settings it was written
    /// with. The block ends up resident and unmounted; on failure it stays
    /// swapped out.
    pub fn from_swap_file<S: SwapStore + ?Sized>(&mut self, store: &S) -> Result<(), MemoryBlockError> {
        let BlockState::SwappedOut { len } = self.state else {
            return Err(MemoryBlockError::InvalidState);
        };
        let Some(settings) = self.persisted.as_ref() else {
            return Err(MemoryBlockError::SwapNotConfigured);
        };
        let data = store.read_swap(&settings.filename, settings.load_addr, len)?;
        if data.len() != len {
            return Err(MemoryBlockError::Store(plg_hal::HalError::StorageFailed));
        }
        self.data = data;
        self.state = BlockState::Resident { mounted: false };
        Ok(())
    }

    /// Release the in-memory region.
    ///
    /// A region already written to the swap store becomes `SwappedOut`; any
    /// other region is dropped. Fails while mounted.
    pub fn free(&mut self) -> Result<(), MemoryBlockError> {
        match self.state {
            BlockState::Resident { mounted: true } => Err(MemoryBlockError::InvalidState),
            BlockState::Resident { mounted: false } => {
                let len = self.data.len();
                self.data = Vec::new();
                self.state = if self.persisted.is_some() {
                    BlockState::SwappedOut { len }
                } else {
                    BlockState::Free
                };
                Ok(())
            }
            BlockState::Free | BlockState::SwappedOut { .. } => Ok(()),
        }
    }

    /// Forget the region wherever it lives. Fails while mounted.
    pub fn discard(&mut self) -> Result<(), MemoryBlockError> {
        if self.is_mounted() {
            return Err(MemoryBlockError::InvalidState);
        }
        self.data = Vec::new();
        self.persisted = None;
        self.state = BlockState::Free;
        Ok(())
    }

    /// Back to the unset configuration. A swapped-out image keeps the
    /// settings it was written with.
    pub fn reset_swap_settings(&mut self) {
        self.swap = SwapSettings::unset(&self.default_swap_filename);
    }

    /// Replace the swap configuration with a validated one.
    pub fn set_swap_settings(&mut self, settings: SwapSettings) {
        self.swap = settings;
    }
}
