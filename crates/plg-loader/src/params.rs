//! Value types configured over RPC: next-load parameters, swap settings and
//! the code-load entry.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use plg_ipc::command::{CONFIG_WORDS, MAX_PATH_LEN};

use crate::error::LoaderError;

/// Bit 0 of the load-parameter flags word: skip the load indicator.
pub const LOAD_FLAG_NO_FLASH: u32 = 1 << 0;

/// Largest region a swap configuration may bound.
pub const MAX_SWAP_BOUND: usize = 8 * 1024 * 1024;

/// Routine addresses are stored as kernel-visible (uncached) addresses.
pub const ROUTINE_ADDRESS_BIT: u32 = 0x8000_0000;

/// Parameters for the next plugin load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginLoadParameters {
    /// Suppress the load indicator flash
    pub no_flash: bool,
    /// Low 32 bits of the title these parameters apply to
    pub low_title_id: u32,
    pub path: String,
    /// Opaque configuration passed to the plugin
    pub config: Vec<u32>,
}

impl PluginLoadParameters {
    /// Build parameters from their wire form, rejecting oversize fields.
    pub fn new(flags: u32, low_title_id: u32, path: String, config: Vec<u32>) -> Result<Self, LoaderError> {
        if path.len() > MAX_PATH_LEN || config.len() > CONFIG_WORDS {
            return Err(LoaderError::TooLarge);
        }
        Ok(Self {
            no_flash: flags & LOAD_FLAG_NO_FLASH != 0,
            low_title_id,
            path,
            config,
        })
    }

    pub fn applies_to(&self, title_id: u64) -> bool {
        self.low_title_id == title_id as u32
    }
}

/// Swap save/load routine configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapSettings {
    pub save_addr: u32,
    pub load_addr: u32,
    /// Largest region the routines can handle, in bytes
    pub bound: usize,
    pub filename: String,
    /// Set once a legitimate address pair was written
    pub configured: bool,
}

impl SwapSettings {
    /// Unset configuration using `default_filename`.
    pub fn unset(default_filename: &str) -> Self {
        Self {
            filename: String::from(default_filename),
            ..Default::default()
        }
    }

    /// Validate a new configuration. An empty `filename` keeps
    /// `default_filename`.
    pub fn new(
        save_addr: u32,
        load_addr: u32,
        bound: usize,
        filename: &str,
        default_filename: &str,
    ) -> Result<Self, LoaderError> {
        if save_addr == 0 || load_addr == 0 {
            return Err(LoaderError::InvalidAddress);
        }
        if bound > MAX_SWAP_BOUND || filename.len() > MAX_PATH_LEN {
            return Err(LoaderError::TooLarge);
        }
        let filename = if filename.is_empty() { default_filename } else { filename };
        Ok(Self {
            save_addr: save_addr | ROUTINE_ADDRESS_BIT,
            load_addr: load_addr | ROUTINE_ADDRESS_BIT,
            bound,
            filename: String::from(filename),
            configured: true,
        })
    }

    pub fn is_unset(&self) -> bool {
        !self.configured && self.save_addr == 0 && self.load_addr == 0 && self.bound == 0
    }
}

/// Code-load entry point and its context words.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExeLoadParams {
    pub entry: u32,
    pub context: Vec<u32>,
    /// Set once a valid entry was configured
    pub is_set: bool,
}

impl ExeLoadParams {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Reset, then apply `entry`/`context`. Leaves the params reset on error.
    pub fn configure(&mut self, entry: u32, context: Vec<u32>) -> Result<(), LoaderError> {
        self.reset();
        if entry == 0 {
            return Err(LoaderError::InvalidAddress);
        }
        if context.len() > CONFIG_WORDS {
            return Err(LoaderError::TooLarge);
        }
        self.entry = entry | ROUTINE_ADDRESS_BIT;
        self.context = context;
        self.is_set = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_load_params_reject_long_path() {
        let path: String = core::iter::repeat('a').take(MAX_PATH_LEN + 1).collect();
        assert_eq!(
            PluginLoadParameters::new(0, 1, path, Vec::new()),
            Err(LoaderError::TooLarge)
        );
    }

    #[test]
    fn test_load_params_reject_oversize_config() {
        assert_eq!(
            PluginLoadParameters::new(0, 1, String::from("/p.plg"), vec![0; CONFIG_WORDS + 1]),
            Err(LoaderError::TooLarge)
        );
    }

    #[test]
    fn test_load_params_match_low_title_bits() {
        let p = PluginLoadParameters::new(LOAD_FLAG_NO_FLASH, 0x0005_5D00, String::from("/p.plg"), vec![7]).unwrap();
        assert!(p.no_flash);
        assert!(p.applies_to(0x0004_0000_0005_5D00));
        assert!(!p.applies_to(0x0004_0000_0005_5E00));
    }

    #[test]
    fn test_exe_params_null_entry_stays_reset() {
        let mut exe = ExeLoadParams::default();
        exe.configure(0x10_0000, vec![1, 2]).unwrap();
        assert!(exe.is_set);
        assert_eq!(exe.configure(0, vec![1]), Err(LoaderError::InvalidAddress));
        assert_eq!(exe, ExeLoadParams::default());
    }

    #[test]
    fn test_exe_params_oversize_context_resets() {
        let mut exe = ExeLoadParams::default();
        assert_eq!(exe.configure(0x10_0000, vec![0; CONFIG_WORDS + 1]), Err(LoaderError::TooLarge));
        assert!(!exe.is_set);
        assert!(exe.context.is_empty());
    }

    #[test]
    fn test_swap_settings_null_address() {
        assert_eq!(
            SwapSettings::new(0, 0x2000, 0x1000, "", "/swap"),
            Err(LoaderError::InvalidAddress)
        );
    }

    #[test]
    fn test_swap_settings_empty_filename_keeps_default() {
        let s = SwapSettings::new(0x1000, 0x2000, 0x4000, "", "/swap").unwrap();
        assert_eq!(s.filename, "/swap");
        assert_eq!(s.save_addr, 0x8000_1000);
        assert!(s.configured);
        assert_eq!(
            SwapSettings::new(0x1000, 0x2000, MAX_SWAP_BOUND + 1, "", "/swap"),
            Err(LoaderError::TooLarge)
        );
    }

    #[test]
    fn test_unset_swap_settings() {
        let s = SwapSettings::unset("/swap");
        assert!(s.is_unset());
        assert_eq!(s.filename, "/swap");
    }
}
