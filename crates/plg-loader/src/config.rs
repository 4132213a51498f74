//! Runtime configuration for the loader service.

use alloc::string::String;
use serde::{Deserialize, Serialize};

/// Default handshake wait, in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = plg_ipc::handshake::REPLY_TIMEOUT_NS / 1_000_000;

/// Default number of journal records kept before trimming.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 256;

/// Directory searched for plugins when no explicit path was set.
pub const DEFAULT_PLUGIN_ROOT: &str = "/luma/plugins";

/// Swap file used when the plugin did not name one.
pub const DEFAULT_SWAP_FILENAME: &str = "/luma/plugins/.swap";

/// Loader configuration, supplied to `PluginLoader::init`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// How long to wait for the plugin to acknowledge an event
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Journal capacity (oldest records trimmed beyond this)
    #[serde(default = "default_journal_capacity")]
    pub journal_capacity: usize,
    #[serde(default = "default_plugin_root")]
    pub plugin_root: String,
    #[serde(default = "default_swap_filename")]
    pub default_swap_filename: String,
    /// Flash the load indicator after a successful load
    #[serde(default = "default_flash_indicator")]
    pub flash_indicator: bool,
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_journal_capacity() -> usize {
    DEFAULT_JOURNAL_CAPACITY
}

fn default_plugin_root() -> String {
    String::from(DEFAULT_PLUGIN_ROOT)
}

fn default_swap_filename() -> String {
    String::from(DEFAULT_SWAP_FILENAME)
}

fn default_flash_indicator() -> bool {
    true
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            plugin_root: default_plugin_root(),
            default_swap_filename: default_swap_filename(),
            flash_indicator: true,
        }
    }
}

impl LoaderConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn handshake_timeout_ns(&self) -> u64 {
        self.handshake_timeout_ms.saturating_mul(1_000_000)
    }
}
