//! Plugin thread membership.
//!
//! A thread belongs to the plugin when its first TLS word holds the tag the
//! loader wrote when it created the thread.

use plg_kernel_core::{ThreadPredicate, ThreadView};

/// TLS slot holding the plugin tag.
pub const PLUGIN_THREAD_TLS_SLOT: usize = 0;

/// Tag written into plugin threads ("$VT!" little-endian).
pub const PLUGIN_THREAD_TAG: u32 = 0x2154_5624;

#[derive(Clone, Copy, Debug, Default)]
pub struct PluginThreadPredicate;

impl ThreadPredicate for PluginThreadPredicate {
    fn matches(&self, thread: &ThreadView) -> bool {
        thread.tls[PLUGIN_THREAD_TLS_SLOT] == PLUGIN_THREAD_TAG
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plg_kernel_core::{CoreId, ProcessId, ThreadId, TLS_WORDS};

    fn view(tag: u32) -> ThreadView {
        let mut tls = [0u32; TLS_WORDS];
        tls[PLUGIN_THREAD_TLS_SLOT] = tag;
        ThreadView {
            id: ThreadId(1),
            owner: ProcessId(1),
            core: CoreId(0),
            tls,
        }
    }

    #[test]
    fn test_matches_tagged_threads_only() {
        assert!(PluginThreadPredicate.matches(&view(PLUGIN_THREAD_TAG)));
        assert!(!PluginThreadPredicate.matches(&view(0)));
        assert!(!PluginThreadPredicate.matches(&view(PLUGIN_THREAD_TAG ^ 1)));
    }
}
