//! Lifecycle journal
//!
//! Bounded, append-only record of everything the loader did to the plugin:
//! lifecycle transitions, handshake timeouts, swap failures, load failures
//! and RPC outcomes. Sequence numbers are monotonic and survive trimming.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use plg_ipc::ResultCode;
use plg_kernel_core::Handle;

/// Lifecycle state of the single plugin slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginState {
    None,
    Running,
    Swapped,
}

impl PluginState {
    /// Value written to the low half of the status word.
    pub fn status_bits(self) -> u32 {
        match self {
            PluginState::None => plg_ipc::status::PLG_CFG_NONE,
            PluginState::Running => plg_ipc::status::PLG_CFG_RUNNING,
            PluginState::Swapped => plg_ipc::status::PLG_CFG_SWAPPED,
        }
    }
}

/// Which handshake a timeout happened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeKind {
    Exit,
    Swap,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Transition {
        from: PluginState,
        to: PluginState,
    },
    Loaded {
        target: Handle,
        path: String,
        size: usize,
    },
    LoadFailed {
        path: String,
        code: ResultCode,
    },
    HandshakeTimeout {
        kind: HandshakeKind,
    },
    /// Swap-out failed; the region stayed resident
    SwapOutFailed {
        code: ResultCode,
    },
    SwapInFailed {
        code: ResultCode,
    },
    TeardownQueued {
        target: Handle,
    },
    TeardownDone {
        target: Handle,
    },
    UnexpectedNotification {
        status: u32,
    },
    Command {
        id: u16,
        code: ResultCode,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    /// Monotonic sequence number
    pub seq: u64,
    /// Nanoseconds since boot
    pub timestamp: u64,
    pub kind: LifecycleEvent,
}

pub struct LifecycleJournal {
    records: Vec<LifecycleRecord>,
    next_seq: u64,
    capacity: usize,
}

impl LifecycleJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Append a record and return its sequence number.
    pub fn record(&mut self, timestamp: u64, kind: LifecycleEvent) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.push(LifecycleRecord { seq, timestamp, kind });
        self.trim_if_needed();
        seq
    }

    pub fn records(&self) -> &[LifecycleRecord] {
        &self.records
    }

    pub fn get_recent(&self, count: usize) -> Vec<&LifecycleRecord> {
        self.records.iter().rev().take(count).collect()
    }

    /// Every transition recorded, oldest first.
    pub fn transitions(&self) -> Vec<(PluginState, PluginState)> {
        self.records
            .iter()
            .filter_map(|r| match r.kind {
                LifecycleEvent::Transition { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.records)
    }

    fn trim_if_needed(&mut self) {
        if self.records.len() > self.capacity {
            let drain_count = self.records.len() - self.capacity;
            self.records.drain(0..drain_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_survives_trim() {
        let mut j = LifecycleJournal::new(2);
        for i in 0..5 {
            j.record(i, LifecycleEvent::Command { id: 8, code: 0 });
        }
        assert_eq!(j.len(), 2);
        assert_eq!(j.records()[0].seq, 3);
        assert_eq!(j.next_seq(), 5);
    }

    #[test]
    fn test_transitions_filter() {
        let mut j = LifecycleJournal::new(16);
        j.record(0, LifecycleEvent::Transition { from: PluginState::None, to: PluginState::Running });
        j.record(1, LifecycleEvent::HandshakeTimeout { kind: HandshakeKind::Swap });
        j.record(2, LifecycleEvent::Transition { from: PluginState::Running, to: PluginState::Swapped });
        assert_eq!(
            j.transitions(),
            [(PluginState::None, PluginState::Running), (PluginState::Running, PluginState::Swapped)]
        );
    }

    #[test]
    fn test_json_export_round_trips() {
        let mut j = LifecycleJournal::new(16);
        j.record(
            7,
            LifecycleEvent::Loaded { target: Handle(5), path: String::from("/p.plg"), size: 16 },
        );
        let json = j.to_json().unwrap();
        let back: Vec<LifecycleRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, j.records());
    }
}
