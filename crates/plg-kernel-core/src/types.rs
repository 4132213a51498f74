//! Core kernel types
//!
//! Pure data: identifiers, the per-thread scheduling mask, process flags and
//! the kernel object table entries. Nothing here depends on a HAL.

use alloc::string::String;
use alloc::collections::BTreeMap;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::capability::HandleTable;

/// Process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

/// Thread identifier (unique across the whole kernel)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

/// CPU core index
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(pub u8);

/// Kernel object identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Process-local handle value
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(pub u32);

impl Handle {
    /// Pseudo-handle resolving to the calling process
    pub const CURRENT_PROCESS: Handle = Handle(plg_ipc::kernel::CURRENT_PROCESS_HANDLE);

    /// The null handle ("no object")
    pub const NULL: Handle = Handle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

// ============================================================================
// Scheduling mask
// ============================================================================

/// Execution state stored in the low nibble of the scheduling mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    /// Created, not yet started or explicitly paused
    Paused,
    /// Eligible to run
    Runnable,
    /// Being torn down; never touched by lock/unlock
    Terminating,
}

impl ThreadState {
    const fn nibble(self) -> u16 {
        match self {
            ThreadState::Paused => 0,
            ThreadState::Runnable => 1,
            ThreadState::Terminating => 2,
        }
    }
}

/// Per-thread scheduling eligibility bitfield.
///
/// Low nibble: [`ThreadState`]. Upper bits: independent lock holds. A thread
/// is eligible for a core only when its state is `Runnable` and no lock bit
/// is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingMask(pub u16);

impl SchedulingMask {
    /// State nibble
    pub const STATE_MASK: u16 = 0x000F;
    /// Hold placed by the plugin loader's process-control operation
    pub const PLUGIN_LOCK: u16 = 0x0020;
    /// Hold placed by the debugger; never touched by the loader
    pub const DEBUG_LOCK: u16 = 0x0040;

    const LOCK_BITS: u16 = Self::PLUGIN_LOCK | Self::DEBUG_LOCK;

    pub const fn new(state: ThreadState) -> Self {
        Self(state.nibble())
    }

    pub fn state(self) -> ThreadState {
        match self.0 & Self::STATE_MASK {
            1 => ThreadState::Runnable,
            2 => ThreadState::Terminating,
            _ => ThreadState::Paused,
        }
    }

    /// Replace the state nibble, keeping every lock bit.
    pub fn with_state(self, state: ThreadState) -> Self {
        Self((self.0 & !Self::STATE_MASK) | state.nibble())
    }

    pub fn is_terminating(self) -> bool {
        self.state() == ThreadState::Terminating
    }

    pub fn is_plugin_locked(self) -> bool {
        self.0 & Self::PLUGIN_LOCK != 0
    }

    pub fn is_debug_locked(self) -> bool {
        self.0 & Self::DEBUG_LOCK != 0
    }

    pub fn set_bits(self, bits: u16) -> Self {
        Self(self.0 | bits)
    }

    pub fn clear_bits(self, bits: u16) -> Self {
        Self(self.0 & !bits)
    }

    /// Eligible for a run queue
    pub fn is_runnable(self) -> bool {
        self.state() == ThreadState::Runnable && self.0 & Self::LOCK_BITS == 0
    }
}

// ============================================================================
// Processes and threads
// ============================================================================

bitflags! {
    /// Custom per-process flags set through the process-control operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcessFlags: u32 {
        /// Map every page of the process read/write/execute
        const FORCE_RWX_PAGES                = 1 << 0;
        /// Signal the loader when the process exits
        const SIGNAL_ON_EXIT                 = 1 << 1;
        /// Signal the memory-change event when the layout changes
        const SIGNAL_ON_MEMORY_LAYOUT_CHANGE = 1 << 2;
    }
}

bitflags! {
    /// Page permissions in a process page map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryPermissions: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const RWX     = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Page granularity of the page map
pub const PAGE_SIZE: u32 = 0x1000;

/// One mapped page
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageEntry {
    /// Physical page base
    pub pa: u32,
    pub perms: MemoryPermissions,
}

/// Process descriptor
pub struct Process {
    pub pid: ProcessId,
    pub name: String,
    /// 64-bit program identifier
    pub title_id: u64,
    /// Kernel object backing this process (carries the reference count)
    pub object: ObjectId,
    pub flags: ProcessFlags,
    /// Local handle table
    pub handles: HandleTable,
    /// Page map keyed by virtual page base
    pub pages: BTreeMap<u32, PageEntry>,
    /// One-shot event created by `GetOnMemoryChangeEvent`
    pub memory_change_event: Option<ObjectId>,
    /// Set once the process began exiting
    pub exiting: bool,
    /// Set once the kernel dropped its own reference
    pub reaped: bool,
}

/// Number of thread-local words modelled per thread
pub const TLS_WORDS: usize = 8;

/// Thread descriptor
#[derive(Clone, Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub owner: ProcessId,
    pub mask: SchedulingMask,
    /// Home core
    pub core: CoreId,
    /// Thread-local storage words
    pub tls: [u32; TLS_WORDS],
}

/// Read-only view of a thread, handed to lock/unlock predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadView {
    pub id: ThreadId,
    pub owner: ProcessId,
    pub core: CoreId,
    pub tls: [u32; TLS_WORDS],
}

impl From<&Thread> for ThreadView {
    fn from(t: &Thread) -> Self {
        Self {
            id: t.id,
            owner: t.owner,
            core: t.core,
            tls: t.tls,
        }
    }
}

// ============================================================================
// Kernel objects
// ============================================================================

/// Class of a kernel object, used by handle listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectClass {
    Process,
    Event,
    AddressArbiter,
}

impl ObjectClass {
    /// Stable class token reported to callers
    pub const fn token(self) -> u8 {
        match self {
            ObjectClass::Process => 0xC5,
            ObjectClass::Event => 0x95,
            ObjectClass::AddressArbiter => 0x98,
        }
    }

    pub fn from_token(token: u8) -> Option<Self> {
        match token {
            0xC5 => Some(ObjectClass::Process),
            0x95 => Some(ObjectClass::Event),
            0x98 => Some(ObjectClass::AddressArbiter),
            _ => None,
        }
    }
}

/// Object payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectBody {
    Process(ProcessId),
    Event { signaled: bool, one_shot: bool },
    AddressArbiter,
}

/// Reference-counted kernel object
#[derive(Clone, Debug)]
pub struct KernelObject {
    pub body: ObjectBody,
    pub ref_count: u32,
}

impl KernelObject {
    pub fn class(&self) -> ObjectClass {
        match self.body {
            ObjectBody::Process(_) => ObjectClass::Process,
            ObjectBody::Event { .. } => ObjectClass::Event,
            ObjectBody::AddressArbiter => ObjectClass::AddressArbiter,
        }
    }
}
