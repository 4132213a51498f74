//! Kernel runtime wrapper
//!
//! `Kernel` owns the `KernelState` behind the recursive critical section and
//! is what the platform layer shares between service threads. Every entry
//! point takes the critical section for its whole duration.
//!
//! Each execution context (one per core, plus an admin context for setup and
//! inspection) owns a `LockOwner` parked in its own `spin::Mutex`. Entering
//! the kernel as a context takes that mutex first, so two OS threads acting
//! as the same core queue up instead of sharing the critical section.
//! Closures passed to `with_state` must not call back into the same `Kernel`.

use core::cell::RefCell;

use plg_unsafe_primitives::{LockOwner, RecursiveLock};

use crate::error::KernelError;
use crate::invariants::{check_all_invariants, InvariantViolation};
use crate::process_op::{control_process, Caller, ProcessOp, ProcessOpOutput};
use crate::state::KernelState;
use crate::types::{CoreId, Handle, ProcessId, ThreadId};
use alloc::vec::Vec;

/// Shared kernel: state plus its critical section.
pub struct Kernel {
    state: RecursiveLock<RefCell<KernelState>>,
    /// One owner per core, then the admin owner.
    owners: Vec<spin::Mutex<LockOwner>>,
}

impl Kernel {
    pub fn new(core_count: u8) -> Self {
        Self {
            state: RecursiveLock::new(RefCell::new(KernelState::new(core_count))),
            owners: (0..=usize::from(core_count)).map(|_| spin::Mutex::new(LockOwner::new())).collect(),
        }
    }

    /// Owner slot for `core`; unknown cores share the admin slot.
    fn owner_slot(&self, core: Option<CoreId>) -> &spin::Mutex<LockOwner> {
        let admin = self.owners.len() - 1;
        let idx = core.map_or(admin, |c| usize::from(c.0).min(admin));
        &self.owners[idx]
    }

    fn with_owner<R>(&self, core: Option<CoreId>, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let owner = self.owner_slot(core).lock();
        let guard = self.state.lock(&owner);
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Run `f` with exclusive access to the state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        self.with_owner(None, f)
    }

    /// Process-control entry point.
    pub fn control_process(
        &self,
        caller: Caller,
        target: Handle,
        op: ProcessOp<'_>,
    ) -> Result<ProcessOpOutput, KernelError> {
        self.with_owner(Some(caller.core), |state| control_process(state, &caller, target, op))
    }

    /// Raw entry point: decode `code`/`arg` and run the operation without a
    /// thread filter.
    pub fn control_process_raw(
        &self,
        caller: Caller,
        target: Handle,
        code: u32,
        arg: u32,
    ) -> Result<ProcessOpOutput, KernelError> {
        let op = ProcessOp::decode(code, arg, None)?;
        self.control_process(caller, target, op)
    }

    /// Timer tick on `core`.
    pub fn tick(&self, core: CoreId) -> Option<ThreadId> {
        self.with_owner(Some(core), |state| state.tick(core))
    }

    pub fn close_handle(&self, owner: ProcessId, handle: Handle) -> Result<(), KernelError> {
        self.with_state(|state| state.close_handle(owner, handle))
    }

    pub fn title_id(&self, owner: ProcessId, handle: Handle) -> Result<u64, KernelError> {
        self.with_state(|state| {
            let pid = state.acquire_process(owner, handle)?;
            let title = state.process(pid).map(|p| p.title_id);
            state.release_process(pid);
            title.ok_or(KernelError::InvalidHandle)
        })
    }

    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        self.with_state(|state| check_all_invariants(state))
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel").field("owner", &self.state.owner()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThreadState;

    #[test]
    fn test_title_id_releases_reference() {
        let k = Kernel::new(1);
        let (loader, handle, host) = k.with_state(|s| {
            let loader = s.create_process("loader", 1);
            let host = s.create_process("host", 0x0004_0000_0005_5D00);
            let h = s.open_process_handle(loader, host).unwrap();
            (loader, h, host)
        });
        assert_eq!(k.title_id(loader, handle), Ok(0x0004_0000_0005_5D00));
        assert_eq!(k.with_state(|s| s.process_ref_count(host)), Some(2));
    }

    #[test]
    fn test_tick_runs_queued_thread() {
        let k = Kernel::new(1);
        let t = k.with_state(|s| {
            let p = s.create_process("host", 1);
            let t = s.create_thread(p, CoreId(0)).unwrap();
            s.set_thread_state(t, ThreadState::Runnable).unwrap();
            t
        });
        assert_eq!(k.tick(CoreId(0)), Some(t));
        assert!(k.check_invariants().is_empty());
    }

    #[test]
    fn test_unknown_core_uses_admin_slot() {
        let k = Kernel::new(2);
        assert!(core::ptr::eq(k.owner_slot(Some(CoreId(9))), k.owner_slot(None)));
        assert!(!core::ptr::eq(k.owner_slot(Some(CoreId(1))), k.owner_slot(None)));
        assert_eq!(k.tick(CoreId(9)), None);
    }
}
