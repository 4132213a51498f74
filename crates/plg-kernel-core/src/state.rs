//! Kernel state - pure data structure holding all kernel state
//!
//! `KernelState` owns the process table, the global thread list, the kernel
//! object table and one scheduler per core. It has no HAL dependency and
//! performs no locking of its own; `Kernel` wraps it in the recursive
//! critical section.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::capability::HandleTable;
use crate::error::KernelError;
use crate::types::{
    CoreId, Handle, KernelObject, MemoryPermissions, ObjectBody, ObjectClass, ObjectId, PageEntry,
    Process, ProcessFlags, ProcessId, SchedulingMask, Thread, ThreadId, ThreadState, PAGE_SIZE,
    TLS_WORDS,
};

/// Scheduler state of one core.
#[derive(Clone, Debug, Default)]
pub struct CoreScheduler {
    /// Thread currently executing on this core
    pub current: Option<ThreadId>,
    /// Runnable threads waiting for this core, in FIFO order
    pub run_queue: VecDeque<ThreadId>,
    /// Cross-core reschedule request
    pub ipi_pending: bool,
    /// Cross-core interrupts delivered to this core since boot
    pub ipis_delivered: u64,
}

/// The kernel state - no HAL, no I/O, no side effects.
pub struct KernelState {
    /// Process table
    pub processes: BTreeMap<ProcessId, Process>,
    /// Global thread list, ordered by thread id
    pub threads: BTreeMap<ThreadId, Thread>,
    /// Reference-counted kernel objects
    pub objects: BTreeMap<ObjectId, KernelObject>,
    /// Per-core schedulers, indexed by `CoreId`
    pub cores: Vec<CoreScheduler>,
    /// Thread currently holding the kernel synchronization mutex
    pub sync_mutex_owner: Option<ThreadId>,
    next_pid: u64,
    next_tid: u64,
    next_object_id: u64,
}

impl KernelState {
    /// Create an empty kernel with `core_count` cores.
    pub fn new(core_count: u8) -> Self {
        Self {
            processes: BTreeMap::new(),
            threads: BTreeMap::new(),
            objects: BTreeMap::new(),
            cores: (0..core_count.max(1)).map(|_| CoreScheduler::default()).collect(),
            sync_mutex_owner: None,
            next_pid: 1,
            next_tid: 1,
            next_object_id: 1,
        }
    }

    fn alloc_object(&mut self, body: ObjectBody) -> ObjectId {
        let id = ObjectId(self.next_object_id);
        self.next_object_id += 1;
        self.objects.insert(id, KernelObject { body, ref_count: 1 });
        id
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Register a process. The process object starts with one reference, the
    /// kernel's own, dropped by `destroy_process`.
    pub fn create_process(&mut self, name: &str, title_id: u64) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        let object = self.alloc_object(ObjectBody::Process(pid));
        self.processes.insert(
            pid,
            Process {
                pid,
                name: name.to_string(),
                title_id,
                object,
                flags: ProcessFlags::empty(),
                handles: HandleTable::new(),
                pages: BTreeMap::new(),
                memory_change_event: None,
                exiting: false,
                reaped: false,
            },
        );
        pid
    }

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub fn process_name(&self, pid: ProcessId) -> Option<String> {
        self.processes.get(&pid).map(|p| p.name.clone())
    }

    /// Mark a process as exiting and every one of its threads terminating.
    ///
    /// Returns whether the process asked to signal on exit.
    pub fn begin_exit(&mut self, pid: ProcessId) -> Result<bool, KernelError> {
        let process = self.processes.get_mut(&pid).ok_or(KernelError::InvalidHandle)?;
        process.exiting = true;
        let signal = process.flags.contains(ProcessFlags::SIGNAL_ON_EXIT);
        let tids: Vec<ThreadId> = self.threads_of(pid).collect();
        for tid in tids {
            self.set_thread_state(tid, ThreadState::Terminating)?;
        }
        Ok(signal)
    }

    /// Remove every thread of an exited process and drop the kernel's
    /// reference on it. The process record survives while handles to it are
    /// still open elsewhere.
    pub fn destroy_process(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        if self.processes.get(&pid).ok_or(KernelError::InvalidHandle)?.reaped {
            return Ok(());
        }
        self.begin_exit(pid)?;
        let tids: Vec<ThreadId> = self.threads_of(pid).collect();
        for tid in tids {
            self.remove_thread(tid);
        }
        let (object, held) = {
            let process = self.processes.get_mut(&pid).ok_or(KernelError::InvalidHandle)?;
            process.reaped = true;
            (process.object, process.handles.drain())
        };
        for o in held {
            self.release_object(o);
        }
        self.release_object(object);
        Ok(())
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Create a paused thread owned by `owner`, homed on `core`.
    pub fn create_thread(&mut self, owner: ProcessId, core: CoreId) -> Result<ThreadId, KernelError> {
        if !self.processes.contains_key(&owner) || usize::from(core.0) >= self.cores.len() {
            return Err(KernelError::InvalidHandle);
        }
        let id = ThreadId(self.next_tid);
        self.next_tid += 1;
        self.threads.insert(
            id,
            Thread {
                id,
                owner,
                mask: SchedulingMask::new(ThreadState::Paused),
                core,
                tls: [0; TLS_WORDS],
            },
        );
        Ok(id)
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    /// Ids of every thread owned by `pid`, in global list order.
    pub fn threads_of(&self, pid: ProcessId) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.values().filter(move |t| t.owner == pid).map(|t| t.id)
    }

    /// Write one thread-local word.
    pub fn set_tls(&mut self, tid: ThreadId, slot: usize, value: u32) -> Result<(), KernelError> {
        let thread = self.threads.get_mut(&tid).ok_or(KernelError::InvalidHandle)?;
        let word = thread.tls.get_mut(slot).ok_or(KernelError::InvalidAddress)?;
        *word = value;
        Ok(())
    }

    /// Change the state nibble and keep run queues consistent.
    pub fn set_thread_state(&mut self, tid: ThreadId, state: ThreadState) -> Result<(), KernelError> {
        let thread = self.threads.get_mut(&tid).ok_or(KernelError::InvalidHandle)?;
        thread.mask = thread.mask.with_state(state);
        let core = thread.core;
        if thread.mask.is_runnable() {
            self.admit(tid);
        } else {
            self.evict(tid);
            if self.core(core).and_then(|c| c.current) == Some(tid) {
                self.reschedule(core);
            }
        }
        Ok(())
    }

    /// Set or clear debugger hold bits. Exposed for tests of lock-bit
    /// independence.
    pub fn set_debug_lock(&mut self, tid: ThreadId, locked: bool) -> Result<(), KernelError> {
        let thread = self.threads.get_mut(&tid).ok_or(KernelError::InvalidHandle)?;
        thread.mask = if locked {
            thread.mask.set_bits(SchedulingMask::DEBUG_LOCK)
        } else {
            thread.mask.clear_bits(SchedulingMask::DEBUG_LOCK)
        };
        if thread.mask.is_runnable() {
            self.admit(tid);
        } else {
            self.evict(tid);
        }
        Ok(())
    }

    fn remove_thread(&mut self, tid: ThreadId) {
        self.evict(tid);
        for core in &mut self.cores {
            if core.current == Some(tid) {
                core.current = None;
            }
        }
        if self.sync_mutex_owner == Some(tid) {
            self.sync_mutex_owner = None;
        }
        self.threads.remove(&tid);
    }

    /// Set the plugin hold bit. Returns `false` if it was already set.
    pub fn set_plugin_lock(&mut self, tid: ThreadId) -> bool {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return false;
        };
        if thread.mask.is_plugin_locked() {
            return false;
        }
        thread.mask = thread.mask.set_bits(SchedulingMask::PLUGIN_LOCK);
        self.evict(tid);
        true
    }

    /// Clear the plugin hold bit and re-admit the thread. Returns `false` if
    /// it was not set.
    pub fn clear_plugin_lock(&mut self, tid: ThreadId) -> bool {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return false;
        };
        if !thread.mask.is_plugin_locked() {
            return false;
        }
        thread.mask = thread.mask.clear_bits(SchedulingMask::PLUGIN_LOCK);
        self.admit(tid);
        true
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    pub fn core(&self, core: CoreId) -> Option<&CoreScheduler> {
        self.cores.get(usize::from(core.0))
    }

    fn core_mut(&mut self, core: CoreId) -> Option<&mut CoreScheduler> {
        self.cores.get_mut(usize::from(core.0))
    }

    /// Core the thread is currently executing on, if any.
    pub fn running_core(&self, tid: ThreadId) -> Option<CoreId> {
        self.cores
            .iter()
            .position(|c| c.current == Some(tid))
            .map(|i| CoreId(i as u8))
    }

    /// Put a runnable thread on its home core's run queue, unless it is
    /// already queued or running.
    pub fn admit(&mut self, tid: ThreadId) {
        let Some(thread) = self.threads.get(&tid) else {
            return;
        };
        if !thread.mask.is_runnable() || self.running_core(tid).is_some() {
            return;
        }
        let home = thread.core;
        if let Some(core) = self.core_mut(home) {
            if !core.run_queue.contains(&tid) {
                core.run_queue.push_back(tid);
            }
        }
    }

    /// Drop a thread from every run queue.
    pub fn evict(&mut self, tid: ThreadId) {
        for core in &mut self.cores {
            core.run_queue.retain(|&t| t != tid);
        }
    }

    /// Re-evaluate a core: keep its current thread if still runnable,
    /// otherwise switch to the next runnable thread in its queue.
    pub fn reschedule(&mut self, core: CoreId) {
        let keep = self
            .core(core)
            .and_then(|c| c.current)
            .and_then(|t| self.threads.get(&t))
            .map(|t| t.mask.is_runnable())
            .unwrap_or(false);
        if keep {
            return;
        }
        let next = self.pop_runnable(core);
        if let Some(c) = self.core_mut(core) {
            c.current = next;
        }
    }

    /// Timer tick: rotate the current thread to the back of the queue and
    /// run the next one.
    pub fn tick(&mut self, core: CoreId) -> Option<ThreadId> {
        let previous = self.core_mut(core)?.current.take();
        let next = self.pop_runnable(core);
        if let Some(prev) = previous {
            self.admit(prev);
        }
        let next = next.or_else(|| self.pop_runnable(core));
        self.core_mut(core)?.current = next;
        next
    }

    fn pop_runnable(&mut self, core: CoreId) -> Option<ThreadId> {
        loop {
            let tid = self.core_mut(core)?.run_queue.pop_front()?;
            if self.threads.get(&tid).map(|t| t.mask.is_runnable()).unwrap_or(false) {
                return Some(tid);
            }
        }
    }

    /// Make a thread the one executing on its home core.
    pub fn run_on_core(&mut self, tid: ThreadId) -> Result<(), KernelError> {
        let thread = self.threads.get(&tid).ok_or(KernelError::InvalidHandle)?;
        if !thread.mask.is_runnable() {
            return Err(KernelError::InvalidHandle);
        }
        let home = thread.core;
        self.evict(tid);
        let previous = self.core_mut(home).ok_or(KernelError::InvalidHandle)?.current.replace(tid);
        if let Some(prev) = previous {
            self.admit(prev);
        }
        Ok(())
    }

    /// Raise the cross-core reschedule request on `core`.
    pub fn raise_ipi(&mut self, core: CoreId) {
        if let Some(c) = self.core_mut(core) {
            c.ipi_pending = true;
        }
    }

    /// Deliver every pending cross-core interrupt: each flagged core
    /// re-evaluates its scheduler before running anything else.
    ///
    /// Returns the cores that were interrupted.
    pub fn deliver_cross_core_interrupts(&mut self) -> Vec<CoreId> {
        let pending: Vec<CoreId> = self
            .cores
            .iter()
            .enumerate()
            .filter(|(_, c)| c.ipi_pending)
            .map(|(i, _)| CoreId(i as u8))
            .collect();
        for &core in &pending {
            if let Some(c) = self.core_mut(core) {
                c.ipi_pending = false;
                c.ipis_delivered += 1;
            }
            self.reschedule(core);
        }
        pending
    }

    // ========================================================================
    // Objects and handles
    // ========================================================================

    /// Add one reference to an object.
    pub fn retain_object(&mut self, object: ObjectId) -> Result<(), KernelError> {
        let obj = self.objects.get_mut(&object).ok_or(KernelError::InvalidHandle)?;
        obj.ref_count += 1;
        Ok(())
    }

    /// Drop one reference; the object (and a process record it backs) is
    /// removed when the count reaches zero.
    pub fn release_object(&mut self, object: ObjectId) {
        let Some(obj) = self.objects.get_mut(&object) else {
            return;
        };
        obj.ref_count = obj.ref_count.saturating_sub(1);
        if obj.ref_count > 0 {
            return;
        }
        if let Some(KernelObject { body: ObjectBody::Process(pid), .. }) = self.objects.remove(&object) {
            let event = self.processes.remove(&pid).and_then(|p| p.memory_change_event);
            if let Some(event) = event {
                self.release_object(event);
            }
        }
    }

    pub fn object(&self, object: ObjectId) -> Option<&KernelObject> {
        self.objects.get(&object)
    }

    /// Insert a new reference to `object` into `owner`'s handle table.
    pub fn open_handle(&mut self, owner: ProcessId, object: ObjectId) -> Result<Handle, KernelError> {
        if !self.processes.contains_key(&owner) {
            return Err(KernelError::InvalidHandle);
        }
        self.retain_object(object)?;
        let inserted = self
            .processes
            .get_mut(&owner)
            .and_then(|p| p.handles.insert(object));
        match inserted {
            Some(handle) => Ok(handle),
            None => {
                self.release_object(object);
                Err(KernelError::OutOfResource)
            }
        }
    }

    /// Open a handle to process `target` in `owner`'s table.
    pub fn open_process_handle(&mut self, owner: ProcessId, target: ProcessId) -> Result<Handle, KernelError> {
        let object = self.processes.get(&target).ok_or(KernelError::InvalidHandle)?.object;
        self.open_handle(owner, object)
    }

    /// Create an object owned only by a fresh handle in `owner`'s table.
    pub fn create_object(&mut self, owner: ProcessId, class: ObjectClass) -> Result<Handle, KernelError> {
        let body = match class {
            ObjectClass::Event => ObjectBody::Event { signaled: false, one_shot: false },
            ObjectClass::AddressArbiter => ObjectBody::AddressArbiter,
            ObjectClass::Process => return Err(KernelError::WrongObjectType),
        };
        let object = self.alloc_object(body);
        let handle = self.open_handle(owner, object);
        // The handle now carries the only reference
        self.release_object(object);
        handle
    }

    /// Close a handle, dropping its reference.
    pub fn close_handle(&mut self, owner: ProcessId, handle: Handle) -> Result<(), KernelError> {
        let object = self
            .processes
            .get_mut(&owner)
            .and_then(|p| p.handles.remove(handle))
            .ok_or(KernelError::InvalidHandle)?;
        self.release_object(object);
        Ok(())
    }

    /// Resolve a handle in `owner`'s table without taking a reference.
    pub fn lookup(&self, owner: ProcessId, handle: Handle) -> Result<ObjectId, KernelError> {
        let process = self.processes.get(&owner).ok_or(KernelError::InvalidHandle)?;
        if handle == Handle::CURRENT_PROCESS {
            return Ok(process.object);
        }
        process.handles.get(handle).ok_or(KernelError::InvalidHandle)
    }

    /// Resolve a process handle and take a reference on the process.
    ///
    /// Every successful call must be balanced by `release_process`.
    pub fn acquire_process(&mut self, caller: ProcessId, handle: Handle) -> Result<ProcessId, KernelError> {
        let object = self.lookup(caller, handle)?;
        let pid = match self.objects.get(&object).map(|o| &o.body) {
            Some(ObjectBody::Process(pid)) => *pid,
            Some(_) => return Err(KernelError::WrongObjectType),
            None => return Err(KernelError::InvalidHandle),
        };
        if !self.processes.contains_key(&pid) {
            return Err(KernelError::InvalidHandle);
        }
        self.retain_object(object)?;
        Ok(pid)
    }

    pub fn release_process(&mut self, pid: ProcessId) {
        if let Some(object) = self.processes.get(&pid).map(|p| p.object) {
            self.release_object(object);
        }
    }

    /// Reference count of the object backing `pid`.
    pub fn process_ref_count(&self, pid: ProcessId) -> Option<u32> {
        let object = self.processes.get(&pid)?.object;
        self.objects.get(&object).map(|o| o.ref_count)
    }

    /// Whether an event object is signaled.
    pub fn event_signaled(&self, owner: ProcessId, handle: Handle) -> Result<bool, KernelError> {
        let object = self.lookup(owner, handle)?;
        match self.objects.get(&object).map(|o| &o.body) {
            Some(ObjectBody::Event { signaled, .. }) => Ok(*signaled),
            Some(_) => Err(KernelError::WrongObjectType),
            None => Err(KernelError::InvalidHandle),
        }
    }

    /// Clear a signaled event. Returns the previous state.
    pub fn clear_event(&mut self, owner: ProcessId, handle: Handle) -> Result<bool, KernelError> {
        let object = self.lookup(owner, handle)?;
        match self.objects.get_mut(&object).map(|o| &mut o.body) {
            Some(ObjectBody::Event { signaled, .. }) => Ok(core::mem::replace(signaled, false)),
            Some(_) => Err(KernelError::WrongObjectType),
            None => Err(KernelError::InvalidHandle),
        }
    }

    fn signal_event(&mut self, object: ObjectId) {
        if let Some(KernelObject { body: ObjectBody::Event { signaled, .. }, .. }) =
            self.objects.get_mut(&object)
        {
            *signaled = true;
        }
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Map one page. Forced-RWX processes get RWX regardless of `perms`; a
    /// registered memory-change event is signaled.
    pub fn map_page(
        &mut self,
        pid: ProcessId,
        va: u32,
        pa: u32,
        perms: MemoryPermissions,
    ) -> Result<(), KernelError> {
        let process = self.processes.get_mut(&pid).ok_or(KernelError::InvalidHandle)?;
        let perms = if process.flags.contains(ProcessFlags::FORCE_RWX_PAGES) {
            MemoryPermissions::RWX
        } else {
            perms
        };
        process.pages.insert(va & !(PAGE_SIZE - 1), PageEntry { pa: pa & !(PAGE_SIZE - 1), perms });
        self.notify_layout_change(pid);
        Ok(())
    }

    /// Unmap one page.
    pub fn unmap_page(&mut self, pid: ProcessId, va: u32) -> Result<(), KernelError> {
        let process = self.processes.get_mut(&pid).ok_or(KernelError::InvalidHandle)?;
        process
            .pages
            .remove(&(va & !(PAGE_SIZE - 1)))
            .ok_or(KernelError::InvalidAddress)?;
        self.notify_layout_change(pid);
        Ok(())
    }

    fn notify_layout_change(&mut self, pid: ProcessId) {
        let event = self.processes.get(&pid).and_then(|p| {
            p.flags
                .contains(ProcessFlags::SIGNAL_ON_MEMORY_LAYOUT_CHANGE)
                .then_some(p.memory_change_event)
                .flatten()
        });
        if let Some(event) = event {
            self.signal_event(event);
        }
    }

    /// Translate a virtual address through a process page map.
    pub fn translate(&self, pid: ProcessId, va: u32) -> Result<u32, KernelError> {
        let process = self.processes.get(&pid).ok_or(KernelError::InvalidHandle)?;
        let entry = process
            .pages
            .get(&(va & !(PAGE_SIZE - 1)))
            .ok_or(KernelError::InvalidAddress)?;
        Ok(entry.pa | (va & (PAGE_SIZE - 1)))
    }

    /// Lazily create the one-shot memory-change event of a process.
    pub(crate) fn memory_change_event(&mut self, pid: ProcessId) -> Result<ObjectId, KernelError> {
        if let Some(event) = self.processes.get(&pid).and_then(|p| p.memory_change_event) {
            return Ok(event);
        }
        if !self.processes.contains_key(&pid) {
            return Err(KernelError::InvalidHandle);
        }
        // The process record holds this first reference
        let event = self.alloc_object(ObjectBody::Event { signaled: false, one_shot: true });
        if let Some(process) = self.processes.get_mut(&pid) {
            process.memory_change_event = Some(event);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable_thread(state: &mut KernelState, pid: ProcessId, core: u8) -> ThreadId {
        let tid = state.create_thread(pid, CoreId(core)).unwrap();
        state.set_thread_state(tid, ThreadState::Runnable).unwrap();
        tid
    }

    #[test]
    fn test_runnable_threads_are_queued_once() {
        let mut s = KernelState::new(2);
        let pid = s.create_process("host", 0x0004_0000_0000_1000);
        let t = runnable_thread(&mut s, pid, 1);
        s.admit(t);
        assert_eq!(s.cores[1].run_queue.iter().filter(|&&x| x == t).count(), 1);
    }

    #[test]
    fn test_tick_rotates_round_robin() {
        let mut s = KernelState::new(1);
        let pid = s.create_process("host", 1);
        let a = runnable_thread(&mut s, pid, 0);
        let b = runnable_thread(&mut s, pid, 0);
        assert_eq!(s.tick(CoreId(0)), Some(a));
        assert_eq!(s.tick(CoreId(0)), Some(b));
        assert_eq!(s.tick(CoreId(0)), Some(a));
    }

    #[test]
    fn test_process_record_outlives_kernel_reference_while_handles_exist() {
        let mut s = KernelState::new(1);
        let loader = s.create_process("loader", 2);
        let host = s.create_process("host", 3);
        let h = s.open_process_handle(loader, host).unwrap();
        s.destroy_process(host).unwrap();
        assert!(s.process(host).is_some());
        s.close_handle(loader, h).unwrap();
        assert!(s.process(host).is_none());
    }

    #[test]
    fn test_translate_keeps_page_offset() {
        let mut s = KernelState::new(1);
        let pid = s.create_process("host", 1);
        s.map_page(pid, 0x0010_0000, 0x2000_0000, MemoryPermissions::READ).unwrap();
        assert_eq!(s.translate(pid, 0x0010_0abc), Ok(0x2000_0abc));
        assert_eq!(s.translate(pid, 0x0020_0000), Err(KernelError::InvalidAddress));
    }

    #[test]
    fn test_created_object_is_owned_by_handle() {
        let mut s = KernelState::new(1);
        let pid = s.create_process("loader", 1);
        let h = s.create_object(pid, ObjectClass::Event).unwrap();
        let object = s.lookup(pid, h).unwrap();
        assert_eq!(s.object(object).map(|o| o.ref_count), Some(1));
        s.close_handle(pid, h).unwrap();
        assert!(s.object(object).is_none());
    }
}
