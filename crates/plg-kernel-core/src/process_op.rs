//! The process-control operation family
//!
//! `control_process` is the privileged entry point a trusted caller uses on a
//! target process: list its handles, force its pages RWX, obtain its memory
//! layout change event, ask for an exit signal, translate addresses, and
//! lock or unlock (a subset of) its threads.
//!
//! Like a pure step function it only mutates the state it is handed; the
//! caller holds the critical section for the whole call, so a lock or unlock
//! pass over many threads is observed atomically by anyone else querying
//! scheduling state.
//!
//! # Properties
//!
//! 1. **Reference balance**: the process reference taken to resolve the
//!    target is always released, whatever the outcome
//! 2. **Selective**: only threads of the target that match the predicate and
//!    are not terminating change; every other bit of their mask is kept
//! 3. **Independent holds**: only `SchedulingMask::PLUGIN_LOCK` is touched,
//!    so debugger holds are never released by an unlock
//! 4. **No kernel wedge**: the holder of the synchronization mutex is never
//!    locked

use alloc::vec::Vec;

use plg_ipc::kernel as op;

use crate::error::KernelError;
use crate::state::KernelState;
use crate::types::{CoreId, Handle, MemoryPermissions, ObjectClass, ProcessFlags, ProcessId, ThreadId, ThreadView};

/// Decides which threads of the target a schedule operation applies to.
pub trait ThreadPredicate {
    fn matches(&self, thread: &ThreadView) -> bool;
}

impl<F> ThreadPredicate for F
where
    F: Fn(&ThreadView) -> bool,
{
    fn matches(&self, thread: &ThreadView) -> bool {
        self(thread)
    }
}

/// Direction of a schedule operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleMode {
    Lock,
    Unlock,
}

/// Identity of whoever invokes the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub process: ProcessId,
    pub thread: ThreadId,
    pub core: CoreId,
}

/// Decoded operation.
#[derive(Clone, Copy)]
pub enum ProcessOp<'a> {
    /// List handles, optionally filtered by object class
    GetAllHandles { class: Option<ObjectClass> },
    SetMmuToRwx,
    GetOnMemoryChangeEvent,
    SignalOnExit,
    GetPaFromVa { va: u32 },
    ScheduleThreads {
        mode: ScheduleMode,
        predicate: Option<&'a dyn ThreadPredicate>,
    },
}

impl<'a> ProcessOp<'a> {
    /// Decode a raw operation code and its argument word.
    ///
    /// For `GetAllHandles` the argument is a class token (0 for all), for
    /// `GetPaFromVa` the virtual address, for `ScheduleThreads` 0 to unlock
    /// and anything else to lock.
    pub fn decode(
        code: u32,
        arg: u32,
        predicate: Option<&'a dyn ThreadPredicate>,
    ) -> Result<Self, KernelError> {
        Ok(match code {
            op::PROCESSOP_GET_ALL_HANDLES => {
                let token = u8::try_from(arg).map_err(|_| KernelError::InvalidEnumValue)?;
                ProcessOp::GetAllHandles {
                    class: ObjectClass::from_token(token).filter(|_| token != 0),
                }
            }
            op::PROCESSOP_SET_MMU_TO_RWX => ProcessOp::SetMmuToRwx,
            op::PROCESSOP_GET_ON_MEMORY_CHANGE_EVENT => ProcessOp::GetOnMemoryChangeEvent,
            op::PROCESSOP_SIGNAL_ON_EXIT => ProcessOp::SignalOnExit,
            op::PROCESSOP_GET_PA_FROM_VA => ProcessOp::GetPaFromVa { va: arg },
            op::PROCESSOP_SCHEDULE_THREADS => ProcessOp::ScheduleThreads {
                mode: if arg == op::SCHEDULE_UNLOCK {
                    ScheduleMode::Unlock
                } else {
                    ScheduleMode::Lock
                },
                predicate,
            },
            _ => return Err(KernelError::NotImplemented),
        })
    }
}

impl core::fmt::Debug for ProcessOp<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProcessOp::GetAllHandles { class } => f.debug_struct("GetAllHandles").field("class", class).finish(),
            ProcessOp::SetMmuToRwx => write!(f, "SetMmuToRwx"),
            ProcessOp::GetOnMemoryChangeEvent => write!(f, "GetOnMemoryChangeEvent"),
            ProcessOp::SignalOnExit => write!(f, "SignalOnExit"),
            ProcessOp::GetPaFromVa { va } => write!(f, "GetPaFromVa({va:#010x})"),
            ProcessOp::ScheduleThreads { mode, predicate } => f
                .debug_struct("ScheduleThreads")
                .field("mode", mode)
                .field("filtered", &predicate.is_some())
                .finish(),
        }
    }
}

/// What a schedule operation changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    /// Threads that gained the plugin hold
    pub locked: Vec<ThreadId>,
    /// Threads that lost the plugin hold
    pub unlocked: Vec<ThreadId>,
    /// Cores that received a cross-core interrupt
    pub interrupted: Vec<CoreId>,
    /// Matching threads skipped because they are terminating
    pub skipped_terminating: usize,
}

/// Result of a successful operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOpOutput {
    Handles(Vec<Handle>),
    Handle(Handle),
    PhysicalAddress(u32),
    Schedule(ScheduleReport),
    Done,
}

/// Execute one process-control operation on behalf of `caller`.
pub fn control_process(
    state: &mut KernelState,
    caller: &Caller,
    target: Handle,
    op: ProcessOp<'_>,
) -> Result<ProcessOpOutput, KernelError> {
    let pid = state.acquire_process(caller.process, target)?;
    let result = dispatch(state, caller, pid, op);
    state.release_process(pid);
    result
}

fn dispatch(
    state: &mut KernelState,
    caller: &Caller,
    pid: ProcessId,
    op: ProcessOp<'_>,
) -> Result<ProcessOpOutput, KernelError> {
    match op {
        ProcessOp::GetAllHandles { class } => get_all_handles(state, pid, class),
        ProcessOp::SetMmuToRwx => {
            let process = state.process_mut(pid).ok_or(KernelError::InvalidHandle)?;
            process.flags |= ProcessFlags::FORCE_RWX_PAGES;
            for page in process.pages.values_mut() {
                page.perms = MemoryPermissions::RWX;
            }
            Ok(ProcessOpOutput::Done)
        }
        ProcessOp::GetOnMemoryChangeEvent => {
            if pid != caller.process {
                return Err(KernelError::InvalidHandle);
            }
            let event = state.memory_change_event(pid)?;
            if let Some(process) = state.process_mut(pid) {
                process.flags |= ProcessFlags::SIGNAL_ON_MEMORY_LAYOUT_CHANGE;
            }
            state.open_handle(caller.process, event).map(ProcessOpOutput::Handle)
        }
        ProcessOp::SignalOnExit => {
            let process = state.process_mut(pid).ok_or(KernelError::InvalidHandle)?;
            process.flags |= ProcessFlags::SIGNAL_ON_EXIT;
            Ok(ProcessOpOutput::Done)
        }
        ProcessOp::GetPaFromVa { va } => state.translate(pid, va).map(ProcessOpOutput::PhysicalAddress),
        ProcessOp::ScheduleThreads { mode, predicate } => {
            let report = match mode {
                ScheduleMode::Lock => lock_threads(state, caller, pid, predicate),
                ScheduleMode::Unlock => unlock_threads(state, pid, predicate),
            };
            Ok(ProcessOpOutput::Schedule(report))
        }
    }
}

fn get_all_handles(
    state: &KernelState,
    pid: ProcessId,
    class: Option<ObjectClass>,
) -> Result<ProcessOpOutput, KernelError> {
    let process = state.process(pid).ok_or(KernelError::InvalidHandle)?;
    let handles = process
        .handles
        .entries()
        .filter(|&(_, object)| match class {
            None => true,
            Some(c) => state.object(object).map(|o| o.class() == c).unwrap_or(false),
        })
        .map(|(h, _)| h)
        .collect();
    Ok(ProcessOpOutput::Handles(handles))
}

/// Matching, non-terminating threads of `pid`, in global list order.
fn matching_threads(
    state: &KernelState,
    pid: ProcessId,
    predicate: Option<&dyn ThreadPredicate>,
    report: &mut ScheduleReport,
) -> Vec<ThreadId> {
    let mut out = Vec::new();
    for thread in state.threads.values().filter(|t| t.owner == pid) {
        if thread.mask.is_terminating() {
            report.skipped_terminating += 1;
            continue;
        }
        if predicate.map_or(true, |p| p.matches(&ThreadView::from(thread))) {
            out.push(thread.id);
        }
    }
    out
}

fn unlock_threads(
    state: &mut KernelState,
    pid: ProcessId,
    predicate: Option<&dyn ThreadPredicate>,
) -> ScheduleReport {
    let mut report = ScheduleReport::default();
    for tid in matching_threads(state, pid, predicate, &mut report) {
        // Re-admission is picked up by each core's next tick
        if state.clear_plugin_lock(tid) {
            report.unlocked.push(tid);
        }
    }
    report
}

fn lock_threads(
    state: &mut KernelState,
    caller: &Caller,
    pid: ProcessId,
    predicate: Option<&dyn ThreadPredicate>,
) -> ScheduleReport {
    let mut report = ScheduleReport::default();
    let targets = matching_threads(state, pid, predicate, &mut report);
    let mut current_found = false;

    // Pass 1: everything not executing right now
    for &tid in &targets {
        if state.running_core(tid).is_some() {
            current_found = true;
            continue;
        }
        if state.sync_mutex_owner == Some(tid) {
            continue;
        }
        if state.set_plugin_lock(tid) {
            report.locked.push(tid);
        }
    }

    if !current_found {
        return report;
    }

    // Pass 2: threads executing on some core
    let mut self_locked = false;
    for &tid in &targets {
        if state.sync_mutex_owner == Some(tid) {
            continue;
        }
        let Some(home) = state.thread(tid).map(|t| t.core) else {
            continue;
        };
        if !state.set_plugin_lock(tid) {
            continue;
        }
        report.locked.push(tid);
        if home != caller.core {
            state.raise_ipi(caller.core);
            state.raise_ipi(home);
        } else if state.running_core(tid) == Some(home) {
            self_locked = true;
        }
    }
    report.interrupted = state.deliver_cross_core_interrupts();
    if self_locked {
        state.reschedule(caller.core);
    }
    report
}
