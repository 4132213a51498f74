//! Runtime-checkable kernel invariants
//!
//! Tests call `check_all_invariants` after every operation.
//!
//! # Invariants
//!
//! 1. **Thread Ownership**: every thread's owner is a live process and its
//!    home core exists
//! 2. **Queue Eligibility**: a queued thread is runnable, queued on its home
//!    core exactly once, and not executing anywhere
//! 3. **No Lost Threads**: a runnable thread is either queued or executing
//! 4. **Current Is Eligible**: a core only executes a runnable thread unless
//!    a cross-core interrupt is still pending for it
//! 5. **Reference Balance**: every object's count equals the handles that
//!    name it plus the references owned by the kernel itself

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::state::KernelState;
use crate::types::{CoreId, ObjectBody, ObjectId, ThreadId};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_thread_ownership(state));
    violations.extend(check_queue_eligibility(state));
    violations.extend(check_no_lost_threads(state));
    violations.extend(check_current_is_eligible(state));
    violations.extend(check_reference_balance(state));

    violations
}

/// Invariant 1
fn check_thread_ownership(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for thread in state.threads.values() {
        if !state.processes.contains_key(&thread.owner) {
            violations.push(InvariantViolation {
                invariant: "thread_ownership",
                description: alloc::format!(
                    "Thread {} owned by non-existent process {}",
                    thread.id.0,
                    thread.owner.0
                ),
            });
        }
        if state.core(thread.core).is_none() {
            violations.push(InvariantViolation {
                invariant: "thread_ownership",
                description: alloc::format!("Thread {} homed on missing core {}", thread.id.0, thread.core.0),
            });
        }
    }
    violations
}

/// Invariant 2
fn check_queue_eligibility(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut seen: BTreeMap<ThreadId, usize> = BTreeMap::new();

    for (i, core) in state.cores.iter().enumerate() {
        for &tid in &core.run_queue {
            *seen.entry(tid).or_default() += 1;
            let Some(thread) = state.thread(tid) else {
                violations.push(InvariantViolation {
                    invariant: "queue_eligibility",
                    description: alloc::format!("Core {} queues unknown thread {}", i, tid.0),
                });
                continue;
            };
            if !thread.mask.is_runnable() {
                violations.push(InvariantViolation {
                    invariant: "queue_eligibility",
                    description: alloc::format!(
                        "Thread {} queued on core {} with mask {:#06x}",
                        tid.0,
                        i,
                        thread.mask.0
                    ),
                });
            }
            if usize::from(thread.core.0) != i {
                violations.push(InvariantViolation {
                    invariant: "queue_eligibility",
                    description: alloc::format!(
                        "Thread {} homed on core {} but queued on core {}",
                        tid.0,
                        thread.core.0,
                        i
                    ),
                });
            }
            if state.running_core(tid).is_some() {
                violations.push(InvariantViolation {
                    invariant: "queue_eligibility",
                    description: alloc::format!("Thread {} is both queued and executing", tid.0),
                });
            }
        }
    }

    for (tid, count) in seen {
        if count > 1 {
            violations.push(InvariantViolation {
                invariant: "queue_eligibility",
                description: alloc::format!("Thread {} queued {} times", tid.0, count),
            });
        }
    }
    violations
}

/// Invariant 3
fn check_no_lost_threads(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for thread in state.threads.values() {
        if !thread.mask.is_runnable() || state.running_core(thread.id).is_some() {
            continue;
        }
        let queued = state
            .core(thread.core)
            .map(|c| c.run_queue.contains(&thread.id))
            .unwrap_or(false);
        if !queued {
            violations.push(InvariantViolation {
                invariant: "no_lost_threads",
                description: alloc::format!("Runnable thread {} is neither queued nor executing", thread.id.0),
            });
        }
    }
    violations
}

/// Invariant 4
fn check_current_is_eligible(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (i, core) in state.cores.iter().enumerate() {
        let Some(tid) = core.current else {
            continue;
        };
        let runnable = state.thread(tid).map(|t| t.mask.is_runnable()).unwrap_or(false);
        if !runnable && !core.ipi_pending {
            violations.push(InvariantViolation {
                invariant: "current_is_eligible",
                description: alloc::format!(
                    "Core {} executes ineligible thread {} with no reschedule pending",
                    CoreId(i as u8).0,
                    tid.0
                ),
            });
        }
    }
    violations
}

/// Invariant 5
fn check_reference_balance(state: &KernelState) -> Vec<InvariantViolation> {
    let mut expected: BTreeMap<ObjectId, u32> = BTreeMap::new();

    for process in state.processes.values() {
        for (_, object) in process.handles.entries() {
            *expected.entry(object).or_default() += 1;
        }
        if let Some(event) = process.memory_change_event {
            *expected.entry(event).or_default() += 1;
        }
    }
    for (id, object) in &state.objects {
        // A process not yet reaped holds its own reference
        if let ObjectBody::Process(pid) = object.body {
            if state.processes.get(&pid).map(|p| !p.reaped).unwrap_or(false) {
                *expected.entry(*id).or_default() += 1;
            }
        }
    }

    let mut violations = Vec::new();
    for (id, object) in &state.objects {
        let want = expected.get(id).copied().unwrap_or(0);
        if object.ref_count != want {
            violations.push(InvariantViolation {
                invariant: "reference_balance",
                description: alloc::format!(
                    "Object {} has {} references, expected {}",
                    id.0,
                    object.ref_count,
                    want
                ),
            });
        }
    }
    violations
}
