//! Deferred lifecycle work.
//!
//! The notification handler must release the kernel before the plugin is
//! torn down; teardown is queued here and drained once `LIFECYCLE_HANDLED`
//! has been published, after every command, and at the start of each load.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use plg_kernel_core::Handle;

/// Work queued by the notification handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferredTask {
    /// Release the plugin after its host announced exit
    TeardownAfterExit { target: Handle },
}

/// FIFO of pending tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: VecDeque<DeferredTask>,
}

impl TaskQueue {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Queue `task`; an identical pending task is not queued twice.
    pub fn push(&mut self, task: DeferredTask) -> bool {
        if self.entries.contains(&task) {
            return false;
        }
        self.entries.push_back(task);
        true
    }

    /// Take every pending task, oldest first.
    pub fn drain(&mut self) -> Vec<DeferredTask> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_in_order_and_empty() {
        let mut q = TaskQueue::new();
        assert!(q.push(DeferredTask::TeardownAfterExit { target: Handle(1) }));
        assert!(q.push(DeferredTask::TeardownAfterExit { target: Handle(2) }));
        let tasks = q.drain();
        assert_eq!(tasks[0], DeferredTask::TeardownAfterExit { target: Handle(1) });
        assert_eq!(tasks.len(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_duplicate_teardown_not_queued() {
        let mut q = TaskQueue::new();
        assert!(q.push(DeferredTask::TeardownAfterExit { target: Handle(1) }));
        assert!(!q.push(DeferredTask::TeardownAfterExit { target: Handle(1) }));
        assert_eq!(q.len(), 1);
    }
}
