//! Plugin lifecycle controller
//!
//! `PluginLoader` owns every piece of loader state and drives the single
//! plugin slot through its lifecycle:
//!
//! ```text
//!            load (enabled, injected)
//!   ┌──────┐ ─────────────────────────▶ ┌─────────┐  SWAP_EVENT  ┌─────────┐
//!   │ NONE │                            │ RUNNING │ ───────────▶ │ SWAPPED │
//!   └──────┘ ◀── deferred teardown ──── └─────────┘ ◀─────────── └─────────┘
//!       ▲            (EXIT_EVENT)                     SWAP_EVENT       │
//!       └──────────────────── deferred teardown (EXIT_EVENT) ──────────┘
//! ```
//!
//! Transitions are driven by the kernel through the shared status word; the
//! controller consumes the event bits and writes back the new state.
//!
//! Lock order: `ctx` before `journal`. `tasks` is never held with either.
//! Handshake waits run with no lock held.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use plg_hal::{Hal, HalError, SwapStore};
use plg_ipc::handshake::{PLG_ABOUT_TO_EXIT, PLG_ABOUT_TO_SWAP, PLG_OK};
use plg_ipc::status::{self, PLG_CFG_EXIT_EVENT, PLG_CFG_NONE, PLG_CFG_SWAP_EVENT};
use plg_ipc::ResultCode;
use plg_kernel_core::{Handle, InvariantViolation, ScheduleMode};

use crate::config::LoaderConfig;
use crate::error::LoaderError;
use crate::handshake::{Ack, Handshake};
use crate::journal::{HandshakeKind, LifecycleEvent, LifecycleJournal, LifecycleRecord, PluginState};
use crate::memory_block::{BlockState, PluginMemoryBlock};
use crate::params::{ExeLoadParams, PluginLoadParameters};
use crate::predicate::PluginThreadPredicate;
use crate::tasks::{DeferredTask, TaskQueue};

/// Plugin file inside a per-title directory.
const PLUGIN_FILE_NAME: &str = "plugin.plg";

/// Plugin used when no per-title plugin exists.
const DEFAULT_PLUGIN_NAME: &str = "default.plg";

const ERROR_TITLE: &str = "Plugin loader";

/// An error shown to the user once the current command completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingError {
    pub title: String,
    pub code: ResultCode,
    pub body: String,
}

/// Mutable loader state, guarded by `PluginLoader::ctx`.
pub struct LoaderContext {
    pub(crate) enabled: bool,
    /// Host process; `Handle::NULL` when no plugin is loaded
    pub(crate) target: Handle,
    pub(crate) state: PluginState,
    pub(crate) params: PluginLoadParameters,
    pub(crate) has_params: bool,
    pub(crate) plugin_path: String,
    pub(crate) memory: PluginMemoryBlock,
    pub(crate) exe_load: ExeLoadParams,
    pub(crate) arbiter: Handle,
    pub(crate) lifecycle_event: Handle,
    pub(crate) pending_error: Option<PendingError>,
    /// Exit seen, teardown queued
    pub(crate) exit_pending: bool,
}

/// The loader service.
pub struct PluginLoader<H: Hal, S: SwapStore> {
    hal: Arc<H>,
    swap_store: Arc<S>,
    config: LoaderConfig,
    ctx: spin::Mutex<LoaderContext>,
    handshake: Handshake,
    ui_blocked: AtomicBool,
    journal: spin::Mutex<LifecycleJournal>,
    tasks: spin::Mutex<TaskQueue>,
}

impl<H: Hal, S: SwapStore> PluginLoader<H, S> {
    /// Create the arbiter and lifecycle event and read the boot-time enabled
    /// flag.
    pub fn init(hal: Arc<H>, swap_store: Arc<S>, config: LoaderConfig) -> Result<Self, LoaderError> {
        let arbiter = hal.create_address_arbiter()?;
        let lifecycle_event = match hal.create_lifecycle_event() {
            Ok(h) => h,
            Err(e) => {
                let _ = hal.close_handle(arbiter);
                return Err(e.into());
            }
        };
        let enabled = hal.loader_enabled_at_boot();
        let mut memory = PluginMemoryBlock::new(&config.default_swap_filename);
        memory.reset_swap_settings();
        hal.write_status_word(PLG_CFG_NONE);
        hal.debug_write(&alloc::format!(
            "[plgldr] init: enabled={} arbiter={:#x} event={:#x}",
            enabled,
            arbiter.0,
            lifecycle_event.0
        ));

        Ok(Self {
            ctx: spin::Mutex::new(LoaderContext {
                enabled,
                target: Handle::NULL,
                state: PluginState::None,
                params: PluginLoadParameters::default(),
                has_params: false,
                plugin_path: String::new(),
                memory,
                exe_load: ExeLoadParams::default(),
                arbiter,
                lifecycle_event,
                pending_error: None,
                exit_pending: false,
            }),
            journal: spin::Mutex::new(LifecycleJournal::new(config.journal_capacity)),
            handshake: Handshake::new(),
            ui_blocked: AtomicBool::new(false),
            tasks: spin::Mutex::new(TaskQueue::new()),
            hal,
            swap_store,
            config,
        })
    }

    /// Release the loaded plugin (if any) and the loader's own handles.
    pub fn shutdown(&self) -> Result<(), LoaderError> {
        self.run_pending_tasks();
        let target = self.ctx.lock().target;
        if !target.is_null() {
            self.teardown(target);
        }
        let (arbiter, event) = {
            let mut ctx = self.ctx.lock();
            let handles = (ctx.arbiter, ctx.lifecycle_event);
            ctx.arbiter = Handle::NULL;
            ctx.lifecycle_event = Handle::NULL;
            handles
        };
        for handle in [arbiter, event] {
            if !handle.is_null() {
                self.hal.close_handle(handle)?;
            }
        }
        self.hal.debug_write("[plgldr] shutdown");
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn hal(&self) -> &Arc<H> {
        &self.hal
    }

    pub fn swap_store(&self) -> &Arc<S> {
        &self.swap_store
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn state(&self) -> PluginState {
        self.ctx.lock().state
    }

    pub fn target(&self) -> Handle {
        self.ctx.lock().target
    }

    pub fn is_enabled(&self) -> bool {
        self.ctx.lock().enabled
    }

    pub fn arbiter(&self) -> Handle {
        self.ctx.lock().arbiter
    }

    pub fn lifecycle_event(&self) -> Handle {
        self.ctx.lock().lifecycle_event
    }

    pub fn plugin_path(&self) -> String {
        self.ctx.lock().plugin_path.clone()
    }

    pub fn exe_load_params(&self) -> ExeLoadParams {
        self.ctx.lock().exe_load.clone()
    }

    pub fn memory_state(&self) -> BlockState {
        self.ctx.lock().memory.state()
    }

    pub fn is_ui_blocked(&self) -> bool {
        self.ui_blocked.load(Ordering::Acquire)
    }

    pub fn set_ui_blocked(&self, blocked: bool) {
        self.ui_blocked.store(blocked, Ordering::Release);
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn journal_records(&self) -> Vec<LifecycleRecord> {
        self.journal.lock().records().to_vec()
    }

    pub fn journal_json(&self) -> Result<String, serde_json::Error> {
        self.journal.lock().to_json()
    }

    /// Run `f` on the plugin's memory region, if one is resident.
    pub fn with_plugin_memory<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut ctx = self.ctx.lock();
        ctx.memory.data_mut().map(f)
    }

    pub(crate) fn with_context<R>(&self, f: impl FnOnce(&mut LoaderContext) -> R) -> R {
        f(&mut self.ctx.lock())
    }

    pub(crate) fn record(&self, kind: LifecycleEvent) {
        let now = self.hal.now_nanos();
        self.journal.lock().record(now, kind);
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Set the enabled flag, persisting it when it changes.
    pub fn set_enabled(&self, enabled: bool) {
        let changed = {
            let mut ctx = self.ctx.lock();
            let changed = ctx.enabled != enabled;
            ctx.enabled = enabled;
            changed
        };
        if changed {
            self.hal.request_save_settings();
        }
    }

    /// Flip the enabled flag (menu toggle). Returns the new value.
    pub fn toggle_enabled(&self) -> bool {
        let enabled = {
            let mut ctx = self.ctx.lock();
            ctx.enabled = !ctx.enabled;
            ctx.enabled
        };
        self.hal.request_save_settings();
        self.hal.debug_write(&alloc::format!("[plgldr] enabled={}", enabled));
        enabled
    }

    /// Show and clear the pending user-visible error.
    pub fn display_pending_error(&self) {
        let pending = self.ctx.lock().pending_error.take();
        if let Some(err) = pending {
            self.hal.display_error(&err.title, err.code, &err.body);
        }
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Inject the plugin into `target` and bring the slot to RUNNING.
    ///
    /// `target` is owned by the loader from here on: it is closed on every
    /// path that does not end in RUNNING.
    pub fn load(&self, target: Handle) -> Result<(), LoaderError> {
        self.run_pending_tasks();

        let mut ctx = self.ctx.lock();
        if ctx.state != PluginState::None {
            drop(ctx);
            self.hal.debug_write("[plgldr] load refused: a plugin is already loaded");
            let _ = self.hal.close_handle(target);
            return Err(LoaderError::InvalidState);
        }
        if !ctx.enabled {
            drop(ctx);
            self.hal.close_handle(target)?;
            return Ok(());
        }

        self.handshake.set_event(PLG_OK);
        ctx.target = target;

        match self.inject(&mut ctx, target) {
            Ok(no_flash) => {
                if self.config.flash_indicator && !no_flash {
                    self.hal.flash_load_indicator();
                }
                let size = ctx.memory.len();
                let path = ctx.plugin_path.clone();
                self.transition(&mut ctx, PluginState::Running);
                drop(ctx);
                self.hal.debug_write(&alloc::format!(
                    "[plgldr] loaded {} ({:#x} bytes) into {:#x}",
                    path,
                    size,
                    target.0
                ));
                self.record(LifecycleEvent::Loaded { target, path, size });
                Ok(())
            }
            Err(e) => {
                let code = e.result_code();
                let _ = ctx.memory.discard();
                ctx.target = Handle::NULL;
                let path = ctx.plugin_path.clone();
                ctx.pending_error = Some(PendingError {
                    title: String::from(ERROR_TITLE),
                    code,
                    body: alloc::format!("Cannot load plugin from\n{}", path),
                });
                drop(ctx);
                let _ = self.hal.close_handle(target);
                self.hal.debug_write(&alloc::format!(
                    "[plgldr] load of {} failed: {:#010x}",
                    path,
                    code
                ));
                self.record(LifecycleEvent::LoadFailed { path, code });
                Err(LoaderError::LoadFailed)
            }
        }
    }

    /// Resolve the plugin path, inject and mount. Returns the no-flash flag
    /// of the parameters that were used.
    fn inject(&self, ctx: &mut LoaderContext, target: Handle) -> Result<bool, LoaderError> {
        let title_id = self.hal.process_title_id(target)?;

        let (candidates, config, no_flash) = if ctx.has_params && ctx.params.applies_to(title_id) {
            let params = core::mem::take(&mut ctx.params);
            ctx.has_params = false;
            (alloc::vec![params.path], params.config, params.no_flash)
        } else {
            let root = self.config.plugin_root.trim_end_matches('/');
            (
                alloc::vec![
                    alloc::format!("{}/{:016X}/{}", root, title_id, PLUGIN_FILE_NAME),
                    alloc::format!("{}/{}", root, DEFAULT_PLUGIN_NAME),
                ],
                Vec::new(),
                false,
            )
        };

        let mut last_err = HalError::NotFound;
        for path in candidates {
            ctx.plugin_path = path;
            match self.hal.inject_plugin(target, &ctx.plugin_path, &config) {
                Ok(image) => {
                    ctx.memory.allocate(image)?;
                    ctx.memory.mount_in_process(self.hal.as_ref(), target)?;
                    return Ok(no_flash);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err.into())
    }

    // ========================================================================
    // Lifecycle notifications
    // ========================================================================

    /// Consume the event posted in the status word and run its transition.
    ///
    /// Always publishes `LIFECYCLE_HANDLED` afterwards, then runs whatever
    /// the transition deferred (teardown after exit).
    pub fn handle_lifecycle_notification(&self) -> Result<(), LoaderError> {
        let word = self.hal.read_status_word();
        self.hal.write_status_word(word & status::STATE_MASK);

        let result = match status::event_of(word) {
            0 => Ok(()),
            PLG_CFG_EXIT_EVENT => self.on_exit_event(word),
            PLG_CFG_SWAP_EVENT => self.on_swap_event(word),
            _ => self.unexpected(word),
        };

        self.hal.publish_notification(plg_ipc::notification::LIFECYCLE_HANDLED);
        // The kernel is released; run the deferred work now.
        self.run_pending_tasks();
        result
    }

    fn unexpected(&self, word: u32) -> Result<(), LoaderError> {
        self.hal.debug_write(&alloc::format!(
            "[plgldr] unexpected notification, status word {:#010x}",
            word
        ));
        self.record(LifecycleEvent::UnexpectedNotification { status: word });
        Err(LoaderError::UnexpectedNotification)
    }

    fn on_exit_event(&self, word: u32) -> Result<(), LoaderError> {
        let (state, target, arbiter, exit_pending) = {
            let ctx = self.ctx.lock();
            (ctx.state, ctx.target, ctx.arbiter, ctx.exit_pending)
        };
        if state == PluginState::None {
            return self.unexpected(word);
        }
        if exit_pending {
            return Ok(());
        }

        // A swapped plugin has its threads held and cannot answer.
        if state == PluginState::Running {
            self.handshake_with_plugin(arbiter, PLG_ABOUT_TO_EXIT, HandshakeKind::Exit);
        }

        self.ctx.lock().exit_pending = true;
        self.tasks.lock().push(DeferredTask::TeardownAfterExit { target });
        self.record(LifecycleEvent::TeardownQueued { target });
        Ok(())
    }

    fn on_swap_event(&self, word: u32) -> Result<(), LoaderError> {
        let (state, arbiter, exit_pending) = {
            let ctx = self.ctx.lock();
            (ctx.state, ctx.arbiter, ctx.exit_pending)
        };
        if exit_pending {
            self.hal.debug_write("[plgldr:swap] host is exiting, swap ignored");
            return self.unexpected(word);
        }
        match state {
            PluginState::None => self.unexpected(word),
            PluginState::Running => {
                self.handshake_with_plugin(arbiter, PLG_ABOUT_TO_SWAP, HandshakeKind::Swap);
                self.swap_out();
                Ok(())
            }
            PluginState::Swapped => {
                if self.swap_in() {
                    if let Err(e) = self.handshake.notify(self.hal.as_ref(), arbiter, PLG_OK) {
                        self.hal.debug_write(&alloc::format!("[plgldr] resume signal failed: {:?}", e));
                    }
                }
                Ok(())
            }
        }
    }

    /// Post `event` and wait for the plugin. A timeout is recorded and
    /// otherwise treated like an acknowledgment.
    fn handshake_with_plugin(&self, arbiter: Handle, event: i32, kind: HandshakeKind) {
        let hal = self.hal.as_ref();
        let ack = self
            .handshake
            .notify(hal, arbiter, event)
            .and_then(|()| self.handshake.wait_for_reply(hal, arbiter, self.config.handshake_timeout_ns()));
        match ack {
            Ok(Ack::Acknowledged) => {}
            Ok(Ack::TimedOut) => {
                hal.debug_write(&alloc::format!("[plgldr] plugin did not acknowledge {:?}, proceeding", kind));
                self.record(LifecycleEvent::HandshakeTimeout { kind });
            }
            Err(e) => {
                hal.debug_write(&alloc::format!("[plgldr] handshake failed: {:?}, proceeding", e));
                self.record(LifecycleEvent::HandshakeTimeout { kind });
            }
        }
    }

    fn swap_out(&self) {
        let hal = self.hal.as_ref();
        let mut ctx = self.ctx.lock();
        let target = ctx.target;

        match hal.schedule_threads(target, ScheduleMode::Lock, &PluginThreadPredicate) {
            Ok(report) => hal.debug_write(&alloc::format!(
                "[plgldr:swap] locked {} threads, interrupted {} cores",
                report.locked.len(),
                report.interrupted.len()
            )),
            Err(e) => hal.debug_write(&alloc::format!("[plgldr:swap] lock failed: {:?}", e)),
        }

        if let Err(e) = ctx.memory.unmount_from_process(hal, target) {
            hal.debug_write(&alloc::format!("[plgldr:swap] unmount failed: {}", e));
        }

        match ctx.memory.to_swap_file(self.swap_store.as_ref()) {
            Ok(()) => {
                if let Err(e) = ctx.memory.free() {
                    hal.debug_write(&alloc::format!("[plgldr:swap] free failed: {}", e));
                }
            }
            Err(e) => {
                // Region stays resident (unmounted); swap-in will just remount.
                hal.debug_write(&alloc::format!("[plgldr:swap] swap-out failed: {}, keeping region", e));
                let code = LoaderError::from(e).result_code();
                self.transition(&mut ctx, PluginState::Swapped);
                drop(ctx);
                self.record(LifecycleEvent::SwapOutFailed { code });
                return;
            }
        }

        self.transition(&mut ctx, PluginState::Swapped);
    }

    /// Restore, remount and release the plugin threads. Returns false when
    /// the region could not be put back; the plugin then stays SWAPPED with
    /// its threads held, and the next swap event retries.
    fn swap_in(&self) -> bool {
        let hal = self.hal.as_ref();
        let mut ctx = self.ctx.lock();
        let target = ctx.target;

        let restored = if ctx.memory.is_swapped_out() {
            ctx.memory.from_swap_file(self.swap_store.as_ref())
        } else {
            Ok(())
        };
        let placed = restored.and_then(|()| ctx.memory.mount_in_process(hal, target));
        if let Err(e) = placed {
            hal.debug_write(&alloc::format!("[plgldr:swap] swap-in failed: {}, plugin stays swapped", e));
            let code = LoaderError::from(e).result_code();
            drop(ctx);
            self.record(LifecycleEvent::SwapInFailed { code });
            return false;
        }

        match hal.schedule_threads(target, ScheduleMode::Unlock, &PluginThreadPredicate) {
            Ok(report) => hal.debug_write(&alloc::format!(
                "[plgldr:swap] unlocked {} threads",
                report.unlocked.len()
            )),
            Err(e) => hal.debug_write(&alloc::format!("[plgldr:swap] unlock failed: {:?}", e)),
        }

        self.transition(&mut ctx, PluginState::Running);
        true
    }

    // ========================================================================
    // Deferred teardown
    // ========================================================================

    /// Run every queued task. Returns how many ran.
    pub fn run_pending_tasks(&self) -> usize {
        let tasks = self.tasks.lock().drain();
        let count = tasks.len();
        for task in tasks {
            match task {
                DeferredTask::TeardownAfterExit { target } => self.teardown(target),
            }
        }
        count
    }

    fn teardown(&self, target: Handle) {
        let hal = self.hal.as_ref();
        let mut ctx = self.ctx.lock();
        if ctx.target != target {
            hal.debug_write(&alloc::format!("[plgldr] stale teardown for {:#x}", target.0));
            return;
        }

        if ctx.memory.is_mounted() {
            if let Err(e) = ctx.memory.unmount_from_process(hal, target) {
                hal.debug_write(&alloc::format!("[plgldr] unmount on exit failed: {}", e));
            }
        }
        if let Err(e) = ctx.memory.discard() {
            hal.debug_write(&alloc::format!("[plgldr] free on exit failed: {}", e));
        }
        if let Err(e) = hal.close_handle(target) {
            hal.debug_write(&alloc::format!("[plgldr] close target failed: {:?}", e));
        }

        ctx.target = Handle::NULL;
        ctx.exit_pending = false;
        ctx.exe_load.reset();
        ctx.memory.reset_swap_settings();
        self.ui_blocked.store(false, Ordering::Release);
        self.handshake.set_event(PLG_OK);
        self.transition(&mut ctx, PluginState::None);
        drop(ctx);
        self.record(LifecycleEvent::TeardownDone { target });
    }

    /// Move to `to`, publish it in the status word and journal it.
    fn transition(&self, ctx: &mut LoaderContext, to: PluginState) {
        let from = ctx.state;
        ctx.state = to;
        self.hal.write_status_word(to.status_bits());
        self.journal.lock().record(self.hal.now_nanos(), LifecycleEvent::Transition { from, to });
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    /// Check the loader's invariants; empty when all hold.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let ctx = self.ctx.lock();
        let mut violations = Vec::new();

        if ctx.target.is_null() != (ctx.state == PluginState::None) {
            violations.push(InvariantViolation {
                invariant: "target_iff_loaded",
                description: alloc::format!("target {:#x} in state {:?}", ctx.target.0, ctx.state),
            });
        }

        let placement_ok = match ctx.state {
            PluginState::None => ctx.memory.state() == BlockState::Free,
            PluginState::Running => ctx.memory.is_mounted(),
            PluginState::Swapped => !ctx.memory.is_mounted(),
        };
        if !placement_ok {
            violations.push(InvariantViolation {
                invariant: "memory_placement",
                description: alloc::format!("block {:?} in state {:?}", ctx.memory.state(), ctx.state),
            });
        }

        let word = self.hal.read_status_word();
        if status::state_of(word) != ctx.state.status_bits() {
            violations.push(InvariantViolation {
                invariant: "status_word",
                description: alloc::format!("status word {:#010x} in state {:?}", word, ctx.state),
            });
        }

        violations
    }
}

impl<H: Hal, S: SwapStore> core::fmt::Debug for PluginLoader<H, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let ctx = self.ctx.lock();
        f.debug_struct("PluginLoader")
            .field("state", &ctx.state)
            .field("target", &ctx.target)
            .field("enabled", &ctx.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SwapSettings;
    use crate::testing::MemorySwapStore;
    use plg_hal::TestHal;

    fn loader(enabled: bool) -> PluginLoader<TestHal, MemorySwapStore> {
        let l = PluginLoader::init(Arc::new(TestHal::new()), Arc::new(MemorySwapStore::new()), LoaderConfig::default())
            .unwrap();
        l.set_enabled(enabled);
        l
    }

    fn post(l: &PluginLoader<TestHal, MemorySwapStore>, event: u32) {
        let word = l.hal().read_status_word();
        l.hal().write_status_word((word & status::STATE_MASK) | event);
    }

    #[test]
    fn test_load_reaches_running() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        assert_eq!(l.state(), PluginState::Running);
        assert_eq!(l.target(), Handle(5));
        assert_eq!(status::state_of(l.hal().read_status_word()), status::PLG_CFG_RUNNING);
        assert!(l.check_invariants().is_empty());
    }

    #[test]
    fn test_load_while_disabled_closes_and_stays_none() {
        let l = loader(false);
        assert_eq!(l.load(Handle(5)), Ok(()));
        assert_eq!(l.state(), PluginState::None);
        assert!(l.target().is_null());
        assert!(l.check_invariants().is_empty());
    }

    #[test]
    fn test_second_load_is_refused() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        assert_eq!(l.load(Handle(6)), Err(LoaderError::InvalidState));
        assert_eq!(l.target(), Handle(5));
    }

    #[test]
    fn test_exit_timeout_still_tears_down() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        post(&l, PLG_CFG_EXIT_EVENT);
        l.handle_lifecycle_notification().unwrap();
        assert_eq!(l.pending_tasks(), 0);
        assert!(l
            .journal_records()
            .iter()
            .any(|r| r.kind == LifecycleEvent::HandshakeTimeout { kind: HandshakeKind::Exit }));

        assert_eq!(l.state(), PluginState::None);
        assert!(l.target().is_null());
        assert_eq!(l.hal().read_status_word(), PLG_CFG_NONE);
        assert!(l.check_invariants().is_empty());
    }

    #[test]
    fn test_notification_in_none_is_rejected() {
        let l = loader(true);
        post(&l, PLG_CFG_SWAP_EVENT);
        assert_eq!(l.handle_lifecycle_notification(), Err(LoaderError::UnexpectedNotification));
        assert_eq!(l.state(), PluginState::None);
        assert_eq!(l.hal().read_status_word(), PLG_CFG_NONE);
    }

    #[test]
    fn test_swap_without_configuration_keeps_region() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        post(&l, PLG_CFG_SWAP_EVENT);
        l.handle_lifecycle_notification().unwrap();
        assert_eq!(l.state(), PluginState::Swapped);
        assert_eq!(l.memory_state(), BlockState::Resident { mounted: false });
        assert!(l.check_invariants().is_empty());

        post(&l, PLG_CFG_SWAP_EVENT);
        l.handle_lifecycle_notification().unwrap();
        assert_eq!(l.state(), PluginState::Running);
        assert_eq!(l.memory_state(), BlockState::Resident { mounted: true });
        assert_eq!(l.swap_store().reads(), 0);
    }

    #[test]
    fn test_configured_swap_round_trip() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        l.with_context(|ctx| {
            ctx.memory
                .set_swap_settings(SwapSettings::new(0x1000, 0x2000, 0x10_0000, "", "/swap").unwrap())
        });
        l.with_plugin_memory(|mem| mem[0] = 0xAB).unwrap();

        post(&l, PLG_CFG_SWAP_EVENT);
        l.handle_lifecycle_notification().unwrap();
        assert!(matches!(l.memory_state(), BlockState::SwappedOut { .. }));

        post(&l, PLG_CFG_SWAP_EVENT);
        l.handle_lifecycle_notification().unwrap();
        assert_eq!(l.with_plugin_memory(|mem| mem[0]), Some(0xAB));
        assert_eq!(
            l.journal_records().iter().filter(|r| matches!(r.kind, LifecycleEvent::Transition { .. })).count(),
            3
        );
    }

    #[test]
    fn test_load_drains_queued_teardown_first() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        l.with_context(|ctx| ctx.exit_pending = true);
        l.tasks.lock().push(DeferredTask::TeardownAfterExit { target: Handle(5) });

        l.load(Handle(6)).unwrap();
        assert_eq!(l.pending_tasks(), 0);
        assert_eq!(l.target(), Handle(6));
        assert!(l.check_invariants().is_empty());
    }

    #[test]
    fn test_swap_event_during_exit_is_ignored() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        l.with_context(|ctx| ctx.exit_pending = true);

        post(&l, PLG_CFG_SWAP_EVENT);
        assert_eq!(l.handle_lifecycle_notification(), Err(LoaderError::UnexpectedNotification));
        assert_eq!(l.state(), PluginState::Running);
        assert_eq!(l.memory_state(), BlockState::Resident { mounted: true });
        assert!(!l
            .journal_records()
            .iter()
            .any(|r| r.kind == LifecycleEvent::HandshakeTimeout { kind: HandshakeKind::Swap }));
    }

    #[test]
    fn test_failed_swap_in_stays_swapped() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        l.with_context(|ctx| {
            ctx.memory
                .set_swap_settings(SwapSettings::new(0x1000, 0x2000, 0x10_0000, "", "/swap").unwrap())
        });
        post(&l, PLG_CFG_SWAP_EVENT);
        l.handle_lifecycle_notification().unwrap();

        l.swap_store().set_fail_reads(true);
        post(&l, PLG_CFG_SWAP_EVENT);
        l.handle_lifecycle_notification().unwrap();
        assert_eq!(l.state(), PluginState::Swapped);
        assert!(l.memory_state() != BlockState::Resident { mounted: true });
        assert_ne!(l.handshake().event(), PLG_OK);
        assert!(l.check_invariants().is_empty());

        l.swap_store().set_fail_reads(false);
        post(&l, PLG_CFG_SWAP_EVENT);
        l.handle_lifecycle_notification().unwrap();
        assert_eq!(l.state(), PluginState::Running);
        assert_eq!(l.handshake().event(), PLG_OK);
    }

    #[test]
    fn test_toggle_flips_flag() {
        let l = loader(false);
        assert!(l.toggle_enabled());
        assert!(!l.toggle_enabled());
    }

    #[test]
    fn test_shutdown_releases_plugin() {
        let l = loader(true);
        l.load(Handle(5)).unwrap();
        l.shutdown().unwrap();
        assert_eq!(l.state(), PluginState::None);
        assert!(l.arbiter().is_null());
    }
}
