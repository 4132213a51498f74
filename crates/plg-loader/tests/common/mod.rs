//! Shared fixture: a HAL backed by a real kernel model.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use plg_hal::{Hal, HalError, PluginMenu};
use plg_kernel_core::{
    Caller, CoreId, Handle, Kernel, MemoryPermissions, ObjectClass, ProcessId, ProcessOp, ProcessOpOutput,
    ScheduleMode, ScheduleReport, ThreadId, ThreadPredicate, ThreadState, PAGE_SIZE,
};
use plg_loader::{LoaderConfig, MemorySwapStore, PluginLoader, PLUGIN_THREAD_TAG, PLUGIN_THREAD_TLS_SLOT};

pub const HOST_TITLE_ID: u64 = 0x0004_0000_0005_5D00;
pub const PLUGIN_VA: u32 = 0x0700_0000;
const PLUGIN_PA: u32 = 0x2800_0000;

pub type Loader = PluginLoader<MockHal, MemorySwapStore>;

/// HAL whose kernel side is a `plg_kernel_core::Kernel`.
///
/// The arbiter is a condvar over the watched words; UI calls and published
/// notifications are captured for assertions.
pub struct MockHal {
    pub kernel: Kernel,
    pub caller: Caller,
    pub host: ProcessId,
    cores: u8,
    status: AtomicU32,
    epoch: Instant,
    arbiter_lock: Mutex<()>,
    arbiter_cv: Condvar,
    enabled_at_boot: AtomicBool,
    pub plugin_threads: AtomicUsize,
    pub image_len: AtomicUsize,
    pub available: Mutex<BTreeSet<String>>,
    pub injected: Mutex<Vec<(String, Vec<u32>)>>,
    pub log: Mutex<Vec<String>>,
    pub errors_shown: Mutex<Vec<(String, u32, String)>>,
    pub messages_shown: Mutex<Vec<(String, String)>>,
    pub published: Mutex<Vec<u32>>,
    pub flashes: AtomicUsize,
    pub saves: AtomicUsize,
    pub icache_flushes: AtomicUsize,
    /// When set, `display_menu` flips every entry state
    pub menu_toggles: AtomicBool,
    pub last_menu: Mutex<Option<PluginMenu>>,
    pub signals: AtomicI32,
}

impl MockHal {
    pub fn new(cores: u8) -> Self {
        let kernel = Kernel::new(cores);
        let (caller, host) = kernel.with_state(|s| {
            let loader = s.create_process("plgldr", 0x0004_0130_0000_1002);
            let thread = s.create_thread(loader, CoreId(0)).unwrap();
            let host = s.create_process("host", HOST_TITLE_ID);
            (Caller { process: loader, thread, core: CoreId(0) }, host)
        });
        let hal = Self {
            kernel,
            caller,
            host,
            cores,
            status: AtomicU32::new(0),
            epoch: Instant::now(),
            arbiter_lock: Mutex::new(()),
            arbiter_cv: Condvar::new(),
            enabled_at_boot: AtomicBool::new(true),
            plugin_threads: AtomicUsize::new(2),
            image_len: AtomicUsize::new(0x3000),
            available: Mutex::new(BTreeSet::new()),
            injected: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            errors_shown: Mutex::new(Vec::new()),
            messages_shown: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            flashes: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            icache_flushes: AtomicUsize::new(0),
            menu_toggles: AtomicBool::new(false),
            last_menu: Mutex::new(None),
            signals: AtomicI32::new(0),
        };
        hal.make_available(&default_plugin_path());
        hal
    }

    pub fn set_enabled_at_boot(&self, enabled: bool) {
        self.enabled_at_boot.store(enabled, Ordering::Release);
    }

    pub fn make_available(&self, path: &str) {
        self.available.lock().unwrap().insert(path.to_string());
    }

    pub fn make_unavailable(&self, path: &str) {
        self.available.lock().unwrap().remove(path);
    }

    /// A fresh handle to the host process in the loader's table.
    pub fn open_host(&self) -> Handle {
        let (loader, host) = (self.caller.process, self.host);
        self.kernel.with_state(|s| s.open_process_handle(loader, host).unwrap())
    }

    /// A host thread that is not part of the plugin.
    pub fn spawn_host_thread(&self, core: u8) -> ThreadId {
        let host = self.host;
        self.kernel.with_state(|s| {
            let t = s.create_thread(host, CoreId(core)).unwrap();
            s.set_thread_state(t, ThreadState::Runnable).unwrap();
            t
        })
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        let host = self.host;
        self.kernel.with_state(|s| s.threads_of(host).collect())
    }

    pub fn plugin_thread_ids(&self) -> Vec<ThreadId> {
        let host = self.host;
        self.kernel.with_state(|s| {
            let ids: Vec<ThreadId> = s.threads_of(host).collect();
            ids.into_iter()
                .filter(|t| s.thread(*t).map(|th| th.tls[PLUGIN_THREAD_TLS_SLOT]) == Some(PLUGIN_THREAD_TAG))
                .collect()
        })
    }

    pub fn is_locked(&self, t: ThreadId) -> bool {
        self.kernel.with_state(|s| s.thread(t).unwrap().mask.is_plugin_locked())
    }

    pub fn is_mapped(&self) -> bool {
        let host = self.host;
        self.kernel.with_state(|s| s.translate(host, PLUGIN_VA).is_ok())
    }

    pub fn host_ref_count(&self) -> u32 {
        let host = self.host;
        self.kernel.with_state(|s| s.process_ref_count(host).unwrap())
    }

    pub fn post_event(&self, event: u32) {
        let word = self.status.load(Ordering::Acquire);
        self.status.store((word & plg_ipc::status::STATE_MASK) | event, Ordering::Release);
    }

    pub fn status_word(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn log_contains(&self, needle: &str) -> bool {
        self.log.lock().unwrap().iter().any(|l| l.contains(needle))
    }

    fn with_host<R>(&self, target: Handle, f: impl FnOnce(&mut plg_kernel_core::KernelState, ProcessId) -> R) -> Result<R, HalError> {
        let loader = self.caller.process;
        self.kernel.with_state(|s| -> Result<R, HalError> {
            let pid = s.acquire_process(loader, target)?;
            let out = f(s, pid);
            s.release_process(pid);
            Ok(out)
        })
    }
}

impl Hal for MockHal {
    fn schedule_threads(
        &self,
        target: Handle,
        mode: ScheduleMode,
        predicate: &dyn ThreadPredicate,
    ) -> Result<ScheduleReport, HalError> {
        let op = ProcessOp::ScheduleThreads { mode, predicate: Some(predicate) };
        match self.kernel.control_process(self.caller, target, op)? {
            ProcessOpOutput::Schedule(report) => Ok(report),
            _ => Err(HalError::InvalidArgument),
        }
    }

    fn close_handle(&self, handle: Handle) -> Result<(), HalError> {
        Ok(self.kernel.close_handle(self.caller.process, handle)?)
    }

    fn process_title_id(&self, target: Handle) -> Result<u64, HalError> {
        Ok(self.kernel.title_id(self.caller.process, target)?)
    }

    fn create_address_arbiter(&self) -> Result<Handle, HalError> {
        let loader = self.caller.process;
        Ok(self.kernel.with_state(|s| s.create_object(loader, ObjectClass::AddressArbiter))?)
    }

    fn create_lifecycle_event(&self) -> Result<Handle, HalError> {
        let loader = self.caller.process;
        Ok(self.kernel.with_state(|s| s.create_object(loader, ObjectClass::Event))?)
    }

    fn loader_enabled_at_boot(&self) -> bool {
        self.enabled_at_boot.load(Ordering::Acquire)
    }

    fn read_status_word(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    fn write_status_word(&self, value: u32) {
        self.status.store(value, Ordering::Release);
    }

    fn arbiter_signal(&self, _arbiter: Handle, _word: &AtomicI32, _count: i32) -> Result<(), HalError> {
        let _guard = self.arbiter_lock.lock().unwrap();
        self.signals.fetch_add(1, Ordering::AcqRel);
        self.arbiter_cv.notify_all();
        Ok(())
    }

    fn arbiter_wait_if_less_than(
        &self,
        _arbiter: Handle,
        word: &AtomicI32,
        value: i32,
        timeout_ns: u64,
    ) -> Result<(), HalError> {
        let deadline = Instant::now() + Duration::from_nanos(timeout_ns);
        let mut guard = self.arbiter_lock.lock().unwrap();
        loop {
            if word.load(Ordering::Acquire) >= value {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HalError::Timeout);
            }
            guard = self.arbiter_cv.wait_timeout(guard, deadline - now).unwrap().0;
        }
    }

    fn inject_plugin(&self, target: Handle, path: &str, config: &[u32]) -> Result<Vec<u8>, HalError> {
        if !self.available.lock().unwrap().contains(path) {
            return Err(HalError::NotFound);
        }
        let count = self.plugin_threads.load(Ordering::Acquire);
        let cores = self.cores;
        self.with_host(target, |s, pid| -> Result<(), HalError> {
            for i in 0..count {
                let t = s.create_thread(pid, CoreId((i % usize::from(cores)) as u8))?;
                s.set_tls(t, PLUGIN_THREAD_TLS_SLOT, PLUGIN_THREAD_TAG)?;
                s.set_thread_state(t, ThreadState::Runnable)?;
            }
            Ok(())
        })??;
        self.injected.lock().unwrap().push((path.to_string(), config.to_vec()));
        let len = self.image_len.load(Ordering::Acquire);
        Ok((0..len).map(|i| (i % 251) as u8).collect())
    }

    fn map_plugin_memory(&self, target: Handle, len: usize) -> Result<(), HalError> {
        self.with_host(target, |s, pid| -> Result<(), HalError> {
            for page in 0..len.div_ceil(PAGE_SIZE as usize) as u32 {
                let off = page * PAGE_SIZE;
                s.map_page(pid, PLUGIN_VA + off, PLUGIN_PA + off, MemoryPermissions::RWX)?;
            }
            Ok(())
        })?
    }

    fn unmap_plugin_memory(&self, target: Handle, len: usize) -> Result<(), HalError> {
        self.with_host(target, |s, pid| -> Result<(), HalError> {
            for page in 0..len.div_ceil(PAGE_SIZE as usize) as u32 {
                s.unmap_page(pid, PLUGIN_VA + page * PAGE_SIZE)?;
            }
            Ok(())
        })?
    }

    fn invalidate_instruction_cache(&self) {
        self.icache_flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn flash_load_indicator(&self) {
        self.flashes.fetch_add(1, Ordering::AcqRel);
    }

    fn display_menu(&self, menu: &mut PluginMenu) -> Result<(), HalError> {
        if self.menu_toggles.load(Ordering::Acquire) {
            for entry in &mut menu.entries {
                entry.state ^= 1;
            }
        }
        *self.last_menu.lock().unwrap() = Some(menu.clone());
        Ok(())
    }

    fn display_message(&self, title: &str, body: &str) {
        self.messages_shown.lock().unwrap().push((title.to_string(), body.to_string()));
    }

    fn display_error(&self, title: &str, code: u32, body: &str) {
        self.errors_shown.lock().unwrap().push((title.to_string(), code, body.to_string()));
    }

    fn request_save_settings(&self) {
        self.saves.fetch_add(1, Ordering::AcqRel);
    }

    fn publish_notification(&self, id: u32) {
        self.published.lock().unwrap().push(id);
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn debug_write(&self, msg: &str) {
        self.log.lock().unwrap().push(msg.to_string());
    }
}

pub fn default_plugin_path() -> String {
    format!("{}/default.plg", plg_loader::config::DEFAULT_PLUGIN_ROOT)
}

pub fn title_plugin_path() -> String {
    format!("{}/{:016X}/plugin.plg", plg_loader::config::DEFAULT_PLUGIN_ROOT, HOST_TITLE_ID)
}

/// Short handshake timeout so timeout paths stay fast.
pub fn test_config() -> LoaderConfig {
    LoaderConfig { handshake_timeout_ms: 50, ..LoaderConfig::default() }
}

pub fn setup(cores: u8) -> (Arc<MockHal>, Arc<MemorySwapStore>, Arc<Loader>) {
    let hal = Arc::new(MockHal::new(cores));
    let store = Arc::new(MemorySwapStore::new());
    let loader = Arc::new(PluginLoader::init(hal.clone(), store.clone(), test_config()).unwrap());
    (hal, store, loader)
}

pub fn assert_all_invariants(hal: &MockHal, loader: &Loader) {
    let kernel = hal.kernel.check_invariants();
    assert!(kernel.is_empty(), "kernel invariants violated: {kernel:?}");
    let ours = loader.check_invariants();
    assert!(ours.is_empty(), "loader invariants violated: {ours:?}");
}

/// Run the plugin side of one handshake on another thread: wait for an
/// event, acknowledge it and return it.
pub fn plugin_acknowledges_once(hal: Arc<MockHal>, loader: Arc<Loader>) -> std::thread::JoinHandle<i32> {
    std::thread::spawn(move || {
        let arbiter = loader.arbiter();
        let event = loader
            .handshake()
            .plugin_wait_event(hal.as_ref(), arbiter, 5_000_000_000)
            .expect("no event posted");
        loader.handshake().plugin_reply(hal.as_ref(), arbiter).unwrap();
        event
    })
}

/// Swap settings that fit the default image.
pub fn configure_swap(loader: &Arc<Loader>) -> plg_loader::IpcResponse {
    let service = plg_loader::LoaderService::new(loader.clone());
    service.handle_request(swap_request(0x0010_0000, 0x0010_0400, 0x10_0000, "/luma/plugins/host.swp"))
}

pub fn swap_request(save: u32, load: u32, bound: u32, filename: &str) -> plg_loader::IpcRequest {
    let mut name = filename.as_bytes().to_vec();
    name.push(0);
    plg_loader::IpcRequest::new(
        plg_ipc::command::REQ_SET_SWAP_PARAMS,
        vec![save, load],
        vec![
            plg_loader::IpcDescriptor::Buffer(bound.to_le_bytes().to_vec()),
            plg_loader::IpcDescriptor::Buffer(name),
        ],
    )
}
