//! Module lifecycle
//!
//! A session brings its shim modules up in the configured order before the
//! engine, and releases them in the same order after the engine shuts down.
//! The shims keep a shared [`ShimLedger`] of what the session holds.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::session::SessionState;
use crate::{Error, Result};

/// Built-in shim modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Processor enumeration
    Smp,
    /// Page allocation and pinning accounting
    Allocator,
    /// File-object accounting for VM and VCPU descriptors
    File,
}

impl ModuleKind {
    fn instantiate(self) -> Box<dyn LifecycleModule> {
        match self {
            ModuleKind::Smp => Box::new(SmpShim),
            ModuleKind::Allocator => Box::new(AllocatorShim),
            ModuleKind::File => Box::new(FileShim),
        }
    }
}

/// A module brought up when a session opens and released when it closes
///
/// `release` must tolerate a state the module's own `init` never touched.
pub trait LifecycleModule: Send + Sync {
    fn name(&self) -> &'static str;
    fn init(&self, state: &SessionState) -> Result<()>;
    fn release(&self, state: &SessionState);
}

/// Counters shared by the shims of one session
#[derive(Debug, Default)]
pub struct ShimLedger {
    online_cpus: AtomicUsize,
    pinned_pages: AtomicU64,
    open_files: AtomicUsize,
}

impl ShimLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn online_cpus(&self) -> usize {
        self.online_cpus.load(Ordering::SeqCst)
    }

    pub fn set_online_cpus(&self, cpus: usize) {
        self.online_cpus.store(cpus, Ordering::SeqCst);
    }

    pub fn pinned_pages(&self) -> u64 {
        self.pinned_pages.load(Ordering::SeqCst)
    }

    pub fn pin_pages(&self, pages: u64) {
        self.pinned_pages.fetch_add(pages, Ordering::SeqCst);
    }

    pub fn unpin_pages(&self, pages: u64) {
        let _ = self
            .pinned_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(pages))
            });
    }

    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::SeqCst)
    }

    /// Account one open file until the returned token drops.
    pub fn open_file(self: &Arc<Self>) -> OpenFileRef {
        self.open_files.fetch_add(1, Ordering::SeqCst);
        OpenFileRef {
            ledger: Arc::clone(self),
        }
    }
}

/// One open file object in a [`ShimLedger`]
#[derive(Debug)]
pub struct OpenFileRef {
    ledger: Arc<ShimLedger>,
}

impl Drop for OpenFileRef {
    fn drop(&mut self) {
        self.ledger.open_files.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Processor enumeration shim
pub struct SmpShim;

impl LifecycleModule for SmpShim {
    fn name(&self) -> &'static str {
        "smp"
    }

    fn init(&self, state: &SessionState) -> Result<()> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .map_err(|e| Error::Module {
                module: self.name(),
                reason: e.to_string(),
            })?;
        state.ledger().set_online_cpus(cpus);
        debug!("smp: {} online CPUs", cpus);
        Ok(())
    }

    fn release(&self, state: &SessionState) {
        state.ledger().set_online_cpus(0);
    }
}

/// Page allocator shim
pub struct AllocatorShim;

impl LifecycleModule for AllocatorShim {
    fn name(&self) -> &'static str {
        "allocator"
    }

    fn init(&self, _state: &SessionState) -> Result<()> {
        // SAFETY: sysconf has no memory-safety preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size != hvport_protocol::PAGE_SIZE as libc::c_long {
            return Err(Error::Module {
                module: self.name(),
                reason: format!("unsupported host page size {}", page_size),
            });
        }
        Ok(())
    }

    fn release(&self, state: &SessionState) {
        let pinned = state.ledger().pinned_pages();
        if pinned != 0 {
            warn!("allocator: {} pages still pinned at release", pinned);
        }
    }
}

/// File-object shim
pub struct FileShim;

impl LifecycleModule for FileShim {
    fn name(&self) -> &'static str {
        "file"
    }

    fn init(&self, _state: &SessionState) -> Result<()> {
        Ok(())
    }

    fn release(&self, state: &SessionState) {
        let open = state.ledger().open_files();
        if open != 0 {
            warn!("file: {} file objects still open at release", open);
        }
    }
}

/// Ordered set of lifecycle modules
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn LifecycleModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn from_kinds(kinds: &[ModuleKind]) -> Self {
        let mut registry = Self::new();
        for kind in kinds {
            registry.modules.push(Arc::from(kind.instantiate()));
        }
        registry
    }

    /// Append a module after the existing ones.
    pub fn register(&mut self, module: Arc<dyn LifecycleModule>) {
        self.modules.push(module);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Initialise every module in order, then the engine.
    ///
    /// On failure the modules already brought up are released in order and
    /// the error is returned.
    pub fn bring_up(&self, state: &SessionState, engine: &dyn Engine) -> Result<()> {
        for (started, module) in self.modules.iter().enumerate() {
            if let Err(e) = module.init(state) {
                warn!("Module {} failed to initialise: {}", module.name(), e);
                self.release_modules(&self.modules[..started], state);
                return Err(e);
            }
            debug!("Module {} initialised", module.name());
        }

        if let Err(e) = engine.init() {
            warn!("Engine failed to initialise: {}", e);
            self.release_modules(&self.modules, state);
            return Err(e.into());
        }

        info!("Session up with modules {:?}", self.names());
        Ok(())
    }

    /// Shut the engine down, then release every module in order.
    pub fn tear_down(&self, state: &SessionState, engine: &dyn Engine) {
        engine.shutdown();
        self.release_modules(&self.modules, state);
    }

    fn release_modules(&self, modules: &[Arc<dyn LifecycleModule>], state: &SessionState) {
        for module in modules {
            module.release(state);
            debug!("Module {} released", module.name());
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
