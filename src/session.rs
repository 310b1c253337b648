//! Driver instances and device sessions
//!
//! A [`Driver`] holds the configuration and the engine. Each
//! [`Driver::open`] creates a [`Session`] that owns its resource table and
//! memory-map slots, and tears them down on [`Session::close`] or drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::dispatch::{Completion, Dispatcher};
use crate::engine::soft::SoftEngine;
use crate::engine::Engine;
use crate::lifecycle::{LifecycleModule, ModuleRegistry, ShimLedger};
use crate::memmap::{AnonymousPageAllocator, MemoryMapTable, PageAllocator};
use crate::resource::ResourceTable;
use crate::{Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// State of one session, shared with the lifecycle modules
///
/// The table locks are held only while a slot is looked up or changed.
pub struct SessionState {
    resources: Mutex<ResourceTable>,
    mappings: Mutex<MemoryMapTable>,
    ledger: Arc<ShimLedger>,
    max_transfer_size: u32,
}

impl SessionState {
    pub fn new(config: &DriverConfig, ledger: Arc<ShimLedger>) -> Self {
        Self {
            resources: Mutex::new(ResourceTable::new(
                config.max_resource_slots,
                Arc::clone(&ledger),
            )),
            mappings: Mutex::new(MemoryMapTable::new(
                config.max_memmap_slots,
                config.max_map_pages,
                Arc::clone(&ledger),
            )),
            ledger,
            max_transfer_size: config.max_transfer_size,
        }
    }

    pub fn ledger(&self) -> &Arc<ShimLedger> {
        &self.ledger
    }

    pub fn resources(&self) -> MutexGuard<'_, ResourceTable> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mappings(&self) -> MutexGuard<'_, MemoryMapTable> {
        self.mappings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_transfer_size(&self) -> u32 {
        self.max_transfer_size
    }
}

/// A loaded driver instance
pub struct Driver {
    config: DriverConfig,
    engine: Arc<dyn Engine>,
    allocator: Arc<dyn PageAllocator>,
    extra_modules: Vec<Arc<dyn LifecycleModule>>,
}

impl Driver {
    /// Create a driver over `engine`, pinning pages with the anonymous allocator.
    pub fn new(config: DriverConfig, engine: Arc<dyn Engine>) -> Result<Self> {
        config.validate()?;
        info!(
            "Driver loaded: {} resource slots, {} memory-map slots",
            config.max_resource_slots, config.max_memmap_slots
        );
        Ok(Self {
            config,
            engine,
            allocator: Arc::new(AnonymousPageAllocator),
            extra_modules: Vec::new(),
        })
    }

    /// Create a driver over a [`SoftEngine`] with default limits.
    pub fn soft(config: DriverConfig) -> Result<Self> {
        Self::new(config, Arc::new(SoftEngine::default()))
    }

    /// Create a driver over `/dev/kvm`.
    #[cfg(target_os = "linux")]
    pub fn kvm(config: DriverConfig) -> Result<Self> {
        let engine = crate::engine::kvm::KvmEngine::new(config.max_memmap_slots)?;
        Self::new(config, Arc::new(engine))
    }

    /// Use a different page allocator for memory-map slots.
    pub fn with_allocator(mut self, allocator: Arc<dyn PageAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Run `module` after the configured ones in every session.
    pub fn with_module(mut self, module: Arc<dyn LifecycleModule>) -> Self {
        self.extra_modules.push(module);
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Open a session: bring up the modules, then the engine.
    pub fn open(&self) -> Result<Session> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let state = SessionState::new(&self.config, ShimLedger::new());

        let mut modules = ModuleRegistry::from_kinds(&self.config.modules);
        for module in &self.extra_modules {
            modules.register(Arc::clone(module));
        }
        modules.bring_up(&state, self.engine.as_ref())?;

        info!("Session {} opened", id);
        Ok(Session {
            id,
            state,
            modules,
            engine: Arc::clone(&self.engine),
            allocator: Arc::clone(&self.allocator),
            closed: false,
        })
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        debug!("Driver unloaded");
    }
}

/// An open device session
pub struct Session {
    id: u64,
    state: SessionState,
    modules: ModuleRegistry,
    engine: Arc<dyn Engine>,
    allocator: Arc<dyn PageAllocator>,
    closed: bool,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Serve one control request. A closed session rejects everything.
    pub fn control(&self, code: u32, input: &[u8], output: &mut [u8]) -> Completion {
        if self.closed {
            let e = Error::SessionClosed(self.id);
            warn!("Rejected request {:#x}: {}", code, e);
            return Completion::failed(e.status());
        }
        Dispatcher::new(&self.state, self.engine.as_ref(), self.allocator.as_ref())
            .dispatch(code, input, output)
    }

    /// Cleanup notification ahead of close; leaves all state in place.
    pub fn cleanup(&self) -> Completion {
        debug!("Session {} cleanup", self.id);
        Completion::success(0)
    }

    /// Release every VCPU, then every VM, close all memory-map slots, shut
    /// the engine down and release the modules. Safe to call twice.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.state.resources().release_all();
        self.state.mappings().close_all();
        self.modules.tear_down(&self.state, self.engine.as_ref());
        info!("Session {} closed", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
