//! Virtualization engine interface
//!
//! The control plane never programs VT-x itself. It drives an [`Engine`]
//! that hands out VM and VCPU objects:
//!
//! - [`SoftEngine`](soft::SoftEngine): portable software engine, used by the
//!   test-suite and on hosts without hardware virtualization
//! - **Linux**: [`KvmEngine`](kvm::KvmEngine), the same interface over `/dev/kvm`
//!
//! Engine objects carry their own synchronization; the dispatcher may call
//! into different VCPUs of one VM from different threads.

pub mod memory;
pub mod paging;
pub mod soft;

#[cfg(target_os = "linux")]
pub mod kvm;

use std::sync::Arc;

use hvport_protocol::{MemoryRegion, RunBlock};
use kvm_bindings::{kvm_regs, kvm_sregs, kvm_translation};
use thiserror::Error;

/// Result type for engine calls
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failures reported by an engine
///
/// Each variant carries the errno a Unix VMM client expects to see for it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// The engine has not been brought up, or has been shut down
    #[error("engine is not initialized")]
    NotInitialized,

    /// No capacity left for another VM or VCPU
    #[error("engine capacity exhausted")]
    Exhausted,

    /// Host memory allocation failed
    #[error("out of memory")]
    NoMemory,

    #[error("invalid argument")]
    InvalidArgument,

    /// The object (VCPU id, memory range) already exists
    #[error("object already exists")]
    Exists,

    #[error("no such object")]
    NotFound,

    /// A guest address has no backing memory
    #[error("guest address {0:#x} is not backed by memory")]
    Fault(u64),

    /// The VM has no guest memory to run from
    #[error("no guest memory region configured")]
    NoMemoryRegion,

    /// The object was already released
    #[error("object has been released")]
    Released,

    /// Raw errno from the host
    #[error("engine call failed with errno {0}")]
    Os(i32),
}

impl EngineError {
    /// Positive errno for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            EngineError::NotInitialized => libc::ENODEV,
            EngineError::Exhausted => libc::ENOSPC,
            EngineError::NoMemory => libc::ENOMEM,
            EngineError::InvalidArgument => libc::EINVAL,
            EngineError::Exists => libc::EEXIST,
            EngineError::NotFound => libc::ENOENT,
            EngineError::Fault(_) | EngineError::NoMemoryRegion => libc::EFAULT,
            EngineError::Released => libc::EBADF,
            EngineError::Os(errno) => *errno,
        }
    }
}

/// MSR indices an engine saves across VM exits and the ones it emulates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsrIndexList {
    pub saved: Vec<u32>,
    pub emulated: Vec<u32>,
}

impl MsrIndexList {
    pub fn len(&self) -> usize {
        self.saved.len() + self.emulated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Saved indices followed by emulated ones.
    pub fn indices(&self) -> Vec<u32> {
        self.saved.iter().chain(self.emulated.iter()).copied().collect()
    }
}

/// Trait to represent a virtualization engine
///
/// `init` and `shutdown` bracket every device session; an engine shared by
/// several sessions counts them.
pub trait Engine: Send + Sync {
    /// Bring the engine up for one more session.
    fn init(&self) -> EngineResult<()>;
    /// Drop one session's reference to the engine.
    fn shutdown(&self);
    /// Create a VM.
    fn create_vm(&self) -> EngineResult<Arc<dyn VmObject>>;
    /// MSRs the engine saves and emulates.
    fn msr_index_list(&self) -> MsrIndexList;
}

/// Trait to represent an engine VM
pub trait VmObject: Send + Sync {
    /// Create a VCPU with the given id, bound to this VM.
    fn create_vcpu(&self, id: u32) -> EngineResult<Arc<dyn VcpuObject>>;
    /// Create, replace or (with a zero size) delete a guest memory slot.
    fn set_memory_region(&self, region: &MemoryRegion) -> EngineResult<()>;
    /// Bitmap of pages written since the previous call, one bit per page.
    fn get_dirty_log(&self, slot: u32) -> EngineResult<Vec<u64>>;
    /// Release hook, invoked once when the owning resource slot is cleared.
    fn release(&self);
}

/// Trait to represent an engine VCPU
pub trait VcpuObject: Send + Sync {
    fn id(&self) -> u32;
    fn get_regs(&self) -> EngineResult<kvm_regs>;
    fn set_regs(&self, regs: &kvm_regs) -> EngineResult<()>;
    fn get_sregs(&self) -> EngineResult<kvm_sregs>;
    fn set_sregs(&self, sregs: &kvm_sregs) -> EngineResult<()>;
    /// Translate a guest virtual address through the current paging mode.
    fn translate(&self, gva: u64) -> EngineResult<kvm_translation>;
    /// Queue an external interrupt.
    fn interrupt(&self, vector: u32) -> EngineResult<()>;
    /// Enter the guest and fill `run` with the exit.
    ///
    /// An `Err` means the run call itself failed; a guest exit the engine
    /// flags as an error is an `Ok` with the matching exit reason.
    fn run(&self, run: &mut RunBlock) -> EngineResult<()>;
    /// Copy guest virtual memory into `dst`, returning the bytes copied.
    fn read_guest(&self, gva: u64, dst: &mut [u8]) -> EngineResult<usize>;
    /// Copy `src` into guest virtual memory, returning the bytes copied.
    fn write_guest(&self, gva: u64, src: &[u8]) -> EngineResult<usize>;
    /// Release hook, invoked once when the owning resource slot is cleared.
    fn release(&self);
}
