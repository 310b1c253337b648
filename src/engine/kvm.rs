//! KVM-backed engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hvport_protocol::{MemoryRegion, RunBlock};
use kvm_bindings::{
    kvm_interrupt, kvm_regs, kvm_sregs, kvm_translation, kvm_userspace_memory_region,
    KVMIO, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_INTR,
    KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN,
    KVM_EXIT_UNKNOWN,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use tracing::{debug, trace, warn};
use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use super::memory::{transfer_virtual, GuestRam, RamSlot};
use super::{Engine, EngineError, EngineResult, MsrIndexList, VcpuObject, VmObject};
use crate::trampoline;

ioctl_iow_nr!(KVM_INTERRUPT, KVMIO, 0x86, kvm_interrupt);

fn os_error(e: kvm_ioctls::Error) -> EngineError {
    match e.errno() {
        libc::ENOMEM => EngineError::NoMemory,
        libc::EEXIST => EngineError::Exists,
        libc::EINVAL => EngineError::InvalidArgument,
        libc::EFAULT => EngineError::Fault(0),
        errno => EngineError::Os(errno),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_ram(ram: &RwLock<GuestRam>) -> RwLockReadGuard<'_, GuestRam> {
    ram.read().unwrap_or_else(|e| e.into_inner())
}

fn write_ram(ram: &RwLock<GuestRam>) -> RwLockWriteGuard<'_, GuestRam> {
    ram.write().unwrap_or_else(|e| e.into_inner())
}

/// Engine over `/dev/kvm`
pub struct KvmEngine {
    kvm: Kvm,
    max_memory_slots: u32,
    sessions: Mutex<usize>,
}

impl KvmEngine {
    /// Open `/dev/kvm`.
    pub fn new(max_memory_slots: u32) -> EngineResult<Self> {
        let kvm = Kvm::new().map_err(os_error)?;
        debug!("KVM API version: {}", kvm.get_api_version());

        let max_memory_slots = max_memory_slots.min(kvm.get_nr_memslots() as u32);
        Ok(Self {
            kvm,
            max_memory_slots,
            sessions: Mutex::new(0),
        })
    }
}

impl Engine for KvmEngine {
    fn init(&self) -> EngineResult<()> {
        *lock(&self.sessions) += 1;
        Ok(())
    }

    fn shutdown(&self) {
        let mut sessions = lock(&self.sessions);
        *sessions = sessions.saturating_sub(1);
    }

    fn create_vm(&self) -> EngineResult<Arc<dyn VmObject>> {
        if *lock(&self.sessions) == 0 {
            return Err(EngineError::NotInitialized);
        }

        let vm_fd = self.kvm.create_vm().map_err(os_error)?;
        debug!("Created KVM VM");
        Ok(Arc::new(KvmVm {
            vm_fd,
            max_memory_slots: self.max_memory_slots,
            ram: Arc::new(RwLock::new(GuestRam::new())),
            released: AtomicBool::new(false),
        }))
    }

    fn msr_index_list(&self) -> MsrIndexList {
        let saved = match self.kvm.get_msr_index_list() {
            Ok(list) => list.as_slice().to_vec(),
            Err(e) => {
                warn!("KVM_GET_MSR_INDEX_LIST failed: {}", e);
                Vec::new()
            }
        };
        MsrIndexList {
            saved,
            emulated: Vec::new(),
        }
    }
}

/// VM backed by a KVM VM file descriptor
pub struct KvmVm {
    vm_fd: VmFd,
    max_memory_slots: u32,
    ram: Arc<RwLock<GuestRam>>,
    released: AtomicBool,
}

impl KvmVm {
    fn check_live(&self) -> EngineResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(EngineError::Released);
        }
        Ok(())
    }

    /// Register (or, with a zero size, delete) a slot with KVM.
    fn register(&self, region: &MemoryRegion, userspace_addr: u64) -> EngineResult<()> {
        let memory_region = kvm_userspace_memory_region {
            slot: region.slot,
            flags: region.flags,
            guest_phys_addr: region.guest_phys_addr,
            memory_size: region.memory_size,
            userspace_addr,
        };

        // SAFETY: userspace_addr is the start of a host mapping of
        // memory_size bytes owned by `self.ram`; a slot is always removed from
        // KVM before its mapping is dropped.
        unsafe { self.vm_fd.set_user_memory_region(memory_region) }.map_err(os_error)
    }

    fn unregister(&self, slot: &RamSlot) -> EngineResult<()> {
        let region = MemoryRegion {
            memory_size: 0,
            ..*slot.region()
        };
        self.register(&region, 0)
    }

    fn register_slot(&self, slot: &RamSlot) -> EngineResult<()> {
        self.register(slot.region(), slot.host_address()?)
    }
}

impl VmObject for KvmVm {
    fn create_vcpu(&self, id: u32) -> EngineResult<Arc<dyn VcpuObject>> {
        self.check_live()?;
        let fd = self.vm_fd.create_vcpu(u64::from(id)).map_err(os_error)?;
        debug!("Created KVM vCPU {}", id);
        Ok(Arc::new(KvmVcpu {
            id,
            vcpu: Mutex::new(VcpuState { fd, pending: None }),
            ram: Arc::clone(&self.ram),
            released: AtomicBool::new(false),
        }))
    }

    fn set_memory_region(&self, region: &MemoryRegion) -> EngineResult<()> {
        self.check_live()?;
        let mut ram = write_ram(&self.ram);

        // KVM cannot resize a live slot: drop it first, restore on failure
        let had_slot = match ram.slot(region.slot) {
            Some(existing) => {
                self.unregister(existing)?;
                true
            }
            None => false,
        };

        if let Err(e) = ram.set_region(region, self.max_memory_slots) {
            if had_slot {
                if let Some(existing) = ram.slot(region.slot) {
                    self.register_slot(existing)?;
                }
            }
            return Err(e);
        }

        if let Some(slot) = ram.slot(region.slot) {
            if let Err(e) = self.register_slot(slot) {
                let delete = MemoryRegion {
                    memory_size: 0,
                    ..*region
                };
                ram.set_region(&delete, self.max_memory_slots)?;
                return Err(e);
            }
        }
        Ok(())
    }

    fn get_dirty_log(&self, slot: u32) -> EngineResult<Vec<u64>> {
        self.check_live()?;
        let ram = read_ram(&self.ram);
        let size = ram.slot(slot).ok_or(EngineError::NotFound)?.region().memory_size;
        self.vm_fd
            .get_dirty_log(slot, size as usize)
            .map_err(os_error)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut ram = write_ram(&self.ram);
        for slot in 0..self.max_memory_slots {
            if let Some(existing) = ram.slot(slot) {
                if let Err(e) = self.unregister(existing) {
                    warn!("Failed to remove KVM memory slot {}: {}", slot, e);
                }
            }
        }
        ram.clear();
        debug!("Released KVM VM");
    }
}

/// Exit data the caller supplies on the next run
#[derive(Clone, Copy)]
enum PendingRead {
    Io { data: usize, len: usize },
    Mmio { data: usize, len: usize },
}

struct VcpuState {
    fd: VcpuFd,
    pending: Option<PendingRead>,
}

/// VCPU backed by a KVM VCPU file descriptor
pub struct KvmVcpu {
    id: u32,
    vcpu: Mutex<VcpuState>,
    ram: Arc<RwLock<GuestRam>>,
    released: AtomicBool,
}

impl KvmVcpu {
    fn check_live(&self) -> EngineResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(EngineError::Released);
        }
        Ok(())
    }

    fn complete_pending(state: &mut VcpuState, run: &RunBlock) {
        let (data, len, src) = match state.pending.take() {
            Some(PendingRead::Io { data, len }) => (data, len, &run.io.data),
            Some(PendingRead::Mmio { data, len }) => (data, len, &run.mmio.data),
            None => return,
        };
        let len = len.min(src.len());
        // SAFETY: `data` points into the kvm_run page mapped for `state.fd`,
        // which lives as long as the fd; `len` came from the exit itself.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), data as *mut u8, len) };
    }

    fn fill_exit(exit: VcpuExit<'_>, run: &mut RunBlock) -> Option<PendingRead> {
        match exit {
            VcpuExit::IoOut(port, data) => {
                run.exit_reason = KVM_EXIT_IO;
                run.io.direction = KVM_EXIT_IO_OUT as u8;
                run.io.port = port;
                run.io.size = data.len().min(run.io.data.len()) as u8;
                run.io.count = 1;
                let len = usize::from(run.io.size);
                run.io.data[..len].copy_from_slice(&data[..len]);
                None
            }
            VcpuExit::IoIn(port, data) => {
                run.exit_reason = KVM_EXIT_IO;
                run.io.direction = KVM_EXIT_IO_IN as u8;
                run.io.port = port;
                run.io.size = data.len().min(run.io.data.len()) as u8;
                run.io.count = 1;
                Some(PendingRead::Io {
                    data: data.as_mut_ptr() as usize,
                    len: data.len(),
                })
            }
            VcpuExit::MmioRead(addr, data) => {
                run.exit_reason = KVM_EXIT_MMIO;
                run.mmio.phys_addr = addr;
                run.mmio.len = data.len() as u32;
                run.mmio.is_write = 0;
                Some(PendingRead::Mmio {
                    data: data.as_mut_ptr() as usize,
                    len: data.len(),
                })
            }
            VcpuExit::MmioWrite(addr, data) => {
                run.exit_reason = KVM_EXIT_MMIO;
                run.mmio.phys_addr = addr;
                let len = data.len().min(run.mmio.data.len());
                run.mmio.len = len as u32;
                run.mmio.is_write = 1;
                run.mmio.data[..len].copy_from_slice(&data[..len]);
                None
            }
            VcpuExit::Hlt => {
                run.exit_reason = KVM_EXIT_HLT;
                None
            }
            VcpuExit::Shutdown => {
                run.exit_reason = KVM_EXIT_SHUTDOWN;
                None
            }
            VcpuExit::Intr => {
                run.exit_reason = KVM_EXIT_INTR;
                None
            }
            VcpuExit::FailEntry(reason, _cpu) => {
                run.exit_reason = KVM_EXIT_FAIL_ENTRY;
                run.hardware_entry_failure_reason = reason;
                None
            }
            VcpuExit::InternalError => {
                run.exit_reason = KVM_EXIT_INTERNAL_ERROR;
                None
            }
            other => {
                trace!("Unhandled KVM exit {:?}", other);
                run.exit_reason = KVM_EXIT_UNKNOWN;
                None
            }
        }
    }
}

impl VcpuObject for KvmVcpu {
    fn id(&self) -> u32 {
        self.id
    }

    fn get_regs(&self) -> EngineResult<kvm_regs> {
        self.check_live()?;
        lock(&self.vcpu).fd.get_regs().map_err(os_error)
    }

    fn set_regs(&self, regs: &kvm_regs) -> EngineResult<()> {
        self.check_live()?;
        lock(&self.vcpu).fd.set_regs(regs).map_err(os_error)
    }

    fn get_sregs(&self) -> EngineResult<kvm_sregs> {
        self.check_live()?;
        lock(&self.vcpu).fd.get_sregs().map_err(os_error)
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> EngineResult<()> {
        self.check_live()?;
        lock(&self.vcpu).fd.set_sregs(sregs).map_err(os_error)
    }

    fn translate(&self, gva: u64) -> EngineResult<kvm_translation> {
        self.check_live()?;
        lock(&self.vcpu).fd.translate_gva(gva).map_err(os_error)
    }

    fn interrupt(&self, vector: u32) -> EngineResult<()> {
        self.check_live()?;
        let irq = kvm_interrupt { irq: vector };
        let state = lock(&self.vcpu);
        // SAFETY: KVM_INTERRUPT reads one kvm_interrupt from the pointer.
        let ret = unsafe { ioctl_with_ref(&state.fd, KVM_INTERRUPT(), &irq) };
        if ret < 0 {
            return Err(os_error(kvm_ioctls::Error::last()));
        }
        Ok(())
    }

    fn run(&self, run: &mut RunBlock) -> EngineResult<()> {
        self.check_live()?;
        if read_ram(&self.ram).is_empty() {
            return Err(EngineError::NoMemoryRegion);
        }

        let mut state = lock(&self.vcpu);
        Self::complete_pending(&mut state, run);
        run.clear_exit();

        let pending = match state.fd.run() {
            Ok(exit) => Self::fill_exit(exit, run),
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                run.exit_reason = KVM_EXIT_INTR;
                None
            }
            Err(e) => return Err(os_error(e)),
        };
        state.pending = pending;

        if let Ok(regs) = state.fd.get_regs() {
            run.if_flag = (regs.rflags & (1 << 9) != 0) as u8;
            run.ready_for_interrupt_injection = run.if_flag;
        }
        if let Ok(sregs) = state.fd.get_sregs() {
            run.cr8 = sregs.cr8;
            run.apic_base = sregs.apic_base;
        }

        trace!("KVM vCPU {} exit reason {}", self.id, run.exit_reason);
        trampoline::vm_exit();
        Ok(())
    }

    fn read_guest(&self, gva: u64, dst: &mut [u8]) -> EngineResult<usize> {
        self.check_live()?;
        let len = dst.len();
        let ram = read_ram(&self.ram);
        transfer_virtual(
            &ram,
            gva,
            len,
            |linear| {
                let tr = self.translate(linear)?;
                Ok((tr.valid != 0).then_some(tr.physical_address))
            },
            |ram, gpa, range| ram.read(gpa, &mut dst[range]),
        )
    }

    fn write_guest(&self, gva: u64, src: &[u8]) -> EngineResult<usize> {
        self.check_live()?;
        let ram = read_ram(&self.ram);
        transfer_virtual(
            &ram,
            gva,
            src.len(),
            |linear| {
                let tr = self.translate(linear)?;
                Ok((tr.valid != 0).then_some(tr.physical_address))
            },
            |ram, gpa, range| ram.write(gpa, &src[range]),
        )
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("Released KVM vCPU {}", self.id);
        }
    }
}
