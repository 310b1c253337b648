//! Portable software engine
//!
//! Keeps a register file per VCPU and guest RAM per VM, and steps a small
//! real-mode instruction subset so the run path produces genuine exits
//! (halt, port I/O, emulation failure) without hardware virtualization.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hvport_protocol::{MemoryRegion, RunBlock};
use kvm_bindings::{
    kvm_regs, kvm_segment, kvm_sregs, kvm_translation, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR,
    KVM_EXIT_INTR, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KVM_INTERNAL_ERROR_EMULATION,
};
use tracing::{debug, trace};

use super::memory::{transfer_virtual, GuestRam};
use super::paging;
use super::{Engine, EngineError, EngineResult, MsrIndexList, VcpuObject, VmObject};
use crate::trampoline;

/// MSRs preserved across exits
const SAVED_MSRS: &[u32] = &[
    0x174,       // IA32_SYSENTER_CS
    0x175,       // IA32_SYSENTER_ESP
    0x176,       // IA32_SYSENTER_EIP
    0xc000_0081, // STAR
    0xc000_0082, // LSTAR
    0xc000_0083, // CSTAR
    0xc000_0084, // SYSCALL_MASK
    0xc000_0102, // KERNEL_GS_BASE
    0x10,        // TSC
    0xc000_0080, // EFER
];

/// MSRs emulated rather than passed through
const EMULATED_MSRS: &[u32] = &[
    0x1b,  // APIC_BASE
    0x1a0, // MISC_ENABLE
    0xfe,  // MTRRcap
];

const RFLAGS_IF: u64 = 1 << 9;
const RFLAGS_TF: u64 = 1 << 8;
const RFLAGS_RESERVED: u64 = 1 << 1;
const CR0_PE: u64 = 1 << 0;
const APIC_BASE_DEFAULT: u64 = 0xfee0_0900;

/// Limits of a [`SoftEngine`]
#[derive(Debug, Clone)]
pub struct SoftEngineConfig {
    pub max_vms: usize,
    pub max_vcpus_per_vm: usize,
    pub max_memory_slots: u32,
    /// Instructions stepped per `run` before returning `KVM_EXIT_INTR`
    pub max_steps_per_run: usize,
}

impl Default for SoftEngineConfig {
    fn default() -> Self {
        Self {
            max_vms: 16,
            max_vcpus_per_vm: 16,
            max_memory_slots: 32,
            max_steps_per_run: 4096,
        }
    }
}

/// Software implementation of [`Engine`]
pub struct SoftEngine {
    config: SoftEngineConfig,
    sessions: Mutex<usize>,
    live_vms: Arc<AtomicUsize>,
}

impl SoftEngine {
    pub fn new(config: SoftEngineConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(0),
            live_vms: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of sessions holding the engine up
    pub fn session_count(&self) -> usize {
        *lock(&self.sessions)
    }

    /// Number of VMs not yet released
    pub fn live_vms(&self) -> usize {
        self.live_vms.load(Ordering::SeqCst)
    }
}

impl Default for SoftEngine {
    fn default() -> Self {
        Self::new(SoftEngineConfig::default())
    }
}

impl Engine for SoftEngine {
    fn init(&self) -> EngineResult<()> {
        let mut sessions = lock(&self.sessions);
        *sessions += 1;
        debug!("Soft engine up ({} sessions)", *sessions);
        Ok(())
    }

    fn shutdown(&self) {
        let mut sessions = lock(&self.sessions);
        *sessions = sessions.saturating_sub(1);
        debug!("Soft engine shutdown ({} sessions left)", *sessions);
    }

    fn create_vm(&self) -> EngineResult<Arc<dyn VmObject>> {
        if self.session_count() == 0 {
            return Err(EngineError::NotInitialized);
        }

        let claimed = self
            .live_vms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.config.max_vms).then_some(n + 1)
            });
        if claimed.is_err() {
            return Err(EngineError::Exhausted);
        }

        debug!("Created soft VM");
        Ok(Arc::new(SoftVm {
            config: self.config.clone(),
            ram: Arc::new(RwLock::new(GuestRam::new())),
            vcpu_ids: Mutex::new(Vec::new()),
            live_vms: Arc::clone(&self.live_vms),
            released: AtomicBool::new(false),
        }))
    }

    fn msr_index_list(&self) -> MsrIndexList {
        MsrIndexList {
            saved: SAVED_MSRS.to_vec(),
            emulated: EMULATED_MSRS.to_vec(),
        }
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

/// VM created by [`SoftEngine`]
pub struct SoftVm {
    config: SoftEngineConfig,
    ram: Arc<RwLock<GuestRam>>,
    vcpu_ids: Mutex<Vec<u32>>,
    live_vms: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl SoftVm {
    fn check_live(&self) -> EngineResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(EngineError::Released);
        }
        Ok(())
    }
}

impl VmObject for SoftVm {
    fn create_vcpu(&self, id: u32) -> EngineResult<Arc<dyn VcpuObject>> {
        self.check_live()?;

        let mut ids = lock(&self.vcpu_ids);
        if ids.contains(&id) {
            return Err(EngineError::Exists);
        }
        if ids.len() >= self.config.max_vcpus_per_vm {
            return Err(EngineError::Exhausted);
        }
        ids.push(id);

        debug!("Created soft vCPU {}", id);
        Ok(Arc::new(SoftVcpu {
            id,
            max_steps: self.config.max_steps_per_run,
            ram: Arc::clone(&self.ram),
            state: Mutex::new(CpuState::reset()),
            released: AtomicBool::new(false),
        }))
    }

    fn set_memory_region(&self, region: &MemoryRegion) -> EngineResult<()> {
        self.check_live()?;
        write_ram(&self.ram).set_region(region, self.config.max_memory_slots)
    }

    fn get_dirty_log(&self, slot: u32) -> EngineResult<Vec<u64>> {
        self.check_live()?;
        read_ram(&self.ram).take_dirty_log(slot)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        write_ram(&self.ram).clear();
        self.live_vms.fetch_sub(1, Ordering::SeqCst);
        debug!("Released soft VM");
    }
}

/// Architectural state of one soft VCPU
struct CpuState {
    regs: kvm_regs,
    sregs: kvm_sregs,
    pending_irq: Option<u8>,
    /// Width of a port read awaiting data from the next run block
    pending_in: Option<u8>,
}

impl CpuState {
    /// x86 power-on state.
    fn reset() -> Self {
        let data = kvm_segment {
            base: 0,
            limit: 0xffff,
            selector: 0,
            type_: 3,
            present: 1,
            s: 1,
            ..Default::default()
        };
        let sregs = kvm_sregs {
            cs: kvm_segment {
                base: 0xffff_0000,
                selector: 0xf000,
                type_: 0xb,
                ..data
            },
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            cr0: 0x6000_0010,
            apic_base: APIC_BASE_DEFAULT,
            ..Default::default()
        };
        let regs = kvm_regs {
            rip: 0xfff0,
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };

        Self {
            regs,
            sregs,
            pending_irq: None,
            pending_in: None,
        }
    }

    fn interrupts_enabled(&self) -> bool {
        self.regs.rflags & RFLAGS_IF != 0
    }

    fn linear_ip(&self) -> u64 {
        self.sregs.cs.base.wrapping_add(self.regs.rip)
    }
}

/// Outcome of one interpreted instruction
enum Step {
    Continue,
    Exit,
}

/// VCPU created by [`SoftVm`]
pub struct SoftVcpu {
    id: u32,
    max_steps: usize,
    ram: Arc<RwLock<GuestRam>>,
    state: Mutex<CpuState>,
    released: AtomicBool,
}

impl SoftVcpu {
    fn check_live(&self) -> EngineResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(EngineError::Released);
        }
        Ok(())
    }

    /// Translate a linear address to a guest physical one, `None` if unmapped.
    fn linear_to_phys(ram: &GuestRam, sregs: &kvm_sregs, linear: u64) -> EngineResult<Option<u64>> {
        let tr = paging::translate(ram, sregs, linear)?;
        Ok((tr.valid != 0).then_some(tr.physical_address))
    }

    fn transfer<F>(&self, gva: u64, len: usize, copy: F) -> EngineResult<usize>
    where
        F: FnMut(&GuestRam, u64, std::ops::Range<usize>) -> EngineResult<()>,
    {
        self.check_live()?;
        let sregs = lock(&self.state).sregs;
        let ram = read_ram(&self.ram);
        transfer_virtual(
            &ram,
            gva,
            len,
            |linear| Self::linear_to_phys(&ram, &sregs, linear),
            copy,
        )
    }

    fn deliver_interrupt(ram: &GuestRam, cpu: &mut CpuState) -> EngineResult<()> {
        let Some(vector) = cpu.pending_irq else {
            return Ok(());
        };
        // Real mode only; protected-mode delivery needs an IDT walk
        if !cpu.interrupts_enabled() || cpu.sregs.cr0 & CR0_PE != 0 {
            return Ok(());
        }

        let vector_addr = u64::from(vector) * 4;
        let new_ip = ram.read_u16(vector_addr)?;
        let new_cs = ram.read_u16(vector_addr + 2)?;

        let frame = [
            cpu.regs.rflags as u16,
            cpu.sregs.cs.selector,
            cpu.regs.rip as u16,
        ];
        let mut sp = cpu.regs.rsp as u16;
        for word in frame {
            sp = sp.wrapping_sub(2);
            ram.write(cpu.sregs.ss.base.wrapping_add(u64::from(sp)), &word.to_le_bytes())?;
        }

        cpu.regs.rsp = (cpu.regs.rsp & !0xffff) | u64::from(sp);
        cpu.regs.rflags &= !(RFLAGS_IF | RFLAGS_TF);
        cpu.regs.rip = u64::from(new_ip);
        cpu.sregs.cs.selector = new_cs;
        cpu.sregs.cs.base = u64::from(new_cs) << 4;
        cpu.pending_irq = None;

        trace!("vCPU delivered vector {:#x} to {:04x}:{:04x}", vector, new_cs, new_ip);
        Ok(())
    }

    fn fetch(ram: &GuestRam, cpu: &CpuState, offset: u64) -> Option<u8> {
        let linear = cpu.linear_ip().wrapping_add(offset);
        let gpa = Self::linear_to_phys(ram, &cpu.sregs, linear).ok().flatten()?;
        ram.read_u8(gpa).ok()
    }

    fn step(ram: &GuestRam, cpu: &mut CpuState, run: &mut RunBlock) -> Step {
        let Some(opcode) = Self::fetch(ram, cpu, 0) else {
            return Self::emulation_failure(run);
        };

        match opcode {
            // nop
            0x90 => {
                cpu.regs.rip = cpu.regs.rip.wrapping_add(1);
                Step::Continue
            }
            // hlt
            0xf4 => {
                cpu.regs.rip = cpu.regs.rip.wrapping_add(1);
                run.exit_reason = KVM_EXIT_HLT;
                Step::Exit
            }
            // cli
            0xfa => {
                cpu.regs.rflags &= !RFLAGS_IF;
                cpu.regs.rip = cpu.regs.rip.wrapping_add(1);
                Step::Continue
            }
            // sti
            0xfb => {
                cpu.regs.rflags |= RFLAGS_IF;
                cpu.regs.rip = cpu.regs.rip.wrapping_add(1);
                Step::Continue
            }
            // out imm8, al / in al, imm8
            0xe6 | 0xe4 => {
                let Some(port) = Self::fetch(ram, cpu, 1) else {
                    return Self::emulation_failure(run);
                };
                cpu.regs.rip = cpu.regs.rip.wrapping_add(2);

                run.exit_reason = KVM_EXIT_IO;
                run.io.size = 1;
                run.io.port = u16::from(port);
                run.io.count = 1;
                run.io.data = [0; 8];
                if opcode == 0xe6 {
                    run.io.direction = KVM_EXIT_IO_OUT as u8;
                    run.io.data[0] = cpu.regs.rax as u8;
                } else {
                    run.io.direction = KVM_EXIT_IO_IN as u8;
                    cpu.pending_in = Some(1);
                }
                Step::Exit
            }
            _ => Self::emulation_failure(run),
        }
    }

    fn emulation_failure(run: &mut RunBlock) -> Step {
        run.exit_reason = KVM_EXIT_INTERNAL_ERROR;
        run.internal_suberror = KVM_INTERNAL_ERROR_EMULATION;
        Step::Exit
    }

    fn complete_port_in(cpu: &mut CpuState, run: &RunBlock) {
        if let Some(size) = cpu.pending_in.take() {
            let size = usize::from(size).min(run.io.data.len());
            let mut rax = cpu.regs.rax.to_le_bytes();
            rax[..size].copy_from_slice(&run.io.data[..size]);
            cpu.regs.rax = u64::from_le_bytes(rax);
        }
    }
}

impl VcpuObject for SoftVcpu {
    fn id(&self) -> u32 {
        self.id
    }

    fn get_regs(&self) -> EngineResult<kvm_regs> {
        self.check_live()?;
        Ok(lock(&self.state).regs)
    }

    fn set_regs(&self, regs: &kvm_regs) -> EngineResult<()> {
        self.check_live()?;
        lock(&self.state).regs = *regs;
        Ok(())
    }

    fn get_sregs(&self) -> EngineResult<kvm_sregs> {
        self.check_live()?;
        Ok(lock(&self.state).sregs)
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> EngineResult<()> {
        self.check_live()?;
        lock(&self.state).sregs = *sregs;
        Ok(())
    }

    fn translate(&self, gva: u64) -> EngineResult<kvm_translation> {
        self.check_live()?;
        let sregs = lock(&self.state).sregs;
        paging::translate(&read_ram(&self.ram), &sregs, gva)
    }

    fn interrupt(&self, vector: u32) -> EngineResult<()> {
        self.check_live()?;
        let vector = u8::try_from(vector).map_err(|_| EngineError::InvalidArgument)?;
        let mut cpu = lock(&self.state);
        if cpu.pending_irq.is_some() {
            return Err(EngineError::Os(libc::ENXIO));
        }
        cpu.pending_irq = Some(vector);
        Ok(())
    }

    fn run(&self, run: &mut RunBlock) -> EngineResult<()> {
        self.check_live()?;
        let ram = read_ram(&self.ram);
        if ram.is_empty() {
            return Err(EngineError::NoMemoryRegion);
        }

        let mut cpu = lock(&self.state);
        Self::complete_port_in(&mut cpu, run);
        run.clear_exit();

        let mut exited = false;
        for _ in 0..self.max_steps {
            Self::deliver_interrupt(&ram, &mut cpu)?;
            if let Step::Exit = Self::step(&ram, &mut cpu, run) {
                exited = true;
                break;
            }
        }
        if !exited {
            run.exit_reason = KVM_EXIT_INTR;
        }

        run.if_flag = cpu.interrupts_enabled() as u8;
        run.ready_for_interrupt_injection =
            (cpu.interrupts_enabled() && cpu.pending_irq.is_none()) as u8;
        run.cr8 = cpu.sregs.cr8;
        run.apic_base = cpu.sregs.apic_base;

        trace!(
            "vCPU {} exit reason {} at rip {:#x}",
            self.id,
            run.exit_reason,
            cpu.regs.rip
        );
        trampoline::vm_exit();
        Ok(())
    }

    fn read_guest(&self, gva: u64, dst: &mut [u8]) -> EngineResult<usize> {
        let len = dst.len();
        self.transfer(gva, len, |ram, gpa, range| ram.read(gpa, &mut dst[range]))
    }

    fn write_guest(&self, gva: u64, src: &[u8]) -> EngineResult<usize> {
        self.transfer(gva, src.len(), |ram, gpa, range| ram.write(gpa, &src[range]))
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("Released soft vCPU {}", self.id);
        }
    }
}
