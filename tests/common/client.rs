//! Test-side client for building control requests against a session

#![allow(dead_code)]

use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hvport::memmap::{PageAllocator, PinnedPages};
use hvport::protocol::{
    read_struct, to_bytes, ControlCode, CreateVcpuRequest, GetPvMap, MapMemInit, MemoryRegion,
    MemoryRegionRequest, PfnEntry, RegsBlock, RunBlock, SregsBlock, Status, TransferHeader, PAGE_SIZE,
};
use hvport::{Completion, Session};
use kvm_bindings::{kvm_regs, kvm_sregs};

/// Route driver logs to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Heap-backed pages with synthetic frame numbers
pub struct HeapPages {
    data: Vec<u8>,
}

impl PinnedPages for HeapPages {
    fn user_address(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    fn page_count(&self) -> usize {
        self.data.len() / PAGE_SIZE as usize
    }

    fn physical_address(&self, index: usize) -> u64 {
        0x1_0000_0000 + index as u64 * PAGE_SIZE
    }

    fn zero_page(&mut self, index: usize) {
        let start = index * PAGE_SIZE as usize;
        self.data[start..start + PAGE_SIZE as usize].fill(0);
    }
}

/// Allocator handing out heap pages, counting live allocations
#[derive(Default)]
pub struct HeapAllocator {
    pub live: Arc<AtomicUsize>,
}

struct CountedPages {
    pages: HeapPages,
    live: Arc<AtomicUsize>,
}

impl PinnedPages for CountedPages {
    fn user_address(&self) -> u64 {
        self.pages.user_address()
    }

    fn page_count(&self) -> usize {
        self.pages.page_count()
    }

    fn physical_address(&self, index: usize) -> u64 {
        self.pages.physical_address(index)
    }

    fn zero_page(&mut self, index: usize) {
        self.pages.zero_page(index)
    }
}

impl Drop for CountedPages {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PageAllocator for HeapAllocator {
    fn pin(&self, pages: usize) -> io::Result<Box<dyn PinnedPages>> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedPages {
            pages: HeapPages {
                data: vec![0x5a; pages * PAGE_SIZE as usize],
            },
            live: Arc::clone(&self.live),
        }))
    }
}

/// Allocator that always fails to pin
pub struct FailingAllocator;

impl PageAllocator for FailingAllocator {
    fn pin(&self, _pages: usize) -> io::Result<Box<dyn PinnedPages>> {
        Err(io::Error::from_raw_os_error(libc::ENOMEM))
    }
}

/// Typed wrappers around `Session::control`
pub struct Client<'a> {
    pub session: &'a Session,
}

impl<'a> Client<'a> {
    pub fn new(session: &'a Session) -> Self {
        init_tracing();
        Self { session }
    }

    pub fn call(&self, code: ControlCode, input: &[u8], output: &mut [u8]) -> Completion {
        self.session.control(code.code(), input, output)
    }

    fn descriptor(&self, code: ControlCode, input: &[u8]) -> Result<i32, Status> {
        let mut out = [0u8; 4];
        let completion = self.call(code, input, &mut out);
        if !completion.is_success() {
            return Err(completion.status);
        }
        assert_eq!(completion.information, 4);
        Ok(i32::from_le_bytes(out))
    }

    pub fn create_vm(&self) -> Result<i32, Status> {
        self.descriptor(ControlCode::CreateVm, &[])
    }

    pub fn create_vcpu(&self, vm_fd: i32, vcpu_id: i32) -> Result<i32, Status> {
        let request = CreateVcpuRequest { vm_fd, vcpu_id };
        self.descriptor(ControlCode::CreateVcpu, &to_bytes(&request))
    }

    pub fn set_memory_region(&self, vm_fd: i32, region: MemoryRegion) -> Completion {
        let request = MemoryRegionRequest {
            vm_fd,
            padding: 0,
            region,
        };
        let mut out = [0u8; size_of::<MemoryRegionRequest>()];
        self.call(ControlCode::SetMemoryRegion, &to_bytes(&request), &mut out)
    }

    /// Map `size` bytes of guest RAM at guest physical 0.
    pub fn add_ram(&self, vm_fd: i32, size: u64) {
        let completion = self.set_memory_region(
            vm_fd,
            MemoryRegion {
                slot: 0,
                flags: 0,
                guest_phys_addr: 0,
                memory_size: size,
            },
        );
        assert!(completion.is_success(), "{:?}", completion);
    }

    pub fn get_regs(&self, vcpu_fd: i32) -> Result<kvm_regs, Completion> {
        let mut out = [0u8; size_of::<RegsBlock>()];
        let completion = self.call(ControlCode::GetRegs, &vcpu_fd.to_le_bytes(), &mut out);
        if !completion.is_success() {
            return Err(completion);
        }
        let block: RegsBlock = read_struct(&out).unwrap();
        assert_eq!(block.vcpu_fd, vcpu_fd);
        Ok(block.regs)
    }

    pub fn set_regs(&self, vcpu_fd: i32, regs: kvm_regs) -> Completion {
        let block = RegsBlock {
            vcpu_fd,
            padding: 0,
            regs,
        };
        self.call(ControlCode::SetRegs, &to_bytes(&block), &mut [])
    }

    pub fn get_sregs(&self, vcpu_fd: i32) -> kvm_sregs {
        let mut out = [0u8; size_of::<SregsBlock>()];
        let completion = self.call(ControlCode::GetSregs, &vcpu_fd.to_le_bytes(), &mut out);
        assert!(completion.is_success(), "{:?}", completion);
        read_struct::<SregsBlock>(&out).unwrap().sregs
    }

    pub fn set_sregs(&self, vcpu_fd: i32, sregs: kvm_sregs) -> Completion {
        let block = SregsBlock {
            vcpu_fd,
            padding: 0,
            sregs,
        };
        self.call(ControlCode::SetSregs, &to_bytes(&block), &mut [])
    }

    /// VM with 64 KiB of RAM and one real-mode VCPU executing `code` at 0x1000.
    pub fn real_mode_guest(&self, code: &[u8]) -> (i32, i32) {
        let vm = self.create_vm().unwrap();
        self.add_ram(vm, 0x10000);
        let vcpu = self.create_vcpu(vm, 0).unwrap();

        let mut sregs = self.get_sregs(vcpu);
        sregs.cs.base = 0;
        sregs.cs.selector = 0;
        assert!(self.set_sregs(vcpu, sregs).is_success());

        let mut regs = self.get_regs(vcpu).unwrap();
        regs.rip = 0x1000;
        regs.rsp = 0x8000;
        assert!(self.set_regs(vcpu, regs).is_success());

        let completion = self.write_guest(vcpu, 0x1000, code);
        assert!(completion.is_success(), "{:?}", completion);
        (vm, vcpu)
    }

    pub fn run(&self, block: &mut RunBlock) -> Completion {
        let mut out = [0u8; size_of::<RunBlock>()];
        let completion = self.call(ControlCode::Run, &to_bytes(block), &mut out);
        if completion.information == size_of::<RunBlock>() {
            *block = read_struct(&out).unwrap();
        }
        completion
    }

    pub fn write_guest(&self, vcpu_fd: i32, gva: u64, data: &[u8]) -> Completion {
        let header = TransferHeader {
            vcpu_fd,
            size: data.len() as u32,
            gva,
        };
        let mut input = to_bytes(&header);
        input.extend_from_slice(data);
        let mut out = [0u8; 4];
        self.call(ControlCode::WriteGuest, &input, &mut out)
    }

    pub fn read_guest(&self, vcpu_fd: i32, gva: u64, size: usize) -> (Completion, Vec<u8>) {
        let header = TransferHeader {
            vcpu_fd,
            size: size as u32,
            gva,
        };
        let mut out = vec![0u8; size];
        let completion = self.call(ControlCode::ReadGuest, &to_bytes(&header), &mut out);
        out.truncate(completion.information);
        (completion, out)
    }

    pub fn map_init(&self, slot: u32, npages: u32, base_gfn: u64) -> (Completion, MapMemInit) {
        let request = MapMemInit {
            slot,
            npages,
            base_gfn,
            user_va: 0,
        };
        let mut out = [0u8; size_of::<MapMemInit>()];
        let completion = self.call(ControlCode::MapMemInitialize, &to_bytes(&request), &mut out);
        (completion, read_struct(&out).unwrap())
    }

    /// First phase of `MapMemGetPvMap`: required table size in bytes.
    pub fn pv_map_size(&self, slot: u32) -> Result<u32, Status> {
        let request = GetPvMap { slot, tablesize: 0 };
        let mut out = [0u8; size_of::<GetPvMap>()];
        let completion = self.call(ControlCode::MapMemGetPvMap, &to_bytes(&request), &mut out);
        if !completion.is_success() {
            return Err(completion.status);
        }
        Ok(read_struct::<GetPvMap>(&out).unwrap().tablesize)
    }

    /// Second phase of `MapMemGetPvMap`: the entries behind the echoed header.
    pub fn pv_map(&self, slot: u32, tablesize: u32) -> Result<Vec<PfnEntry>, Status> {
        let request = GetPvMap { slot, tablesize };
        let header_len = size_of::<GetPvMap>();
        let mut out = vec![0u8; header_len + tablesize as usize];
        let completion = self.call(ControlCode::MapMemGetPvMap, &to_bytes(&request), &mut out);
        if !completion.is_success() {
            return Err(completion.status);
        }
        let header: GetPvMap = read_struct(&out).unwrap();
        assert_eq!(header.slot, slot);
        assert_eq!(header.tablesize, tablesize);
        Ok(out[header_len..completion.information]
            .chunks_exact(size_of::<PfnEntry>())
            .map(|chunk| read_struct(chunk).unwrap())
            .collect())
    }

    pub fn unmap(&self, slot: u32) -> Completion {
        self.call(ControlCode::UnmapMemGetPvMap, &slot.to_le_bytes(), &mut [])
    }
}
