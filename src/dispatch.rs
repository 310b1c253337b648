//! Control request dispatcher
//!
//! Every request copies a fixed payload in, performs one transition and
//! copies a fixed (or capped variable) payload out. Failures never escape
//! as panics: each ends as a [`Completion`] with a status and the number of
//! valid output bytes.

use std::mem::size_of;
use std::sync::{Arc, RwLock};

use byteorder::{ByteOrder, LittleEndian};
use hvport_protocol::{
    read_struct, write_struct, ControlCode, CreateVcpuRequest, DirtyLogHeader, DirtyLogRequest,
    GetPvMap, InterruptRequest, MapMemInit, MemoryRegionRequest, MsrList, PfnEntry, RegsBlock,
    RunBlock, SregsBlock, Status, TransferHeader, TranslateRequest,
};
use tracing::{debug, trace, warn};
use vm_memory::ByteValued;

use crate::engine::{Engine, EngineError, VcpuObject, VmObject};
use crate::memmap::PageAllocator;
use crate::resource::Descriptor;
use crate::session::SessionState;
use crate::{Error, Result};

/// Outcome of one control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub status: Status,
    /// Bytes of valid output
    pub information: usize,
}

impl Completion {
    pub fn success(information: usize) -> Self {
        Self {
            status: Status::Success,
            information,
        }
    }

    pub fn failed(status: Status) -> Self {
        Self {
            status,
            information: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl From<Result<usize>> for Completion {
    fn from(result: Result<usize>) -> Self {
        match result {
            Ok(information) => Completion::success(information),
            Err(e) => Completion::failed(e.status()),
        }
    }
}

fn decode<T: ByteValued + Default>(input: &[u8]) -> Result<T> {
    Ok(read_struct(input)?)
}

fn encode<T: ByteValued>(output: &mut [u8], value: &T) -> Result<usize> {
    Ok(write_struct(output, value)?)
}

fn require(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(Error::LengthMismatch {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_descriptor(input: &[u8]) -> Result<Descriptor> {
    require(input, size_of::<i32>())?;
    Ok(LittleEndian::read_i32(input))
}

fn write_i32(output: &mut [u8], value: i32) -> Result<usize> {
    require(output, size_of::<i32>())?;
    LittleEndian::write_i32(output, value);
    Ok(size_of::<i32>())
}

/// Serves control requests against one session
pub struct Dispatcher<'a> {
    state: &'a SessionState,
    engine: &'a dyn Engine,
    allocator: &'a dyn PageAllocator,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        state: &'a SessionState,
        engine: &'a dyn Engine,
        allocator: &'a dyn PageAllocator,
    ) -> Self {
        Self {
            state,
            engine,
            allocator,
        }
    }

    pub fn dispatch(&self, code: u32, input: &[u8], output: &mut [u8]) -> Completion {
        let request = match ControlCode::try_from(code) {
            Ok(request) => request,
            Err(_) => {
                warn!("Unsupported control code {:#x}", code);
                return Completion::failed(Status::UnsupportedRequest);
            }
        };
        trace!(
            "{} request: {} bytes in, {} bytes out",
            request,
            input.len(),
            output.len()
        );

        let completion = match request {
            ControlCode::GetApiVersion => Completion::success(0),
            ControlCode::GetMsrIndexList => self.get_msr_index_list(input, output).into(),
            ControlCode::CreateVm => self.create_vm(output).into(),
            ControlCode::CreateVcpu => self.create_vcpu(input, output).into(),
            ControlCode::SetMemoryRegion => self.set_memory_region(input, output).into(),
            ControlCode::GetDirtyLog => self.get_dirty_log(input, output).into(),
            ControlCode::Run => self.run(input, output),
            ControlCode::GetRegs => self.get_regs(input, output).into(),
            ControlCode::SetRegs => self.set_regs(input).into(),
            ControlCode::GetSregs => self.get_sregs(input, output).into(),
            ControlCode::SetSregs => self.set_sregs(input).into(),
            ControlCode::Translate => self.translate(input, output).into(),
            ControlCode::Interrupt => self.interrupt(input).into(),
            ControlCode::ReadGuest => self.read_guest(input, output).into(),
            ControlCode::WriteGuest => self.write_guest(input, output).into(),
            ControlCode::MapMemInitialize => self.map_mem_initialize(input, output),
            ControlCode::MapMemGetPvMap => self.map_mem_get_pv_map(input, output).into(),
            ControlCode::UnmapMemGetPvMap => self.unmap_mem(input, output).into(),
        };

        if !completion.is_success() {
            debug!("{} failed with {:?}", request, completion.status);
        }
        completion
    }

    fn vm(&self, descriptor: Descriptor) -> Result<Arc<dyn VmObject>> {
        Ok(Arc::clone(&self.state.resources().vm(descriptor)?.vm))
    }

    fn vcpu(&self, descriptor: Descriptor) -> Result<(Arc<dyn VcpuObject>, Arc<RwLock<()>>)> {
        let resources = self.state.resources();
        let entry = resources.vcpu(descriptor)?;
        Ok((Arc::clone(&entry.vcpu), Arc::clone(&entry.transfer_lock)))
    }

    fn get_msr_index_list(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let request: MsrList = decode(input)?;
        require(output, size_of::<MsrList>())?;

        let list = self.engine.msr_index_list();
        if request.nmsrs == 0 {
            return encode(
                output,
                &MsrList {
                    nmsrs: list.len() as u32,
                },
            );
        }

        let room = (output.len() - size_of::<MsrList>()) / size_of::<u32>();
        let indices = list.indices();
        let count = indices.len().min(request.nmsrs as usize).min(room);

        let header = size_of::<MsrList>();
        encode(output, &MsrList { nmsrs: count as u32 })?;
        LittleEndian::write_u32_into(
            &indices[..count],
            &mut output[header..header + count * size_of::<u32>()],
        );
        Ok(header + count * size_of::<u32>())
    }

    fn create_vm(&self, output: &mut [u8]) -> Result<usize> {
        require(output, size_of::<i32>())?;
        let vm = self.engine.create_vm()?;
        let descriptor = self.state.resources().insert_vm(vm)?;
        debug!("Created VM descriptor {}", descriptor);
        write_i32(output, descriptor)
    }

    fn create_vcpu(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let request: CreateVcpuRequest = decode(input)?;
        require(output, size_of::<i32>())?;

        let vm = self.vm(request.vm_fd)?;
        let id = u32::try_from(request.vcpu_id).map_err(|_| EngineError::InvalidArgument)?;
        let vcpu = vm.create_vcpu(id)?;
        let descriptor = self.state.resources().insert_vcpu(request.vm_fd, vcpu)?;
        debug!(
            "Created VCPU {} on VM {} as descriptor {}",
            id, request.vm_fd, descriptor
        );
        write_i32(output, descriptor)
    }

    fn set_memory_region(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let request: MemoryRegionRequest = decode(input)?;
        require(output, size_of::<MemoryRegionRequest>())?;

        self.vm(request.vm_fd)?.set_memory_region(&request.region)?;
        encode(output, &request)
    }

    fn get_dirty_log(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let request: DirtyLogRequest = decode(input)?;
        require(output, size_of::<DirtyLogHeader>())?;

        let bitmap = self.vm(request.vm_fd)?.get_dirty_log(request.slot)?;
        let header_len = size_of::<DirtyLogHeader>();
        let bitmap_bytes = bitmap.len() * size_of::<u64>();
        require(output, header_len + bitmap_bytes)?;

        encode(
            output,
            &DirtyLogHeader {
                vm_fd: request.vm_fd,
                slot: request.slot,
                bitmap_bytes: bitmap_bytes as u32,
                padding: 0,
            },
        )?;
        LittleEndian::write_u64_into(&bitmap, &mut output[header_len..header_len + bitmap_bytes]);
        Ok(header_len + bitmap_bytes)
    }

    fn run(&self, input: &[u8], output: &mut [u8]) -> Completion {
        let prepared = decode::<RunBlock>(input)
            .and_then(|block| require(output, size_of::<RunBlock>()).map(|_| block))
            .and_then(|block| self.vcpu(block.vcpu_fd).map(|(vcpu, _)| (block, vcpu)));
        let (mut block, vcpu) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Completion::failed(e.status()),
        };

        let status = match vcpu.run(&mut block) {
            Ok(()) => {
                block.errno = 0;
                block.ioctl_r = 0;
                Status::Success
            }
            Err(e) => {
                debug!("Run on VCPU {} failed: {}", block.vcpu_fd, e);
                block.errno = e.errno();
                block.ioctl_r = -1;
                Status::EngineError
            }
        };

        match encode(output, &block) {
            Ok(information) => Completion {
                status,
                information,
            },
            Err(e) => Completion::failed(e.status()),
        }
    }

    fn get_regs(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let descriptor = read_descriptor(input)?;
        require(output, size_of::<RegsBlock>())?;

        let (vcpu, _) = self.vcpu(descriptor)?;
        let block = RegsBlock {
            vcpu_fd: descriptor,
            padding: 0,
            regs: vcpu.get_regs()?,
        };
        encode(output, &block)
    }

    fn set_regs(&self, input: &[u8]) -> Result<usize> {
        let block: RegsBlock = decode(input)?;
        let (vcpu, _) = self.vcpu(block.vcpu_fd)?;
        vcpu.set_regs(&block.regs)?;
        Ok(0)
    }

    fn get_sregs(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let descriptor = read_descriptor(input)?;
        require(output, size_of::<SregsBlock>())?;

        let (vcpu, _) = self.vcpu(descriptor)?;
        let block = SregsBlock {
            vcpu_fd: descriptor,
            padding: 0,
            sregs: vcpu.get_sregs()?,
        };
        encode(output, &block)
    }

    fn set_sregs(&self, input: &[u8]) -> Result<usize> {
        let block: SregsBlock = decode(input)?;
        let (vcpu, _) = self.vcpu(block.vcpu_fd)?;
        vcpu.set_sregs(&block.sregs)?;
        Ok(0)
    }

    fn translate(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut request: TranslateRequest = decode(input)?;
        require(output, size_of::<TranslateRequest>())?;

        let (vcpu, _) = self.vcpu(request.vcpu_fd)?;
        request.tr = vcpu.translate(request.tr.linear_address)?;
        encode(output, &request)
    }

    fn interrupt(&self, input: &[u8]) -> Result<usize> {
        let request: InterruptRequest = decode(input)?;
        let (vcpu, _) = self.vcpu(request.vcpu_fd)?;
        vcpu.interrupt(request.irq.irq)?;
        Ok(0)
    }

    fn check_transfer_size(&self, size: u32) -> Result<usize> {
        let max = self.state.max_transfer_size();
        if size > max {
            return Err(Error::LengthMismatch {
                expected: max as usize,
                actual: size as usize,
            });
        }
        Ok(size as usize)
    }

    fn read_guest(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let header: TransferHeader = decode(input)?;
        let size = self.check_transfer_size(header.size)?;
        require(output, size)?;

        let (vcpu, transfer_lock) = self.vcpu(header.vcpu_fd)?;
        let _shared = transfer_lock.read().unwrap_or_else(|e| e.into_inner());
        Ok(vcpu.read_guest(header.gva, &mut output[..size])?)
    }

    fn write_guest(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let header: TransferHeader = decode(input)?;
        let size = self.check_transfer_size(header.size)?;
        let header_len = size_of::<TransferHeader>();
        if input.len() != header_len + size {
            return Err(Error::LengthMismatch {
                expected: header_len + size,
                actual: input.len(),
            });
        }
        require(output, size_of::<i32>())?;

        let (vcpu, transfer_lock) = self.vcpu(header.vcpu_fd)?;
        let written = {
            let _exclusive = transfer_lock.write().unwrap_or_else(|e| e.into_inner());
            vcpu.write_guest(header.gva, &input[header_len..])?
        };
        write_i32(output, written as i32)
    }

    fn map_mem_initialize(&self, input: &[u8], output: &mut [u8]) -> Completion {
        let prepared = decode::<MapMemInit>(input)
            .and_then(|request| require(output, size_of::<MapMemInit>()).map(|_| request));
        let mut request = match prepared {
            Ok(request) => request,
            Err(e) => return Completion::failed(e.status()),
        };

        let result = self.state.mappings().create_mapping(
            request.slot,
            request.npages,
            request.base_gfn,
            self.allocator,
        );
        let status = match result {
            Ok(user_va) => {
                request.user_va = user_va;
                Status::Success
            }
            Err(e @ Error::ResourceExhausted(_)) => {
                warn!("Memory-map slot {} not mapped: {}", request.slot, e);
                request.npages = 0;
                request.user_va = 0;
                e.status()
            }
            Err(e) => return Completion::failed(e.status()),
        };

        match encode(output, &request) {
            Ok(information) => Completion {
                status,
                information,
            },
            Err(e) => Completion::failed(e.status()),
        }
    }

    fn map_mem_get_pv_map(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut request: GetPvMap = decode(input)?;
        let entry_len = size_of::<PfnEntry>();

        if request.tablesize == 0 {
            require(output, size_of::<GetPvMap>())?;
            let pages = self.state.mappings().page_count(request.slot)?;
            request.tablesize = (pages * entry_len) as u32;
            return encode(output, &request);
        }

        // reply is the echoed header followed by the entries
        let header_len = size_of::<GetPvMap>();
        let table_len = request.tablesize as usize;
        require(output, header_len + table_len)?;
        let entries = self
            .state
            .mappings()
            .fill_pv_map(request.slot, table_len / entry_len)?;

        let (header, table) = output.split_at_mut(header_len);
        encode(header, &request)?;
        for (entry, chunk) in entries.iter().zip(table.chunks_exact_mut(entry_len)) {
            encode(chunk, entry)?;
        }
        Ok(header_len + entries.len() * entry_len)
    }

    fn unmap_mem(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        require(input, size_of::<u32>())?;
        let request = match decode::<GetPvMap>(input) {
            Ok(request) => request,
            Err(_) => GetPvMap {
                slot: LittleEndian::read_u32(input),
                tablesize: 0,
            },
        };
        self.state.mappings().close_mapping(request.slot)?;

        // echo the request when the caller left room for it
        if output.len() < size_of::<GetPvMap>() {
            return Ok(0);
        }
        encode(output, &request)
    }
}
