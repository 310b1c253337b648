//! Fixed-layout wire types for hvport control requests.
//!
//! This crate is the single source of truth for the binary request/response
//! layouts exchanged between the hvport driver and a user-mode monitor that
//! speaks the Unix VMM ioctl API. Both sides depend on it so the structs are
//! never duplicated.
//!
//! ## Wire Format
//!
//! Every request is a control code plus one caller-supplied buffer in and one
//! buffer out:
//!
//! ```text
//! ┌───────────────────┬────────────────────────┬─────────────────────────┐
//! │ control code (u32)│ input struct (fixed)   │ output struct (fixed or │
//! │  CTL_CODE(...)    │ [+ trailing payload]   │  capped variable size)  │
//! └───────────────────┴────────────────────────┴─────────────────────────┘
//! ```
//!
//! - **control code**: a [`ControlCode`], encoded as a Windows `CTL_CODE` value.
//! - **structs**: `#[repr(C)]`, native little-endian, copied byte for byte. Every
//!   struct spells out its padding so no byte on the wire is undefined.
//! - **completion**: a [`Status`] plus the number of valid output bytes.

use std::fmt;
use std::mem::size_of;

use kvm_bindings::{kvm_interrupt, kvm_regs, kvm_sregs, kvm_translation};
use vm_memory::ByteValued;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding or encoding a control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A buffer is shorter than the struct that must be copied through it.
    Truncated { expected: usize, actual: usize },
    /// The control code does not map to a known [`ControlCode`].
    UnknownControlCode(u32),
    /// The status value does not map to a known [`Status`].
    UnknownStatus(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Truncated { expected, actual } => {
                write!(f, "Buffer too short: need {} bytes, got {}", expected, actual)
            }
            ProtocolError::UnknownControlCode(c) => write!(f, "Unknown control code: {:#x}", c),
            ProtocolError::UnknownStatus(s) => write!(f, "Unknown status: {:#x}", s),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// API version reported to Unix-VMM clients.
pub const API_VERSION: i32 = 12;

/// Guest and host page size.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Device type used for every hvport control code.
pub const FILE_DEVICE_UNKNOWN: u32 = 0x22;

/// Builds a buffered, any-access control code for `function`.
pub const fn ctl_code(function: u32) -> u32 {
    const METHOD_BUFFERED: u32 = 0;
    const FILE_ANY_ACCESS: u32 = 0;
    (FILE_DEVICE_UNKNOWN << 16) | (FILE_ANY_ACCESS << 14) | (function << 2) | METHOD_BUFFERED
}

// ---------------------------------------------------------------------------
// ControlCode
// ---------------------------------------------------------------------------

/// Control codes understood by the driver.
///
/// Requests inherited from the Unix VMM API reuse the KVM ioctl number as the
/// function; driver-specific requests live at `0x900` and above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlCode {
    GetApiVersion = ctl_code(0x00),
    CreateVm = ctl_code(0x01),
    GetMsrIndexList = ctl_code(0x02),
    SetMemoryRegion = ctl_code(0x40),
    CreateVcpu = ctl_code(0x41),
    GetDirtyLog = ctl_code(0x42),
    Run = ctl_code(0x80),
    GetRegs = ctl_code(0x81),
    SetRegs = ctl_code(0x82),
    GetSregs = ctl_code(0x83),
    SetSregs = ctl_code(0x84),
    Translate = ctl_code(0x85),
    Interrupt = ctl_code(0x86),
    ReadGuest = ctl_code(0x900),
    WriteGuest = ctl_code(0x901),
    MapMemInitialize = ctl_code(0x902),
    MapMemGetPvMap = ctl_code(0x903),
    UnmapMemGetPvMap = ctl_code(0x904),
}

impl ControlCode {
    /// Every control code, in function-number order.
    pub const ALL: [ControlCode; 18] = [
        ControlCode::GetApiVersion,
        ControlCode::CreateVm,
        ControlCode::GetMsrIndexList,
        ControlCode::SetMemoryRegion,
        ControlCode::CreateVcpu,
        ControlCode::GetDirtyLog,
        ControlCode::Run,
        ControlCode::GetRegs,
        ControlCode::SetRegs,
        ControlCode::GetSregs,
        ControlCode::SetSregs,
        ControlCode::Translate,
        ControlCode::Interrupt,
        ControlCode::ReadGuest,
        ControlCode::WriteGuest,
        ControlCode::MapMemInitialize,
        ControlCode::MapMemGetPvMap,
        ControlCode::UnmapMemGetPvMap,
    ];

    /// Raw wire value.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for ControlCode {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        ControlCode::ALL
            .iter()
            .copied()
            .find(|c| c.code() == code)
            .ok_or(ProtocolError::UnknownControlCode(code))
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlCode::GetApiVersion => "GET_API_VERSION",
            ControlCode::CreateVm => "CREATE_VM",
            ControlCode::GetMsrIndexList => "GET_MSR_INDEX_LIST",
            ControlCode::SetMemoryRegion => "SET_MEMORY_REGION",
            ControlCode::CreateVcpu => "CREATE_VCPU",
            ControlCode::GetDirtyLog => "GET_DIRTY_LOG",
            ControlCode::Run => "RUN",
            ControlCode::GetRegs => "GET_REGS",
            ControlCode::SetRegs => "SET_REGS",
            ControlCode::GetSregs => "GET_SREGS",
            ControlCode::SetSregs => "SET_SREGS",
            ControlCode::Translate => "TRANSLATE",
            ControlCode::Interrupt => "INTERRUPT",
            ControlCode::ReadGuest => "READ_GUEST",
            ControlCode::WriteGuest => "WRITE_GUEST",
            ControlCode::MapMemInitialize => "MAPMEM_INITIALIZE",
            ControlCode::MapMemGetPvMap => "MAPMEM_GETPVMAP",
            ControlCode::UnmapMemGetPvMap => "UNMAPMEM_GETPVMAP",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Completion status of a control request, as NTSTATUS values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Success = 0x0000_0000,
    /// The engine returned a negative result.
    EngineError = 0xC000_0001,
    /// A buffer length did not match what the request requires.
    LengthMismatch = 0xC000_0004,
    /// A VM or VCPU descriptor did not resolve.
    InvalidDescriptor = 0xC000_0008,
    /// A memory-map slot index was out of range.
    SlotOutOfRange = 0xC000_000D,
    /// The control code is not recognised.
    UnsupportedRequest = 0xC000_0010,
    /// No free resource slot, engine capacity, or pinnable memory.
    ResourceExhausted = 0xC000_009A,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl TryFrom<u32> for Status {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0x0000_0000 => Ok(Status::Success),
            0xC000_0001 => Ok(Status::EngineError),
            0xC000_0004 => Ok(Status::LengthMismatch),
            0xC000_0008 => Ok(Status::InvalidDescriptor),
            0xC000_000D => Ok(Status::SlotOutOfRange),
            0xC000_0010 => Ok(Status::UnsupportedRequest),
            0xC000_009A => Ok(Status::ResourceExhausted),
            _ => Err(ProtocolError::UnknownStatus(code)),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response structs
// ---------------------------------------------------------------------------

/// `CreateVcpu` input.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateVcpuRequest {
    pub vm_fd: i32,
    /// VCPU id inside the VM.
    pub vcpu_id: i32,
}

/// Legacy guest memory region, as the Unix API's `kvm_memory_region`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
}

/// `SetMemoryRegion` input and output.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRegionRequest {
    pub vm_fd: i32,
    pub padding: u32,
    pub region: MemoryRegion,
}

/// `GetDirtyLog` input.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyLogRequest {
    pub vm_fd: i32,
    pub slot: u32,
}

/// `GetDirtyLog` output header; `bitmap_bytes` bytes of bitmap follow it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyLogHeader {
    pub vm_fd: i32,
    pub slot: u32,
    pub bitmap_bytes: u32,
    pub padding: u32,
}

/// `GetMsrIndexList` header; `nmsrs` little-endian `u32` indices may follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrList {
    pub nmsrs: u32,
}

/// General purpose registers tagged with the VCPU they belong to.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegsBlock {
    pub vcpu_fd: i32,
    pub padding: u32,
    pub regs: kvm_regs,
}

/// Special registers tagged with the VCPU they belong to.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SregsBlock {
    pub vcpu_fd: i32,
    pub padding: u32,
    pub sregs: kvm_sregs,
}

/// `Translate` input and output.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslateRequest {
    pub vcpu_fd: i32,
    pub padding: u32,
    pub tr: kvm_translation,
}

/// `Interrupt` input.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptRequest {
    pub vcpu_fd: i32,
    pub irq: kvm_interrupt,
}

/// Port I/O exit data. `data` carries the bytes written by the guest on
/// `OUT`, and the bytes the monitor supplies on the next run after `IN`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoExit {
    /// `KVM_EXIT_IO_IN` or `KVM_EXIT_IO_OUT`.
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data: [u8; 8],
}

/// MMIO exit data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmioExit {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: u8,
    pub padding: [u8; 3],
}

/// The shared run block: `Run` input and output.
///
/// `errno` and `ioctl_r` report a failure of the run call itself, separately
/// from the request status, so a caller can tell "the request failed" apart
/// from "the guest exited with an error".
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunBlock {
    pub vcpu_fd: i32,
    pub errno: i32,
    pub ioctl_r: i32,
    /// One of the `KVM_EXIT_*` reasons.
    pub exit_reason: u32,
    pub request_interrupt_window: u8,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub padding: [u8; 5],
    pub cr8: u64,
    pub apic_base: u64,
    pub io: IoExit,
    pub mmio: MmioExit,
    pub hardware_entry_failure_reason: u64,
    pub internal_suberror: u32,
    pub padding2: u32,
}

impl RunBlock {
    /// Clears every exit field, keeping what the caller supplied for entry.
    pub fn clear_exit(&mut self) {
        self.errno = 0;
        self.ioctl_r = 0;
        self.exit_reason = 0;
        self.mmio = MmioExit::default();
        self.hardware_entry_failure_reason = 0;
        self.internal_suberror = 0;
    }
}

/// Header shared by `ReadGuest` and `WriteGuest`; a write carries exactly
/// `size` payload bytes after it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferHeader {
    pub vcpu_fd: i32,
    pub size: u32,
    pub gva: u64,
}

/// `MapMemInitialize` input and output.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapMemInit {
    pub slot: u32,
    pub npages: u32,
    pub base_gfn: u64,
    /// Filled in on output; zero when the mapping could not be created.
    pub user_va: u64,
}

/// `MapMemGetPvMap` / `UnmapMemGetPvMap` header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetPvMap {
    pub slot: u32,
    /// Size in bytes of the [`PfnEntry`] table that follows.
    pub tablesize: u32,
}

/// One page of a mapping: where the caller sees it, and its host frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PfnEntry {
    pub virt: u64,
    pub phys: u64,
}

// SAFETY: every type below is `#[repr(C)]`, built only from integers, byte
// arrays and kvm-bindings register structs, with all padding declared as
// explicit fields, so any byte pattern is a valid value.
unsafe impl ByteValued for CreateVcpuRequest {}
unsafe impl ByteValued for MemoryRegion {}
unsafe impl ByteValued for MemoryRegionRequest {}
unsafe impl ByteValued for DirtyLogRequest {}
unsafe impl ByteValued for DirtyLogHeader {}
unsafe impl ByteValued for MsrList {}
unsafe impl ByteValued for RegsBlock {}
unsafe impl ByteValued for SregsBlock {}
unsafe impl ByteValued for TranslateRequest {}
unsafe impl ByteValued for InterruptRequest {}
unsafe impl ByteValued for IoExit {}
unsafe impl ByteValued for MmioExit {}
unsafe impl ByteValued for RunBlock {}
unsafe impl ByteValued for TransferHeader {}
unsafe impl ByteValued for MapMemInit {}
unsafe impl ByteValued for GetPvMap {}
unsafe impl ByteValued for PfnEntry {}

// ---------------------------------------------------------------------------
// Buffer helpers
// ---------------------------------------------------------------------------

/// Copies a `T` out of the front of `buf`.
pub fn read_struct<T: ByteValued + Default>(buf: &[u8]) -> Result<T, ProtocolError> {
    let size = size_of::<T>();
    if buf.len() < size {
        return Err(ProtocolError::Truncated {
            expected: size,
            actual: buf.len(),
        });
    }
    let mut value = T::default();
    value.as_mut_slice().copy_from_slice(&buf[..size]);
    Ok(value)
}

/// Copies `value` into the front of `buf`, returning the bytes written.
pub fn write_struct<T: ByteValued>(buf: &mut [u8], value: &T) -> Result<usize, ProtocolError> {
    let bytes = value.as_slice();
    if buf.len() < bytes.len() {
        return Err(ProtocolError::Truncated {
            expected: bytes.len(),
            actual: buf.len(),
        });
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

/// Serializes `value` into a fresh buffer. Handy on the client side.
pub fn to_bytes<T: ByteValued>(value: &T) -> Vec<u8> {
    value.as_slice().to_vec()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
