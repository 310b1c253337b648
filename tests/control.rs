//! Control-request tests against a session on the software engine
//!
//! Every request goes through `Session::control` with raw little-endian
//! buffers, the same path a device client uses.

#[path = "common/client.rs"]
mod client;

use std::mem::size_of;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use hvport::engine::soft::SoftEngine;
use hvport::protocol::{
    read_struct, to_bytes, ControlCode, DirtyLogHeader, DirtyLogRequest, GetPvMap,
    InterruptRequest, MemoryRegion, MemoryRegionRequest, PfnEntry, RegsBlock, RunBlock,
    SregsBlock, Status, TransferHeader, TranslateRequest, PAGE_SIZE,
};
use hvport::{Driver, DriverConfig};
use kvm_bindings::{
    kvm_regs, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT,
    KVM_MEM_LOG_DIRTY_PAGES,
};

use client::{Client, FailingAllocator, HeapAllocator};

fn driver() -> Driver {
    Driver::soft(DriverConfig::default())
        .unwrap()
        .with_allocator(Arc::new(HeapAllocator::default()))
}

// =============================================================================
// VM AND VCPU LIFECYCLE
// =============================================================================

#[test]
fn test_first_descriptors_are_zero() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);

    let vm = client.create_vm().unwrap();
    assert_eq!(vm, 0);
    assert_eq!(client.create_vcpu(vm, 0).unwrap(), 0);

    // separate namespaces, second VM gets the next index
    assert_eq!(client.create_vm().unwrap(), 1);
}

#[test]
fn test_create_vcpu_on_unknown_vm() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);

    assert_eq!(client.create_vcpu(5, 0), Err(Status::InvalidDescriptor));
    assert_eq!(client.create_vcpu(-1, 0), Err(Status::InvalidDescriptor));
    assert_eq!(session.state().resources().vcpu_count(), 0);
}

#[test]
fn test_duplicate_vcpu_id_is_engine_error() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);

    let vm = client.create_vm().unwrap();
    client.create_vcpu(vm, 0).unwrap();
    assert_eq!(client.create_vcpu(vm, 0), Err(Status::EngineError));
    assert_eq!(session.state().resources().vcpu_count(), 1);
}

#[test]
fn test_resource_slots_exhaust() {
    let driver = Driver::soft(DriverConfig::new().max_resource_slots(2)).unwrap();
    let session = driver.open().unwrap();
    let client = Client::new(&session);

    client.create_vm().unwrap();
    client.create_vm().unwrap();
    assert_eq!(client.create_vm(), Err(Status::ResourceExhausted));
}

#[test]
fn test_regs_round_trip() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let vm = client.create_vm().unwrap();
    let vcpu = client.create_vcpu(vm, 0).unwrap();

    let regs = kvm_regs {
        rax: 0x1122_3344_5566_7788,
        rbx: 2,
        rip: 0x1000,
        rsp: 0x8000,
        rflags: 0x2,
        ..Default::default()
    };
    assert!(client.set_regs(vcpu, regs).is_success());
    let read = client.get_regs(vcpu).unwrap();
    assert_eq!(read.rax, regs.rax);
    assert_eq!(read.rbx, regs.rbx);
    assert_eq!(read.rip, regs.rip);
    assert_eq!(read.rsp, regs.rsp);
    assert_eq!(read.rflags, regs.rflags);
}

#[test]
fn test_get_regs_short_output_is_length_mismatch() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let vm = client.create_vm().unwrap();
    let vcpu = client.create_vcpu(vm, 0).unwrap();

    let mut out = [0u8; 16];
    let completion = client.call(ControlCode::GetRegs, &vcpu.to_le_bytes(), &mut out);
    assert_eq!(completion.status, Status::LengthMismatch);
    assert_eq!(completion.information, 0);
}

#[test]
fn test_unknown_code_leaves_state_alone() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    client.create_vm().unwrap();

    let completion = session.control(0x0022_3fff, &[0u8; 64], &mut [0u8; 64]);
    assert_eq!(completion.status, Status::UnsupportedRequest);
    assert_eq!(session.state().resources().vm_count(), 1);
}

#[test]
fn test_close_empties_tables() {
    let allocator = Arc::new(HeapAllocator::default());
    let live = Arc::clone(&allocator.live);
    let driver = Driver::soft(DriverConfig::default())
        .unwrap()
        .with_allocator(allocator);
    let mut session = driver.open().unwrap();

    {
        let client = Client::new(&session);
        let vm = client.create_vm().unwrap();
        client.create_vcpu(vm, 0).unwrap();
        client.create_vcpu(vm, 1).unwrap();
        assert!(client.map_init(3, 2, 0x100).0.is_success());
    }
    assert_eq!(live.load(Ordering::SeqCst), 1);

    session.close();
    assert!(session.state().resources().is_empty());
    assert_eq!(session.state().mappings().active_count(), 0);
    assert_eq!(session.state().ledger().pinned_pages(), 0);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_closed_session_rejects_requests() {
    let engine = Arc::new(SoftEngine::default());
    let driver = Driver::new(DriverConfig::default(), engine.clone())
        .unwrap()
        .with_allocator(Arc::new(HeapAllocator::default()));
    let mut session = driver.open().unwrap();
    Client::new(&session).create_vm().unwrap();

    session.close();
    assert_eq!(engine.live_vms(), 0);
    {
        let client = Client::new(&session);
        assert_eq!(client.create_vm(), Err(Status::InvalidDescriptor));
        let (completion, _) = client.map_init(0, 1, 0);
        assert_eq!(completion.status, Status::InvalidDescriptor);
        assert_eq!(completion.information, 0);
    }
    assert!(session.state().resources().is_empty());
    assert_eq!(session.state().mappings().active_count(), 0);

    drop(session);
    assert_eq!(engine.live_vms(), 0);
}

#[test]
fn test_sessions_do_not_share_descriptors() {
    let driver = driver();
    let a = driver.open().unwrap();
    let b = driver.open().unwrap();

    let vm = Client::new(&a).create_vm().unwrap();
    assert_eq!(
        Client::new(&b).create_vcpu(vm, 0),
        Err(Status::InvalidDescriptor)
    );
}

/// Well-formed input for `code` addressed to descriptor `fd`.
fn request_for(code: ControlCode, fd: i32) -> Vec<u8> {
    match code {
        ControlCode::GetRegs | ControlCode::GetSregs => fd.to_le_bytes().to_vec(),
        ControlCode::SetRegs => to_bytes(&RegsBlock {
            vcpu_fd: fd,
            ..Default::default()
        }),
        ControlCode::SetSregs => to_bytes(&SregsBlock {
            vcpu_fd: fd,
            ..Default::default()
        }),
        ControlCode::Translate => to_bytes(&TranslateRequest {
            vcpu_fd: fd,
            ..Default::default()
        }),
        ControlCode::Interrupt => to_bytes(&InterruptRequest {
            vcpu_fd: fd,
            ..Default::default()
        }),
        ControlCode::Run => to_bytes(&RunBlock {
            vcpu_fd: fd,
            ..Default::default()
        }),
        ControlCode::ReadGuest => to_bytes(&TransferHeader {
            vcpu_fd: fd,
            size: 16,
            gva: 0x1000,
        }),
        ControlCode::WriteGuest => {
            let mut input = to_bytes(&TransferHeader {
                vcpu_fd: fd,
                size: 4,
                gva: 0x1000,
            });
            input.extend_from_slice(b"gone");
            input
        }
        ControlCode::SetMemoryRegion => to_bytes(&MemoryRegionRequest {
            vm_fd: fd,
            padding: 0,
            region: MemoryRegion {
                slot: 1,
                flags: 0,
                guest_phys_addr: 0x10_0000,
                memory_size: 0x1000,
            },
        }),
        ControlCode::GetDirtyLog => to_bytes(&DirtyLogRequest { vm_fd: fd, slot: 0 }),
        _ => unreachable!("{code:?} takes no descriptor"),
    }
}

#[test]
fn test_unresolved_descriptors_produce_no_output() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (vm, vcpu) = client.real_mode_guest(&[0xf4]);

    let released_vcpu = client.create_vcpu(vm, 1).unwrap();
    session.state().resources().release_vcpu(released_vcpu).unwrap();
    let released_vm = client.create_vm().unwrap();
    session.state().resources().release_vm(released_vm).unwrap();

    let vcpu_codes = [
        ControlCode::GetRegs,
        ControlCode::SetRegs,
        ControlCode::GetSregs,
        ControlCode::SetSregs,
        ControlCode::Translate,
        ControlCode::Interrupt,
        ControlCode::Run,
        ControlCode::ReadGuest,
        ControlCode::WriteGuest,
    ];
    let vm_codes = [ControlCode::SetMemoryRegion, ControlCode::GetDirtyLog];

    let cases = vcpu_codes
        .iter()
        .flat_map(|&code| [(code, 9), (code, -1), (code, released_vcpu)])
        .chain(
            vm_codes
                .iter()
                .flat_map(|&code| [(code, 9), (code, -1), (code, released_vm)]),
        );
    for (code, fd) in cases {
        let mut out = [0xccu8; 512];
        let completion = client.call(code, &request_for(code, fd), &mut out);
        assert_eq!(
            completion.status,
            Status::InvalidDescriptor,
            "{code:?} on descriptor {fd:#x}"
        );
        assert_eq!(completion.information, 0, "{code:?} on descriptor {fd:#x}");
        assert!(out.iter().all(|&b| b == 0xcc), "{code:?} wrote output");
    }

    // live objects are untouched
    assert_eq!(client.get_regs(vcpu).unwrap().rip, 0x1000);
    assert_eq!(session.state().resources().vm_count(), 1);
    assert_eq!(session.state().resources().vcpu_count(), 1);
}

// =============================================================================
// RUN
// =============================================================================

#[test]
fn test_run_without_memory_reports_engine_error() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let vm = client.create_vm().unwrap();
    let vcpu = client.create_vcpu(vm, 0).unwrap();

    let mut block = RunBlock {
        vcpu_fd: vcpu,
        ..Default::default()
    };
    let completion = client.run(&mut block);
    assert_eq!(completion.status, Status::EngineError);
    assert_eq!(completion.information, size_of::<RunBlock>());
    assert_eq!(block.errno, libc::EFAULT);
    assert_eq!(block.ioctl_r, -1);

    // the session stays usable
    assert!(client.get_regs(vcpu).is_ok());
    assert_eq!(client.create_vm().unwrap(), 1);
}

#[test]
fn test_run_to_halt() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (_, vcpu) = client.real_mode_guest(&[0x90, 0x90, 0xf4]);

    let mut block = RunBlock {
        vcpu_fd: vcpu,
        ..Default::default()
    };
    let completion = client.run(&mut block);
    assert!(completion.is_success());
    assert_eq!(block.exit_reason, KVM_EXIT_HLT);
    assert_eq!(block.errno, 0);
    assert_eq!(block.ioctl_r, 0);
    assert_eq!(client.get_regs(vcpu).unwrap().rip, 0x1003);
}

#[test]
fn test_run_with_instruction_pointer_at_u64_max() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let vm = client.create_vm().unwrap();
    let completion = client.set_memory_region(
        vm,
        MemoryRegion {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0xffff_f000,
            memory_size: 0x1000,
        },
    );
    assert!(completion.is_success());
    let vcpu = client.create_vcpu(vm, 0).unwrap();

    let mut sregs = client.get_sregs(vcpu);
    sregs.cs.base = 0;
    assert!(client.set_sregs(vcpu, sregs).is_success());
    let mut regs = client.get_regs(vcpu).unwrap();
    regs.rip = u64::MAX;
    assert!(client.set_regs(vcpu, regs).is_success());
    assert!(client.write_guest(vcpu, 0xffff_ffff, &[0x90]).is_success());

    let mut block = RunBlock {
        vcpu_fd: vcpu,
        ..Default::default()
    };
    let completion = client.run(&mut block);
    assert!(completion.is_success());
    assert_eq!(block.exit_reason, KVM_EXIT_INTERNAL_ERROR);
    assert_eq!(client.get_regs(vcpu).unwrap().rip, 0);
}

#[test]
fn test_port_io_exits_and_completion() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    // out 0x80, al; in al, 0x60; hlt
    let (_, vcpu) = client.real_mode_guest(&[0xe6, 0x80, 0xe4, 0x60, 0xf4]);

    let mut regs = client.get_regs(vcpu).unwrap();
    regs.rax = 0x42;
    client.set_regs(vcpu, regs);

    let mut block = RunBlock {
        vcpu_fd: vcpu,
        ..Default::default()
    };
    assert!(client.run(&mut block).is_success());
    assert_eq!(block.exit_reason, KVM_EXIT_IO);
    assert_eq!(u32::from(block.io.direction), KVM_EXIT_IO_OUT);
    assert_eq!(block.io.port, 0x80);
    assert_eq!(block.io.data[0], 0x42);

    assert!(client.run(&mut block).is_success());
    assert_eq!(block.exit_reason, KVM_EXIT_IO);
    assert_eq!(u32::from(block.io.direction), KVM_EXIT_IO_IN);
    assert_eq!(block.io.port, 0x60);

    // data for the IN travels back with the next run
    block.io.data[0] = 0x99;
    assert!(client.run(&mut block).is_success());
    assert_eq!(block.exit_reason, KVM_EXIT_HLT);
    assert_eq!(client.get_regs(vcpu).unwrap().rax & 0xff, 0x99);
}

#[test]
fn test_unknown_instruction_is_internal_error() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (_, vcpu) = client.real_mode_guest(&[0x0f, 0x0b]);

    let mut block = RunBlock {
        vcpu_fd: vcpu,
        ..Default::default()
    };
    assert!(client.run(&mut block).is_success());
    assert_eq!(block.exit_reason, KVM_EXIT_INTERNAL_ERROR);
}

#[test]
fn test_run_short_output_has_no_side_effects() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (_, vcpu) = client.real_mode_guest(&[0xf4]);

    let block = RunBlock {
        vcpu_fd: vcpu,
        ..Default::default()
    };
    let mut out = [0u8; 8];
    let completion = client.call(ControlCode::Run, &to_bytes(&block), &mut out);
    assert_eq!(completion.status, Status::LengthMismatch);
    assert_eq!(client.get_regs(vcpu).unwrap().rip, 0x1000);
}

// =============================================================================
// GUEST MEMORY
// =============================================================================

#[test]
fn test_guest_read_write() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (_, vcpu) = client.real_mode_guest(&[0xf4]);

    let mut input = to_bytes(&TransferHeader {
        vcpu_fd: vcpu,
        size: 5,
        gva: 0x3000,
    });
    input.extend_from_slice(b"hello");
    let mut out = [0u8; 4];
    let completion = client.call(ControlCode::WriteGuest, &input, &mut out);
    assert_eq!(completion.information, 4);
    assert_eq!(i32::from_le_bytes(out), 5);

    let (completion, data) = client.read_guest(vcpu, 0x3000, 5);
    assert!(completion.is_success());
    assert_eq!(data, b"hello");
}

#[test]
fn test_write_guest_length_mismatch_writes_nothing() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (_, vcpu) = client.real_mode_guest(&[0xf4]);

    // header claims 8 bytes, payload carries 4
    let mut input = to_bytes(&TransferHeader {
        vcpu_fd: vcpu,
        size: 8,
        gva: 0x3000,
    });
    input.extend_from_slice(&[0xaa; 4]);
    let completion = client.call(ControlCode::WriteGuest, &input, &mut [0u8; 4]);
    assert_eq!(completion.status, Status::LengthMismatch);

    let (_, data) = client.read_guest(vcpu, 0x3000, 4);
    assert_eq!(data, [0u8; 4]);
}

#[test]
fn test_transfer_over_limit_rejected() {
    let driver = Driver::soft(DriverConfig::new().max_transfer_size(16)).unwrap();
    let session = driver.open().unwrap();
    let client = Client::new(&session);
    let (_, vcpu) = client.real_mode_guest(&[0xf4]);

    let (completion, _) = client.read_guest(vcpu, 0x1000, 32);
    assert_eq!(completion.status, Status::LengthMismatch);
    assert_eq!(
        client.write_guest(vcpu, 0x1000, &[0u8; 17]).status,
        Status::LengthMismatch
    );
}

#[test]
fn test_read_guest_stops_at_end_of_ram() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (_, vcpu) = client.real_mode_guest(&[0xf4]);

    let (completion, data) = client.read_guest(vcpu, 0xf000, 0x2000);
    assert!(completion.is_success());
    assert_eq!(data.len(), 0x1000);

    let (completion, _) = client.read_guest(vcpu, 0x20000, 16);
    assert_eq!(completion.status, Status::EngineError);
}

#[test]
fn test_translate_real_mode() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (_, vcpu) = client.real_mode_guest(&[0xf4]);

    let mut request = TranslateRequest {
        vcpu_fd: vcpu,
        ..Default::default()
    };
    request.tr.linear_address = 0x1234;
    let mut out = [0u8; size_of::<TranslateRequest>()];
    let completion = client.call(ControlCode::Translate, &to_bytes(&request), &mut out);
    assert!(completion.is_success());

    let reply: TranslateRequest = read_struct(&out).unwrap();
    assert_eq!(reply.vcpu_fd, vcpu);
    assert_eq!(reply.tr.physical_address, 0x1234);
    assert_eq!(reply.tr.valid, 1);
}

#[test]
fn test_dirty_log_through_session() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (vm, vcpu) = client.real_mode_guest(&[0xf4]);

    let completion = client.set_memory_region(
        vm,
        MemoryRegion {
            slot: 1,
            flags: KVM_MEM_LOG_DIRTY_PAGES,
            guest_phys_addr: 0x10000,
            memory_size: 0x10000,
        },
    );
    assert!(completion.is_success());
    assert!(client.write_guest(vcpu, 0x10000 + 2 * PAGE_SIZE, &[1]).is_success());
    assert!(client.write_guest(vcpu, 0x10000 + 15 * PAGE_SIZE, &[1]).is_success());

    let request = DirtyLogRequest { vm_fd: vm, slot: 1 };
    let mut out = [0u8; 64];
    let completion = client.call(ControlCode::GetDirtyLog, &to_bytes(&request), &mut out);
    assert!(completion.is_success());

    let header: DirtyLogHeader = read_struct(&out).unwrap();
    assert_eq!(header.slot, 1);
    assert_eq!(header.bitmap_bytes, 8);
    assert_eq!(completion.information, size_of::<DirtyLogHeader>() + 8);
    let bitmap = LittleEndian::read_u64(&out[size_of::<DirtyLogHeader>()..]);
    assert_eq!(bitmap, (1 << 2) | (1 << 15));

    // taking the log clears it
    let completion = client.call(ControlCode::GetDirtyLog, &to_bytes(&request), &mut out);
    assert!(completion.is_success());
    assert_eq!(LittleEndian::read_u64(&out[size_of::<DirtyLogHeader>()..]), 0);
}

#[test]
fn test_overlapping_region_rejected() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let vm = client.create_vm().unwrap();
    client.add_ram(vm, 0x10000);

    let completion = client.set_memory_region(
        vm,
        MemoryRegion {
            slot: 1,
            flags: 0,
            guest_phys_addr: 0x8000,
            memory_size: 0x10000,
        },
    );
    assert_eq!(completion.status, Status::EngineError);
}

// =============================================================================
// MEMORY MAP
// =============================================================================

#[test]
fn test_map_then_pv_map_then_unmap() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);

    let (completion, reply) = client.map_init(0, 4, 0x1000);
    assert!(completion.is_success());
    assert_eq!(completion.information, 24);
    assert_eq!(reply.npages, 4);
    assert_ne!(reply.user_va, 0);
    assert_eq!(session.state().ledger().pinned_pages(), 4);

    let tablesize = client.pv_map_size(0).unwrap();
    assert_eq!(tablesize, 64);

    let entries = client.pv_map(0, tablesize).unwrap();
    assert_eq!(entries.len(), 4);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.virt, reply.user_va + i as u64 * PAGE_SIZE);
        assert_ne!(entry.phys, 0);
    }

    assert!(client.unmap(0).is_success());
    assert_eq!(client.pv_map_size(0).unwrap(), 0);
    assert_eq!(session.state().ledger().pinned_pages(), 0);
}

#[test]
fn test_pv_map_reply_starts_with_request_header() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    let (_, reply) = client.map_init(3, 2, 0x40);

    let request = GetPvMap {
        slot: 3,
        tablesize: 32,
    };
    let mut out = [0u8; 8 + 32];
    let completion = client.call(ControlCode::MapMemGetPvMap, &to_bytes(&request), &mut out);
    assert!(completion.is_success());
    assert_eq!(completion.information, 8 + 32);

    let header: GetPvMap = read_struct(&out).unwrap();
    assert_eq!(header.slot, 3);
    assert_eq!(header.tablesize, 32);
    let first: PfnEntry = read_struct(&out[8..]).unwrap();
    assert_eq!(first.virt, reply.user_va);

    // entries alone no longer fit
    let mut short = [0u8; 32];
    let completion = client.call(ControlCode::MapMemGetPvMap, &to_bytes(&request), &mut short);
    assert_eq!(completion.status, Status::LengthMismatch);
    assert_eq!(completion.information, 0);
}

#[test]
fn test_unmap_echoes_request() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    client.map_init(5, 1, 0);

    let request = GetPvMap {
        slot: 5,
        tablesize: 16,
    };
    let mut out = [0u8; 8];
    let completion = client.call(ControlCode::UnmapMemGetPvMap, &to_bytes(&request), &mut out);
    assert!(completion.is_success());
    assert_eq!(completion.information, 8);
    let echoed: GetPvMap = read_struct(&out).unwrap();
    assert_eq!(echoed.slot, 5);
    assert_eq!(echoed.tablesize, 16);
    assert_eq!(client.pv_map_size(5).unwrap(), 0);
}

#[test]
fn test_pv_map_zeroes_pages() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);

    let (_, reply) = client.map_init(2, 1, 0);
    client.pv_map(2, 16).unwrap();

    // the heap allocator fills fresh pages with 0x5a
    let page =
        unsafe { std::slice::from_raw_parts(reply.user_va as *const u8, PAGE_SIZE as usize) };
    assert!(page.iter().all(|&b| b == 0));
}

#[test]
fn test_pv_map_capped_by_table_size() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);

    client.map_init(1, 8, 0);
    let entries = client.pv_map(1, 3 * 16).unwrap();
    assert_eq!(entries.len(), 3);
}

#[test]
fn test_remap_replaces_slot() {
    let allocator = Arc::new(HeapAllocator::default());
    let live = Arc::clone(&allocator.live);
    let driver = Driver::soft(DriverConfig::default())
        .unwrap()
        .with_allocator(allocator);
    let session = driver.open().unwrap();
    let client = Client::new(&session);

    client.map_init(0, 4, 0);
    client.map_init(0, 2, 0x10);
    assert_eq!(live.load(Ordering::SeqCst), 1);
    assert_eq!(client.pv_map_size(0).unwrap(), 32);
    assert_eq!(session.state().ledger().pinned_pages(), 2);
}

#[test]
fn test_slot_out_of_range() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);

    let (completion, _) = client.map_init(32, 1, 0);
    assert_eq!(completion.status, Status::SlotOutOfRange);
    assert_eq!(completion.information, 0);
    assert_eq!(client.pv_map_size(32), Err(Status::SlotOutOfRange));
    assert_eq!(client.unmap(32).status, Status::SlotOutOfRange);
}

#[test]
fn test_pin_failure_reports_exhaustion() {
    let driver = Driver::soft(DriverConfig::default())
        .unwrap()
        .with_allocator(Arc::new(FailingAllocator));
    let session = driver.open().unwrap();
    let client = Client::new(&session);

    let (completion, reply) = client.map_init(0, 4, 0x1000);
    assert_eq!(completion.status, Status::ResourceExhausted);
    assert_eq!(completion.information, 24);
    assert_eq!(reply.npages, 0);
    assert_eq!(reply.user_va, 0);
    assert_eq!(client.pv_map_size(0).unwrap(), 0);
}

#[test]
fn test_unmap_empty_slot_succeeds() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);
    assert!(client.unmap(7).is_success());
}

#[test]
fn test_api_version_and_msr_list() {
    let session = driver().open().unwrap();
    let client = Client::new(&session);

    let completion = client.call(ControlCode::GetApiVersion, &[], &mut []);
    assert!(completion.is_success());
    assert_eq!(completion.information, 0);

    let mut out = [0u8; 4];
    let completion = client.call(ControlCode::GetMsrIndexList, &0u32.to_le_bytes(), &mut out);
    assert!(completion.is_success());
    assert!(LittleEndian::read_u32(&out) > 0);
}
