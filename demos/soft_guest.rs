//! Drive a real-mode guest on the software engine through control requests.
//!
//! The guest reads one byte from port 0x60 and echoes it to port 0xe9, once
//! per character of the message, then halts. Set `RUST_LOG=debug` to see the
//! driver's own logging.

use std::mem::size_of;

use hvport::protocol::{
    read_struct, to_bytes, ControlCode, CreateVcpuRequest, MemoryRegion, MemoryRegionRequest,
    RegsBlock, RunBlock, SregsBlock, TransferHeader,
};
use hvport::{Driver, DriverConfig, Session};
use kvm_bindings::{KVM_EXIT_HLT, KVM_EXIT_IO, KVM_EXIT_IO_IN};

const MESSAGE: &[u8] = b"hello from hvport\n";
const CODE_ADDR: u64 = 0x1000;

fn call(session: &Session, code: ControlCode, input: &[u8], output: &mut [u8]) -> usize {
    let completion = session.control(code.code(), input, output);
    assert!(completion.is_success(), "{code} failed: {:?}", completion.status);
    completion.information
}

fn main() -> hvport::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let driver = Driver::soft(DriverConfig::default())?;
    let mut session = driver.open()?;

    let mut out = [0u8; 4];
    call(&session, ControlCode::CreateVm, &[], &mut out);
    let vm_fd = i32::from_le_bytes(out);

    let region = MemoryRegionRequest {
        vm_fd,
        padding: 0,
        region: MemoryRegion {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: 0x10000,
        },
    };
    let mut echo = [0u8; size_of::<MemoryRegionRequest>()];
    call(&session, ControlCode::SetMemoryRegion, &to_bytes(&region), &mut echo);

    let request = CreateVcpuRequest { vm_fd, vcpu_id: 0 };
    call(&session, ControlCode::CreateVcpu, &to_bytes(&request), &mut out);
    let vcpu_fd = i32::from_le_bytes(out);

    // flat real mode: CS base 0, execution starts at CODE_ADDR
    let mut sregs_out = [0u8; size_of::<SregsBlock>()];
    call(&session, ControlCode::GetSregs, &vcpu_fd.to_le_bytes(), &mut sregs_out);
    let mut sregs: SregsBlock = read_struct(&sregs_out).unwrap_or_default();
    sregs.sregs.cs.base = 0;
    sregs.sregs.cs.selector = 0;
    call(&session, ControlCode::SetSregs, &to_bytes(&sregs), &mut []);

    let mut regs_out = [0u8; size_of::<RegsBlock>()];
    call(&session, ControlCode::GetRegs, &vcpu_fd.to_le_bytes(), &mut regs_out);
    let mut regs: RegsBlock = read_struct(&regs_out).unwrap_or_default();
    regs.regs.rip = CODE_ADDR;
    call(&session, ControlCode::SetRegs, &to_bytes(&regs), &mut []);

    // in al, 0x60; out 0xe9, al; ... hlt
    let mut code: Vec<u8> = MESSAGE.iter().flat_map(|_| [0xe4, 0x60, 0xe6, 0xe9]).collect();
    code.push(0xf4);
    let mut input = to_bytes(&TransferHeader {
        vcpu_fd,
        size: code.len() as u32,
        gva: CODE_ADDR,
    });
    input.extend_from_slice(&code);
    call(&session, ControlCode::WriteGuest, &input, &mut out);

    let mut block = RunBlock {
        vcpu_fd,
        ..Default::default()
    };
    let mut next = MESSAGE.iter();
    let mut echoed = Vec::new();
    loop {
        let mut run_out = [0u8; size_of::<RunBlock>()];
        call(&session, ControlCode::Run, &to_bytes(&block), &mut run_out);
        block = read_struct(&run_out).unwrap_or_default();

        match block.exit_reason {
            KVM_EXIT_IO if u32::from(block.io.direction) == KVM_EXIT_IO_IN => {
                block.io.data[0] = next.next().copied().unwrap_or(0);
            }
            KVM_EXIT_IO => echoed.push(block.io.data[0]),
            KVM_EXIT_HLT => break,
            other => {
                eprintln!("unexpected exit reason {other}");
                break;
            }
        }
    }

    print!("{}", String::from_utf8_lossy(&echoed));
    session.close();
    Ok(())
}
