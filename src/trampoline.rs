//! VM-exit trampoline
//!
//! Engines call [`vm_exit`] on every guest-to-host transition. On x86_64
//! Linux it enters a hand-written stub that saves rflags and all fifteen
//! general-purpose registers, calls a diagnostic hook on an aligned stack,
//! restores everything and returns. The hook only bumps a counter: it never
//! blocks and never touches session state.
//!
//! Other targets call the hook directly.

use std::sync::atomic::{AtomicU64, Ordering};

static VMEXIT_COUNT: AtomicU64 = AtomicU64::new(0);

extern "C" fn vmexit_hook() {
    VMEXIT_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod stub {
    std::arch::global_asm!(
        ".text",
        ".globl hvport_vmexit_trampoline",
        ".type hvport_vmexit_trampoline, @function",
        "hvport_vmexit_trampoline:",
        "pushfq",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // 16-byte alignment for the call, plus 32 bytes of scratch
        "sub rsp, 40",
        "call {hook}",
        "add rsp, 40",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "popfq",
        "ret",
        ".size hvport_vmexit_trampoline, . - hvport_vmexit_trampoline",
        hook = sym super::vmexit_hook,
    );

    extern "C" {
        pub fn hvport_vmexit_trampoline();
    }
}

/// Run the exit trampoline once.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub fn vm_exit() {
    // SAFETY: the stub restores every register it touches and keeps the
    // stack balanced; the hook it calls is a plain extern "C" function.
    unsafe { stub::hvport_vmexit_trampoline() }
}

/// Run the exit trampoline once.
#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
pub fn vm_exit() {
    vmexit_hook();
}

/// Number of exits seen by the trampoline since process start.
pub fn vmexit_count() -> u64 {
    VMEXIT_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_exit_counts() {
        let before = vmexit_count();
        vm_exit();
        vm_exit();
        assert!(vmexit_count() >= before + 2);
    }

    #[test]
    fn test_vm_exit_preserves_locals() {
        let values: Vec<u64> = (0..16).map(|i| i * 0x1111).collect();
        let sum_before: u64 = values.iter().sum();
        vm_exit();
        let sum_after: u64 = values.iter().sum();
        assert_eq!(sum_before, sum_after);
    }
}
