//! Guest page-table walks

use kvm_bindings::{kvm_sregs, kvm_translation};

use super::memory::GuestRam;
use super::EngineResult;

/// x86 control register and page-table entry bits
mod x86 {
    pub const CR0_PG: u64 = 1 << 31;
    pub const CR4_PSE: u64 = 1 << 4;
    pub const CR4_PAE: u64 = 1 << 5;
    pub const EFER_LMA: u64 = 1 << 10;

    pub const PTE_PRESENT: u64 = 1 << 0;
    pub const PTE_WRITABLE: u64 = 1 << 1;
    pub const PTE_USER: u64 = 1 << 2;
    pub const PTE_LARGE: u64 = 1 << 7;

    /// Physical address bits of a 64-bit entry (bits 12..52)
    pub const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
}

/// Paging mode selected by CR0, CR4 and EFER
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Paging disabled: linear equals physical
    None,
    /// Two-level 32-bit paging, 4 MiB pages with CR4.PSE
    Legacy32 { pse: bool },
    /// Three-level PAE paging
    Pae,
    /// Four-level long-mode paging
    Long4,
}

impl PagingMode {
    pub fn from_sregs(sregs: &kvm_sregs) -> Self {
        if sregs.cr0 & x86::CR0_PG == 0 {
            PagingMode::None
        } else if sregs.efer & x86::EFER_LMA != 0 {
            PagingMode::Long4
        } else if sregs.cr4 & x86::CR4_PAE != 0 {
            PagingMode::Pae
        } else {
            PagingMode::Legacy32 {
                pse: sregs.cr4 & x86::CR4_PSE != 0,
            }
        }
    }
}

/// Successful walk result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Walk {
    gpa: u64,
    writable: bool,
    user: bool,
}

/// Translate `gva` with the paging state in `sregs`.
///
/// A non-present entry yields `valid = 0`; a page table outside guest memory
/// is an error.
pub fn translate(ram: &GuestRam, sregs: &kvm_sregs, gva: u64) -> EngineResult<kvm_translation> {
    let mode = PagingMode::from_sregs(sregs);
    let walk = match mode {
        PagingMode::None => Some(Walk {
            gpa: gva & 0xffff_ffff,
            writable: true,
            user: true,
        }),
        PagingMode::Legacy32 { pse } => walk_legacy32(ram, sregs.cr3, gva, pse)?,
        PagingMode::Pae => walk_pae(ram, sregs.cr3, gva)?,
        PagingMode::Long4 => walk_long4(ram, sregs.cr3, gva)?,
    };

    let mut tr = kvm_translation {
        linear_address: gva,
        ..Default::default()
    };
    if let Some(walk) = walk {
        tr.physical_address = walk.gpa;
        tr.valid = 1;
        tr.writeable = walk.writable as u8;
        tr.usermode = walk.user as u8;
    }
    Ok(tr)
}

fn walk_legacy32(ram: &GuestRam, cr3: u64, gva: u64, pse: bool) -> EngineResult<Option<Walk>> {
    let gva = gva & 0xffff_ffff;
    let pde_addr = (cr3 & 0xffff_f000) + ((gva >> 22) & 0x3ff) * 4;
    let pde = u64::from(ram.read_u32(pde_addr)?);
    if pde & x86::PTE_PRESENT == 0 {
        return Ok(None);
    }

    if pse && pde & x86::PTE_LARGE != 0 {
        return Ok(Some(Walk {
            gpa: (pde & 0xffc0_0000) | (gva & 0x3f_ffff),
            writable: pde & x86::PTE_WRITABLE != 0,
            user: pde & x86::PTE_USER != 0,
        }));
    }

    let pte_addr = (pde & 0xffff_f000) + ((gva >> 12) & 0x3ff) * 4;
    let pte = u64::from(ram.read_u32(pte_addr)?);
    if pte & x86::PTE_PRESENT == 0 {
        return Ok(None);
    }

    Ok(Some(Walk {
        gpa: (pte & 0xffff_f000) | (gva & 0xfff),
        writable: pde & pte & x86::PTE_WRITABLE != 0,
        user: pde & pte & x86::PTE_USER != 0,
    }))
}

fn walk_pae(ram: &GuestRam, cr3: u64, gva: u64) -> EngineResult<Option<Walk>> {
    let gva = gva & 0xffff_ffff;
    let pdpte_addr = (cr3 & 0xffff_ffe0) + ((gva >> 30) & 0x3) * 8;
    let pdpte = ram.read_u64(pdpte_addr)?;
    if pdpte & x86::PTE_PRESENT == 0 {
        return Ok(None);
    }
    // PDPTEs carry no R/W or U/S bits in PAE mode
    walk_tail(ram, pdpte & x86::PTE_ADDR_MASK, gva, 2, x86::PTE_WRITABLE | x86::PTE_USER)
}

fn walk_long4(ram: &GuestRam, cr3: u64, gva: u64) -> EngineResult<Option<Walk>> {
    walk_tail(ram, cr3 & x86::PTE_ADDR_MASK, gva, 4, x86::PTE_WRITABLE | x86::PTE_USER)
}

/// Walk 64-bit entries from `level` down to 1, starting at `table`.
///
/// Large pages are honoured at levels 3 (1 GiB) and 2 (2 MiB).
fn walk_tail(
    ram: &GuestRam,
    mut table: u64,
    gva: u64,
    mut level: u32,
    mut rights: u64,
) -> EngineResult<Option<Walk>> {
    loop {
        let shift = 12 + 9 * (level - 1);
        let index = (gva >> shift) & 0x1ff;
        let entry = ram.read_u64(table + index * 8)?;
        if entry & x86::PTE_PRESENT == 0 {
            return Ok(None);
        }
        rights &= entry;

        let large = (level == 2 || level == 3) && entry & x86::PTE_LARGE != 0;
        if level == 1 || large {
            let offset_mask = (1u64 << shift) - 1;
            return Ok(Some(Walk {
                gpa: (entry & x86::PTE_ADDR_MASK & !offset_mask) | (gva & offset_mask),
                writable: rights & x86::PTE_WRITABLE != 0,
                user: rights & x86::PTE_USER != 0,
            }));
        }

        table = entry & x86::PTE_ADDR_MASK;
        level -= 1;
    }
}
