//! Guest physical memory slots shared by the engines

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use hvport_protocol::{MemoryRegion, PAGE_SHIFT, PAGE_SIZE};
use kvm_bindings::{KVM_MEM_LOG_DIRTY_PAGES, KVM_MEM_READONLY};
use tracing::debug;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use super::{EngineError, EngineResult};

/// Flags a memory region may carry
pub const SUPPORTED_REGION_FLAGS: u32 = KVM_MEM_LOG_DIRTY_PAGES | KVM_MEM_READONLY;

/// One guest memory slot backed by anonymous host memory
pub struct RamSlot {
    region: MemoryRegion,
    memory: GuestMemoryMmap,
    dirty: Option<Vec<AtomicU64>>,
}

impl RamSlot {
    fn new(region: MemoryRegion) -> EngineResult<Self> {
        let size = usize::try_from(region.memory_size).map_err(|_| EngineError::InvalidArgument)?;
        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(region.guest_phys_addr), size)])
            .map_err(|_| EngineError::NoMemory)?;

        let dirty = (region.flags & KVM_MEM_LOG_DIRTY_PAGES != 0)
            .then(|| (0..bitmap_words(region.memory_size)).map(|_| AtomicU64::new(0)).collect());

        Ok(Self {
            region,
            memory,
            dirty,
        })
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// Host virtual address of the first byte of the slot.
    pub fn host_address(&self) -> EngineResult<u64> {
        self.memory
            .get_host_address(GuestAddress(self.region.guest_phys_addr))
            .map(|ptr| ptr as u64)
            .map_err(|_| EngineError::Fault(self.region.guest_phys_addr))
    }

    fn end(&self) -> u64 {
        self.region.guest_phys_addr + self.region.memory_size
    }

    fn contains(&self, gpa: u64) -> bool {
        gpa >= self.region.guest_phys_addr && gpa < self.end()
    }

    fn overlaps(&self, other: &MemoryRegion) -> bool {
        let other_end = other.guest_phys_addr + other.memory_size;
        other.guest_phys_addr < self.end() && self.region.guest_phys_addr < other_end
    }

    fn mark_dirty(&self, gpa: u64, len: usize) {
        let Some(bitmap) = &self.dirty else {
            return;
        };
        if len == 0 {
            return;
        }
        let first = (gpa - self.region.guest_phys_addr) >> PAGE_SHIFT;
        let last = (gpa + len as u64 - 1 - self.region.guest_phys_addr) >> PAGE_SHIFT;
        for page in first..=last {
            bitmap[(page / 64) as usize].fetch_or(1 << (page % 64), Ordering::Relaxed);
        }
    }

    /// Return the dirty bitmap and clear it.
    fn take_dirty_log(&self) -> EngineResult<Vec<u64>> {
        let bitmap = self.dirty.as_ref().ok_or(EngineError::InvalidArgument)?;
        Ok(bitmap.iter().map(|word| word.swap(0, Ordering::Relaxed)).collect())
    }
}

/// Number of u64 words covering one bit per page of `memory_size`.
pub fn bitmap_words(memory_size: u64) -> usize {
    memory_size.div_ceil(PAGE_SIZE).div_ceil(64) as usize
}

/// Guest physical address space of one VM
#[derive(Default)]
pub struct GuestRam {
    slots: BTreeMap<u32, RamSlot>,
}

impl GuestRam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, slot: u32) -> Option<&RamSlot> {
        self.slots.get(&slot)
    }

    /// Apply a memory region update.
    ///
    /// A zero `memory_size` deletes the slot; otherwise the slot is created or
    /// replaced. Replaced contents are not preserved.
    pub fn set_region(&mut self, region: &MemoryRegion, max_slots: u32) -> EngineResult<()> {
        if region.slot >= max_slots {
            return Err(EngineError::InvalidArgument);
        }
        if region.flags & !SUPPORTED_REGION_FLAGS != 0 {
            return Err(EngineError::InvalidArgument);
        }

        if region.memory_size == 0 {
            if self.slots.remove(&region.slot).is_some() {
                debug!("Deleted memory slot {}", region.slot);
            }
            return Ok(());
        }

        if region.guest_phys_addr % PAGE_SIZE != 0 || region.memory_size % PAGE_SIZE != 0 {
            return Err(EngineError::InvalidArgument);
        }
        if region.guest_phys_addr.checked_add(region.memory_size).is_none() {
            return Err(EngineError::InvalidArgument);
        }
        if self
            .slots
            .iter()
            .any(|(id, slot)| *id != region.slot && slot.overlaps(region))
        {
            return Err(EngineError::Exists);
        }

        let slot = RamSlot::new(*region)?;
        debug!(
            "Memory slot {}: gpa {:#x} size {:#x} flags {:#x}",
            region.slot, region.guest_phys_addr, region.memory_size, region.flags
        );
        self.slots.insert(region.slot, slot);
        Ok(())
    }

    fn slot_for(&self, gpa: u64) -> EngineResult<&RamSlot> {
        self.slots
            .values()
            .find(|slot| slot.contains(gpa))
            .ok_or(EngineError::Fault(gpa))
    }

    /// Read guest physical memory, crossing slot boundaries as needed.
    pub fn read(&self, gpa: u64, dst: &mut [u8]) -> EngineResult<()> {
        let mut done = 0;
        while done < dst.len() {
            let addr = gpa + done as u64;
            let slot = self.slot_for(addr)?;
            let chunk = ((slot.end() - addr) as usize).min(dst.len() - done);
            slot.memory
                .read_slice(&mut dst[done..done + chunk], GuestAddress(addr))
                .map_err(|_| EngineError::Fault(addr))?;
            done += chunk;
        }
        Ok(())
    }

    /// Write guest physical memory and record dirty pages.
    pub fn write(&self, gpa: u64, src: &[u8]) -> EngineResult<()> {
        let mut done = 0;
        while done < src.len() {
            let addr = gpa + done as u64;
            let slot = self.slot_for(addr)?;
            if slot.region.flags & KVM_MEM_READONLY != 0 {
                return Err(EngineError::Fault(addr));
            }
            let chunk = ((slot.end() - addr) as usize).min(src.len() - done);
            slot.memory
                .write_slice(&src[done..done + chunk], GuestAddress(addr))
                .map_err(|_| EngineError::Fault(addr))?;
            slot.mark_dirty(addr, chunk);
            done += chunk;
        }
        Ok(())
    }

    pub fn read_u8(&self, gpa: u64) -> EngineResult<u8> {
        let mut buf = [0u8; 1];
        self.read(gpa, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, gpa: u64) -> EngineResult<u16> {
        let mut buf = [0u8; 2];
        self.read(gpa, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, gpa: u64) -> EngineResult<u32> {
        let mut buf = [0u8; 4];
        self.read(gpa, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, gpa: u64) -> EngineResult<u64> {
        let mut buf = [0u8; 8];
        self.read(gpa, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Dirty bitmap of a slot created with dirty logging; clears it.
    pub fn take_dirty_log(&self, slot: u32) -> EngineResult<Vec<u64>> {
        self.slots
            .get(&slot)
            .ok_or(EngineError::NotFound)?
            .take_dirty_log()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Copy guest virtual memory a page at a time.
///
/// `translate` resolves each page's linear address to a guest physical one
/// (`None` when unmapped) and `copy` moves one chunk. Stops at the first
/// page that fails; an error is returned only if nothing was copied.
pub fn transfer_virtual<T, F>(
    ram: &GuestRam,
    gva: u64,
    len: usize,
    mut translate: T,
    mut copy: F,
) -> EngineResult<usize>
where
    T: FnMut(u64) -> EngineResult<Option<u64>>,
    F: FnMut(&GuestRam, u64, Range<usize>) -> EngineResult<()>,
{
    let mut done = 0;
    while done < len {
        let addr = gva.wrapping_add(done as u64);
        let in_page = (PAGE_SIZE - (addr % PAGE_SIZE)) as usize;
        let chunk = in_page.min(len - done);

        let result = translate(addr).and_then(|gpa| {
            let gpa = gpa.ok_or(EngineError::Fault(addr))?;
            copy(ram, gpa, done..done + chunk)
        });
        match result {
            Ok(()) => done += chunk,
            Err(e) if done == 0 => return Err(e),
            Err(_) => break,
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(slot: u32, gpa: u64, size: u64, flags: u32) -> MemoryRegion {
        MemoryRegion {
            slot,
            flags,
            guest_phys_addr: gpa,
            memory_size: size,
        }
    }

    #[test]
    fn test_write_read_guest() {
        let mut ram = GuestRam::new();
        ram.set_region(&region(0, 0, 0x10000, 0), 32).unwrap();

        ram.write(0x1000, b"hello world").unwrap();
        let mut buf = [0u8; 11];
        ram.read(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_read_spans_adjacent_slots() {
        let mut ram = GuestRam::new();
        ram.set_region(&region(0, 0, 0x1000, 0), 32).unwrap();
        ram.set_region(&region(1, 0x1000, 0x1000, 0), 32).unwrap();

        ram.write(0xffe, &[1, 2, 3, 4]).unwrap();
        assert_eq!(ram.read_u32(0xffe).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_unbacked_address_faults() {
        let mut ram = GuestRam::new();
        ram.set_region(&region(0, 0, 0x1000, 0), 32).unwrap();
        assert_eq!(ram.read_u8(0x2000), Err(EngineError::Fault(0x2000)));
        assert_eq!(ram.write(0xfff, &[0, 0]), Err(EngineError::Fault(0x1000)));
    }

    #[test]
    fn test_region_validation() {
        let mut ram = GuestRam::new();
        assert_eq!(
            ram.set_region(&region(0, 0x800, 0x1000, 0), 32),
            Err(EngineError::InvalidArgument)
        );
        assert_eq!(
            ram.set_region(&region(32, 0, 0x1000, 0), 32),
            Err(EngineError::InvalidArgument)
        );
        assert_eq!(
            ram.set_region(&region(0, 0, 0x1000, 0x80), 32),
            Err(EngineError::InvalidArgument)
        );

        ram.set_region(&region(0, 0, 0x2000, 0), 32).unwrap();
        assert_eq!(
            ram.set_region(&region(1, 0x1000, 0x1000, 0), 32),
            Err(EngineError::Exists)
        );

        // zero size deletes
        ram.set_region(&region(0, 0, 0, 0), 32).unwrap();
        assert!(ram.is_empty());
    }

    #[test]
    fn test_dirty_log_tracks_and_clears() {
        let mut ram = GuestRam::new();
        ram.set_region(&region(2, 0x10000, 0x10000, KVM_MEM_LOG_DIRTY_PAGES), 32)
            .unwrap();

        ram.write(0x10000, &[1]).unwrap();
        ram.write(0x12ffe, &[1, 2, 3, 4]).unwrap();

        let log = ram.take_dirty_log(2).unwrap();
        assert_eq!(log, vec![0b1101]);
        assert_eq!(ram.take_dirty_log(2).unwrap(), vec![0]);
    }

    #[test]
    fn test_dirty_log_requires_flag() {
        let mut ram = GuestRam::new();
        ram.set_region(&region(0, 0, 0x1000, 0), 32).unwrap();
        assert_eq!(ram.take_dirty_log(0), Err(EngineError::InvalidArgument));
        assert_eq!(ram.take_dirty_log(5), Err(EngineError::NotFound));
    }

    #[test]
    fn test_readonly_slot_rejects_writes() {
        let mut ram = GuestRam::new();
        ram.set_region(&region(0, 0, 0x1000, KVM_MEM_READONLY), 32).unwrap();
        assert_eq!(ram.write(0x10, &[1]), Err(EngineError::Fault(0x10)));
    }

    #[test]
    fn test_transfer_virtual_splits_pages() {
        let mut ram = GuestRam::new();
        ram.set_region(&region(0, 0, 0x4000, 0), 32).unwrap();

        let mut chunks = Vec::new();
        let copied = transfer_virtual(
            &ram,
            0xff0,
            0x20,
            |gva| Ok(Some(gva + 0x1000)),
            |_, gpa, range| {
                chunks.push((gpa, range));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(copied, 0x20);
        assert_eq!(chunks, vec![(0x1ff0, 0..0x10), (0x2000, 0x10..0x20)]);
    }

    #[test]
    fn test_transfer_virtual_partial() {
        let ram = GuestRam::new();
        let translate = |gva: u64| Ok((gva < 0x1000).then_some(gva));
        let copy = |_: &GuestRam, _, _| Ok(());

        assert_eq!(transfer_virtual(&ram, 0x800, 0x1000, translate, copy), Ok(0x800));
        assert_eq!(
            transfer_virtual(&ram, 0x1000, 0x10, translate, copy),
            Err(EngineError::Fault(0x1000))
        );
    }

    #[test]
    fn test_bitmap_words() {
        assert_eq!(bitmap_words(PAGE_SIZE), 1);
        assert_eq!(bitmap_words(64 * PAGE_SIZE), 1);
        assert_eq!(bitmap_words(65 * PAGE_SIZE), 2);
    }
}
