//! Memory-map slots: pinned host pages published to the caller
//!
//! A slot binds a guest frame range to a run of pinned host pages mapped
//! into the caller's address space. Pages stay pinned until the slot is
//! closed or re-initialised.

use std::io;
use std::sync::Arc;

use hvport_protocol::{PfnEntry, PAGE_SIZE};
use tracing::{debug, info};

use crate::lifecycle::ShimLedger;
use crate::{Error, Result};

/// A run of pinned pages
pub trait PinnedPages: Send {
    /// Caller-visible address of the first page
    fn user_address(&self) -> u64;
    fn page_count(&self) -> usize;
    /// Host physical address of page `index`, 0 when the host hides it
    fn physical_address(&self, index: usize) -> u64;
    fn zero_page(&mut self, index: usize);
}

/// Source of pinned pages
pub trait PageAllocator: Send + Sync {
    fn pin(&self, pages: usize) -> io::Result<Box<dyn PinnedPages>>;
}

/// Anonymous private mappings locked with `mlock`
#[derive(Debug, Default)]
pub struct AnonymousPageAllocator;

impl PageAllocator for AnonymousPageAllocator {
    fn pin(&self, pages: usize) -> io::Result<Box<dyn PinnedPages>> {
        Ok(Box::new(AnonymousPages::new(pages)?))
    }
}

struct AnonymousPages {
    addr: *mut libc::c_void,
    len: usize,
    frames: Vec<u64>,
}

// SAFETY: the mapping is owned exclusively by this value and only touched
// through `&mut self` or on drop.
unsafe impl Send for AnonymousPages {}

impl AnonymousPages {
    fn new(pages: usize) -> io::Result<Self> {
        let len = pages
            .checked_mul(PAGE_SIZE as usize)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        // SAFETY: anonymous mapping with no address hint; result is checked.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: addr/len describe the mapping created above.
        if unsafe { libc::mlock(addr, len) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: same mapping, not yet shared.
            unsafe { libc::munmap(addr, len) };
            return Err(err);
        }

        let frames = physical_frames(addr as u64, pages);
        Ok(Self { addr, len, frames })
    }
}

impl PinnedPages for AnonymousPages {
    fn user_address(&self) -> u64 {
        self.addr as u64
    }

    fn page_count(&self) -> usize {
        self.frames.len()
    }

    fn physical_address(&self, index: usize) -> u64 {
        self.frames.get(index).copied().unwrap_or(0)
    }

    fn zero_page(&mut self, index: usize) {
        if index >= self.frames.len() {
            return;
        }
        // SAFETY: index is in bounds, so the page lies inside our mapping.
        unsafe {
            let page = (self.addr as *mut u8).add(index * PAGE_SIZE as usize);
            std::ptr::write_bytes(page, 0, PAGE_SIZE as usize);
        }
    }
}

impl Drop for AnonymousPages {
    fn drop(&mut self) {
        // SAFETY: addr/len describe a mapping this value owns.
        unsafe {
            libc::munlock(self.addr, self.len);
            libc::munmap(self.addr, self.len);
        }
    }
}

/// Physical addresses of resident pages from `/proc/self/pagemap`.
///
/// Unprivileged processes read zero frame numbers.
#[cfg(target_os = "linux")]
fn physical_frames(addr: u64, pages: usize) -> Vec<u64> {
    use byteorder::{ByteOrder, LittleEndian};
    use std::os::unix::fs::FileExt;

    const PFN_MASK: u64 = (1 << 55) - 1;
    const PRESENT: u64 = 1 << 63;

    let mut frames = vec![0; pages];
    let Ok(pagemap) = std::fs::File::open("/proc/self/pagemap") else {
        return frames;
    };

    let mut raw = vec![0u8; pages * 8];
    let offset = (addr / PAGE_SIZE) * 8;
    if pagemap.read_exact_at(&mut raw, offset).is_err() {
        return frames;
    }

    for (frame, entry) in frames.iter_mut().zip(raw.chunks_exact(8)) {
        let entry = LittleEndian::read_u64(entry);
        if entry & PRESENT != 0 {
            *frame = (entry & PFN_MASK) * PAGE_SIZE;
        }
    }
    frames
}

#[cfg(not(target_os = "linux"))]
fn physical_frames(_addr: u64, pages: usize) -> Vec<u64> {
    vec![0; pages]
}

struct Mapping {
    base_gfn: u64,
    pages: Box<dyn PinnedPages>,
}

/// Snapshot of an active memory-map slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    pub base_gfn: u64,
    pub page_count: usize,
    pub user_address: u64,
}

/// Memory-map slots of one session
pub struct MemoryMapTable {
    slots: Vec<Option<Mapping>>,
    max_map_pages: u32,
    ledger: Arc<ShimLedger>,
}

impl MemoryMapTable {
    pub fn new(max_slots: u32, max_map_pages: u32, ledger: Arc<ShimLedger>) -> Self {
        Self {
            slots: (0..max_slots).map(|_| None).collect(),
            max_map_pages,
            ledger,
        }
    }

    pub fn max_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    fn check_slot(&self, slot: u32) -> Result<usize> {
        if slot >= self.max_slots() {
            return Err(Error::SlotOutOfRange {
                slot,
                max: self.max_slots(),
            });
        }
        Ok(slot as usize)
    }

    /// Pin `npages` pages for guest frames starting at `base_gfn`.
    ///
    /// Any mapping already in the slot is closed first. Returns the
    /// caller-visible address, or 0 for an empty request. On failure the
    /// slot is left empty.
    pub fn create_mapping(
        &mut self,
        slot: u32,
        npages: u32,
        base_gfn: u64,
        allocator: &dyn PageAllocator,
    ) -> Result<u64> {
        let index = self.check_slot(slot)?;
        self.close_mapping(slot)?;

        if npages == 0 {
            return Ok(0);
        }
        if npages > self.max_map_pages {
            return Err(Error::ResourceExhausted(format!(
                "{} pages exceeds the per-slot limit of {}",
                npages, self.max_map_pages
            )));
        }

        let pages = allocator.pin(npages as usize).map_err(|e| {
            Error::ResourceExhausted(format!("failed to pin {} pages: {}", npages, e))
        })?;
        let user_address = pages.user_address();

        self.ledger.pin_pages(u64::from(npages));
        info!(
            "Memory-map slot {}: guest physical {:#x}-{:#x} at {:#x}",
            slot,
            base_gfn.wrapping_mul(PAGE_SIZE),
            base_gfn.wrapping_add(u64::from(npages)).wrapping_mul(PAGE_SIZE),
            user_address
        );
        self.slots[index] = Some(Mapping { base_gfn, pages });
        Ok(user_address)
    }

    /// Unpin and clear a slot. An empty slot is left as is.
    pub fn close_mapping(&mut self, slot: u32) -> Result<()> {
        let index = self.check_slot(slot)?;
        if let Some(mapping) = self.slots[index].take() {
            self.ledger.unpin_pages(mapping.pages.page_count() as u64);
            debug!("Memory-map slot {} closed", slot);
        }
        Ok(())
    }

    /// Page count of a slot, 0 when empty.
    pub fn page_count(&self, slot: u32) -> Result<usize> {
        let index = self.check_slot(slot)?;
        Ok(self.slots[index]
            .as_ref()
            .map_or(0, |mapping| mapping.pages.page_count()))
    }

    pub fn mapping(&self, slot: u32) -> Result<Option<MappingInfo>> {
        let index = self.check_slot(slot)?;
        Ok(self.slots[index].as_ref().map(|mapping| MappingInfo {
            base_gfn: mapping.base_gfn,
            page_count: mapping.pages.page_count(),
            user_address: mapping.pages.user_address(),
        }))
    }

    /// Zero up to `max_entries` pages of a slot and return their addresses.
    pub fn fill_pv_map(&mut self, slot: u32, max_entries: usize) -> Result<Vec<PfnEntry>> {
        let index = self.check_slot(slot)?;
        let Some(mapping) = self.slots[index].as_mut() else {
            return Ok(Vec::new());
        };

        let count = mapping.pages.page_count().min(max_entries);
        let base = mapping.pages.user_address();
        let mut entries = Vec::with_capacity(count);
        for page in 0..count {
            mapping.pages.zero_page(page);
            entries.push(PfnEntry {
                virt: base + page as u64 * PAGE_SIZE,
                phys: mapping.pages.physical_address(page),
            });
        }
        Ok(entries)
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Close every slot.
    pub fn close_all(&mut self) {
        for slot in 0..self.max_slots() {
            let _ = self.close_mapping(slot);
        }
    }
}
