//! Resource table binding descriptors to engine VM and VCPU objects
//!
//! Each kind lives in its own [`SlotArena`], so VM and VCPU descriptors are
//! separate namespaces. A descriptor packs the slot index in bits 0..16 and
//! a 15-bit generation in bits 16..31; bit 31 is always clear, so every
//! live descriptor is a non-negative `i32`. The generation is bumped when a
//! slot is freed, which makes descriptors of released objects stale.

use std::sync::{Arc, RwLock};

use slab::Slab;
use tracing::debug;

use crate::engine::{VcpuObject, VmObject};
use crate::lifecycle::{OpenFileRef, ShimLedger};
use crate::{Error, Result};

/// Caller-visible handle to a VM or VCPU
pub type Descriptor = i32;

const INDEX_BITS: u32 = 16;
const INDEX_MASK: i32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u16 = 0x7fff;

fn encode(index: usize, generation: u16) -> Descriptor {
    (i32::from(generation & GENERATION_MASK) << INDEX_BITS) | index as i32
}

fn decode(descriptor: Descriptor) -> Option<(usize, u16)> {
    if descriptor < 0 {
        return None;
    }
    let index = (descriptor & INDEX_MASK) as usize;
    let generation = (descriptor >> INDEX_BITS) as u16;
    Some((index, generation))
}

/// Fixed-capacity arena with generation-checked descriptors
pub struct SlotArena<T> {
    slots: Slab<T>,
    generations: Vec<u16>,
    capacity: usize,
}

impl<T> SlotArena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            generations: vec![0; capacity],
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store `value`, or hand it back if every slot is taken.
    pub fn insert(&mut self, value: T) -> std::result::Result<Descriptor, T> {
        if self.slots.len() >= self.capacity {
            return Err(value);
        }
        let index = self.slots.insert(value);
        Ok(encode(index, self.generations[index]))
    }

    fn live_index(&self, descriptor: Descriptor) -> Option<usize> {
        let (index, generation) = decode(descriptor)?;
        (self.slots.contains(index) && self.generations[index] == generation).then_some(index)
    }

    pub fn get(&self, descriptor: Descriptor) -> Option<&T> {
        self.live_index(descriptor).and_then(|index| self.slots.get(index))
    }

    pub fn remove(&mut self, descriptor: Descriptor) -> Option<T> {
        let index = self.live_index(descriptor)?;
        self.retire(index);
        self.slots.try_remove(index)
    }

    /// Remove every entry, oldest slot first.
    pub fn drain(&mut self) -> Vec<T> {
        let indices: Vec<usize> = self.slots.iter().map(|(index, _)| index).collect();
        indices
            .into_iter()
            .filter_map(|index| {
                self.retire(index);
                self.slots.try_remove(index)
            })
            .collect()
    }

    fn retire(&mut self, index: usize) {
        self.generations[index] = self.generations[index].wrapping_add(1) & GENERATION_MASK;
    }
}

/// A VM and the lock serializing guest-memory transfers across its VCPUs
pub struct VmEntry {
    pub vm: Arc<dyn VmObject>,
    pub transfer_lock: Arc<RwLock<()>>,
    _file: OpenFileRef,
}

/// A VCPU bound to the VM descriptor it was created on
pub struct VcpuEntry {
    pub vcpu: Arc<dyn VcpuObject>,
    pub vm: Descriptor,
    pub transfer_lock: Arc<RwLock<()>>,
    _file: OpenFileRef,
}

/// VM and VCPU descriptor tables of one session
pub struct ResourceTable {
    vms: SlotArena<VmEntry>,
    vcpus: SlotArena<VcpuEntry>,
    ledger: Arc<ShimLedger>,
}

impl ResourceTable {
    /// Create a table with `capacity` slots per kind.
    pub fn new(capacity: usize, ledger: Arc<ShimLedger>) -> Self {
        Self {
            vms: SlotArena::with_capacity(capacity),
            vcpus: SlotArena::with_capacity(capacity),
            ledger,
        }
    }

    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty() && self.vcpus.is_empty()
    }

    /// Bind a new VM. On a full table the VM is released and an error returned.
    pub fn insert_vm(&mut self, vm: Arc<dyn VmObject>) -> Result<Descriptor> {
        let entry = VmEntry {
            vm,
            transfer_lock: Arc::new(RwLock::new(())),
            _file: self.ledger.open_file(),
        };
        self.vms.insert(entry).map_err(|entry| {
            entry.vm.release();
            Error::ResourceExhausted("no free VM slot".into())
        })
    }

    pub fn vm(&self, descriptor: Descriptor) -> Result<&VmEntry> {
        self.vms
            .get(descriptor)
            .ok_or(Error::InvalidDescriptor(descriptor))
    }

    /// Bind a new VCPU to `vm`, sharing its transfer lock.
    pub fn insert_vcpu(&mut self, vm: Descriptor, vcpu: Arc<dyn VcpuObject>) -> Result<Descriptor> {
        let transfer_lock = match self.vm(vm) {
            Ok(entry) => Arc::clone(&entry.transfer_lock),
            Err(e) => {
                vcpu.release();
                return Err(e);
            }
        };
        let entry = VcpuEntry {
            vcpu,
            vm,
            transfer_lock,
            _file: self.ledger.open_file(),
        };
        self.vcpus.insert(entry).map_err(|entry| {
            entry.vcpu.release();
            Error::ResourceExhausted("no free VCPU slot".into())
        })
    }

    pub fn vcpu(&self, descriptor: Descriptor) -> Result<&VcpuEntry> {
        self.vcpus
            .get(descriptor)
            .ok_or(Error::InvalidDescriptor(descriptor))
    }

    /// Run the VM's release hook and free its slot.
    pub fn release_vm(&mut self, descriptor: Descriptor) -> Result<()> {
        self.vm(descriptor)?.vm.release();
        self.vms.remove(descriptor);
        Ok(())
    }

    /// Run the VCPU's release hook and free its slot.
    pub fn release_vcpu(&mut self, descriptor: Descriptor) -> Result<()> {
        self.vcpu(descriptor)?.vcpu.release();
        self.vcpus.remove(descriptor);
        Ok(())
    }

    /// Release every VCPU, then every VM.
    pub fn release_all(&mut self) {
        let vcpus = self.vcpus.drain();
        let vms = self.vms.drain();
        debug!("Releasing {} VCPUs and {} VMs", vcpus.len(), vms.len());

        for entry in vcpus {
            entry.vcpu.release();
        }
        for entry in vms {
            entry.vm.release();
        }
    }
}
