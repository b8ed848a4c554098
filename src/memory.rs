//! Guest-physical memory: host-backed storage plus the bounded map tracker
//! that mirrors the VMM's memory-region transactions into the hypervisor.
//!
//! # Two halves
//!
//! [`GuestMemory`] is the part the predecessor of this crate already had: a
//! thin wrapper around `vm_memory::GuestMemoryMmap` giving the VMM a place
//! to put guest RAM and read/write it by guest-physical address.
//!
//! [`MemoryMapTracker`] is new: it listens to `begin`/`commit`/`region_add`/
//! `region_del`/`log_sync` calls from the VMM's address-space subsystem and
//! keeps a fixed-capacity table of `{gpa, size, hva}` triples in sync with
//! the hypervisor's own mapping, via `set_mapping`. The table is bounded and
//! linearly scanned on purpose — it is touched from a listener callback
//! that must not allocate or block.

use std::sync::Arc;

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

use crate::driver::{CvmDriver, DriverError};
use crate::protocol::{memtype, AddrMapInfo};

/// Number of guest-physical regions the tracker can hold at once. A plain
/// VMM rarely registers more than a handful of regions (RAM, a couple of
/// ROMs, an MMIO hole); 32 leaves headroom without needing a heap table in
/// the listener's hot path.
pub const MAX_MAPPED_REGIONS: usize = 32;

/// Host page size assumed for alignment. x86_64 exclusively.
pub const PAGE_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate guest memory: {0}")]
    Allocation(#[source] std::io::Error),

    #[error("guest memory access out of bounds at {addr:#x}, len {len}")]
    OutOfBounds { addr: u64, len: usize },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Guest physical memory backing store.
///
/// A thin wrapper around `vm_memory::GuestMemoryMmap`, unchanged in spirit
/// from the boot-loader era of this crate: a single contiguous region
/// starting at guest physical address 0, private and anonymous.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let regions = vec![(GuestAddress(0), size as usize)];
        let inner = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|e| MemoryError::Allocation(std::io::Error::other(e.to_string())))?;
        Ok(Self { inner, size })
    }

    /// Host virtual address and size of the backing region, for registering
    /// a single `set_mapping` covering all of guest RAM.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, self.size)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }
}

/// One live entry in the map tracker. `host_va == 0` marks a free slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MapEntry {
    gpa: u64,
    size: u64,
    host_va: u64,
    rom: bool,
}

impl MapEntry {
    fn is_free(&self) -> bool {
        self.host_va == 0
    }
}

/// Tracks the guest-physical regions currently mapped into the hypervisor
/// and keeps them in lockstep with the VMM's own address-space state.
///
/// This is the listener side of the VMM's memory transactor contract
/// ([`crate::collab::MemoryTransactor`]): `region_add`/`region_del` update
/// this table first, then push the change to the driver, so a full table or
/// a missing delete target degrades to a logged skip rather than aborting
/// the caller.
pub struct MemoryMapTracker<D: CvmDriver> {
    driver: Arc<D>,
    vm: crate::protocol::VmHandle,
    entries: [MapEntry; MAX_MAPPED_REGIONS],
}

impl<D: CvmDriver> MemoryMapTracker<D> {
    pub fn new(driver: Arc<D>, vm: crate::protocol::VmHandle) -> Self {
        Self {
            driver,
            vm,
            entries: [MapEntry::default(); MAX_MAPPED_REGIONS],
        }
    }

    /// Transaction bracket. Both are no-ops: the driver has no notion of a
    /// batched memory transaction, only per-region adds and deletes.
    pub fn begin(&mut self) {}
    pub fn commit(&mut self) {}

    /// Register a RAM-backed region. `host_va`/`size` are trimmed to page
    /// boundaries first; a region that trims to nothing is silently
    /// dropped, matching the "all-RAM" precondition devices already expect.
    pub fn region_add(&mut self, gpa: u64, size: u64, host_va: u64, rom: bool) {
        let (gpa, host_va, size) = match align_region(gpa, host_va, size) {
            Some(aligned) => aligned,
            None => return,
        };

        let slot = match self.entries.iter().position(MapEntry::is_free) {
            Some(slot) => slot,
            None => {
                eprintln!(
                    "[noircv mem] map table full ({MAX_MAPPED_REGIONS} slots), dropping region at {gpa:#x}"
                );
                return;
            }
        };
        self.entries[slot] = MapEntry {
            gpa,
            size,
            host_va,
            rom,
        };

        let map = AddrMapInfo {
            gpa,
            hva: host_va,
            number_of_pages: (size / PAGE_SIZE) as u32,
            attributes: AddrMapInfo::pack_attributes(true, !rom, true, true, memtype::WB, 0),
        };
        if let Err(e) = self.driver.set_mapping(self.vm, &map) {
            eprintln!("[noircv mem] set_mapping(add) failed for {gpa:#x}: {e}");
        }
    }

    /// Unregister a region previously added with the same `(gpa, size)`.
    pub fn region_del(&mut self, gpa: u64, size: u64, host_va: u64, rom: bool) {
        let (gpa, host_va, size) = match align_region(gpa, host_va, size) {
            Some(aligned) => aligned,
            None => return,
        };

        let slot = self
            .entries
            .iter()
            .position(|e| !e.is_free() && e.gpa == gpa && e.size == size);
        match slot {
            Some(slot) => self.entries[slot] = MapEntry::default(),
            None => {
                eprintln!("[noircv mem] region_del found no tracked entry for {gpa:#x}/{size:#x}");
            }
        }

        let map = AddrMapInfo {
            gpa,
            hva: host_va,
            number_of_pages: (size / PAGE_SIZE) as u32,
            attributes: 0,
        };
        let _ = rom;
        if let Err(e) = self.driver.set_mapping(self.vm, &map) {
            eprintln!("[noircv mem] set_mapping(del) failed for {gpa:#x}: {e}");
        }
    }

    /// Mark the whole region dirty. The driver does not expose a finer dirty
    /// granularity, so `log_sync` cannot do better than this.
    pub fn log_sync(&mut self, gpa: u64, size: u64) {
        eprintln!("[noircv mem] log_sync: marking {gpa:#x}..{:#x} dirty (whole-region)", gpa + size);
    }

    /// Copy bytes between a caller buffer and mapped guest memory, for the
    /// string-I/O emulation path. Returns whether the whole range was
    /// covered by tracked mappings.
    pub fn copy_physical(&self, buffer: &mut [u8], gpa: u64, read: bool) -> bool {
        let mut remaining = buffer.len();
        let mut cur = gpa;
        let mut offset = 0usize;

        while remaining > 0 {
            let entry = self
                .entries
                .iter()
                .find(|e| !e.is_free() && cur >= e.gpa && cur < e.gpa + e.size);
            let entry = match entry {
                Some(e) => e,
                None => return false,
            };

            let region_end = entry.gpa + entry.size;
            let chunk = remaining.min((region_end - cur) as usize);
            let host_ptr = (entry.host_va + (cur - entry.gpa)) as *mut u8;

            // SAFETY: `host_ptr..+chunk` lies within a region this tracker
            // registered with the hypervisor and which the VMM still owns;
            // `chunk` never exceeds the tracked region's remaining length.
            unsafe {
                if read {
                    std::ptr::copy_nonoverlapping(
                        host_ptr,
                        buffer[offset..offset + chunk].as_mut_ptr(),
                        chunk,
                    );
                } else {
                    std::ptr::copy_nonoverlapping(
                        buffer[offset..offset + chunk].as_ptr(),
                        host_ptr,
                        chunk,
                    );
                }
            }

            cur += chunk as u64;
            offset += chunk;
            remaining -= chunk;
        }
        true
    }
}

/// Trim `[host_va, host_va + size)` so both `gpa` and `gpa + size` land on
/// page boundaries. Returns `None` if the region shrinks to nothing.
fn align_region(gpa: u64, host_va: u64, size: u64) -> Option<(u64, u64, u64)> {
    let start_delta = gpa.next_multiple_of(PAGE_SIZE) - gpa;
    if start_delta >= size {
        return None;
    }
    let trimmed_size = size - start_delta;
    let aligned_size = (trimmed_size / PAGE_SIZE) * PAGE_SIZE;
    if aligned_size == 0 {
        return None;
    }
    Some((gpa + start_delta, host_va + start_delta, aligned_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EmulationInfo;
    use crate::protocol::{EventInjection, ExitContext, InterceptCode, NoirStatus, RegisterType, VmHandle};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDriver {
        mappings: Mutex<Vec<AddrMapInfo>>,
    }

    impl CvmDriver for FakeDriver {
        fn create_vm(&self) -> Result<VmHandle, DriverError> {
            Ok(1)
        }
        fn delete_vm(&self, _vm: VmHandle) -> Result<(), DriverError> {
            Ok(())
        }
        fn create_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn delete_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn set_mapping(&self, _vm: VmHandle, map: &AddrMapInfo) -> Result<(), DriverError> {
            self.mappings.lock().unwrap().push(*map);
            Ok(())
        }
        fn inject_event(
            &self,
            _vm: VmHandle,
            _vpid: u32,
            _event: &EventInjection,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        fn view_register(
            &self,
            _vm: VmHandle,
            _vpid: u32,
            _reg: RegisterType,
            _buf: &mut [u8],
        ) -> Result<usize, DriverError> {
            Ok(0)
        }
        fn edit_register(
            &self,
            _vm: VmHandle,
            _vpid: u32,
            _reg: RegisterType,
            _buf: &[u8],
        ) -> Result<(), DriverError> {
            Ok(())
        }
        fn run_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<ExitContext, DriverError> {
            unimplemented!()
        }
        fn rescind_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn try_emulate(
            &self,
            _vm: VmHandle,
            _vpid: u32,
            _info: &EmulationInfo,
            _buf: &mut [u8],
        ) -> Result<NoirStatus, DriverError> {
            Ok(crate::protocol::status::SUCCESS)
        }
    }

    #[test]
    fn guest_memory_write_read_round_trip() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        mem.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn region_add_and_del_round_trip_leaves_table_empty() {
        let driver = Arc::new(FakeDriver::default());
        let mut tracker = MemoryMapTracker::new(driver.clone(), 1);

        for i in 0..10u64 {
            let gpa = i * 2 * 1024 * 1024;
            tracker.region_add(gpa, 2 * 1024 * 1024, 0x1000_0000 + gpa, false);
        }
        for i in (0..10u64).rev() {
            let gpa = i * 2 * 1024 * 1024;
            tracker.region_del(gpa, 2 * 1024 * 1024, 0x1000_0000 + gpa, false);
        }

        assert!(tracker.entries.iter().all(MapEntry::is_free));
        assert_eq!(driver.mappings.lock().unwrap().len(), 20);
    }

    #[test]
    fn region_add_beyond_capacity_is_dropped_not_fatal() {
        let driver = Arc::new(FakeDriver::default());
        let mut tracker = MemoryMapTracker::new(driver, 1);
        for i in 0..(MAX_MAPPED_REGIONS as u64 + 1) {
            tracker.region_add(i * PAGE_SIZE * 2, PAGE_SIZE, 0x2000_0000 + i, false);
        }
        assert!(!tracker.entries.iter().any(MapEntry::is_free));
    }

    #[test]
    fn copy_physical_round_trips_within_a_mapped_region() {
        let driver = Arc::new(FakeDriver::default());
        let mut tracker = MemoryMapTracker::new(driver, 1);
        let mut backing = vec![0u8; 4096];
        let host_va = backing.as_mut_ptr() as u64;
        tracker.region_add(0, 4096, host_va, false);

        let payload = [0xaa, 0xbb, 0xcc, 0xdd];
        let mut write_buf = payload;
        assert!(tracker.copy_physical(&mut write_buf, 0x100, false));

        let mut read_buf = [0u8; 4];
        assert!(tracker.copy_physical(&mut read_buf, 0x100, true));
        assert_eq!(read_buf, payload);
    }

    #[test]
    fn align_region_trims_unaligned_start() {
        let (gpa, hva, size) = align_region(10, 10, 3 * PAGE_SIZE).unwrap();
        assert_eq!(gpa, PAGE_SIZE);
        assert_eq!(hva, PAGE_SIZE);
        assert_eq!(size, 2 * PAGE_SIZE);
    }

    #[test]
    fn align_region_drops_regions_that_shrink_to_nothing() {
        assert!(align_region(10, 10, 100).is_none());
    }
}
