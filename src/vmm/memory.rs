//! Guest physical memory.
//!
//! The VM's memory is a single anonymous, private, no-reserve allocation
//! managed through `vm_memory::GuestMemoryMmap`, the standard abstraction of
//! the rust-vmm ecosystem. The allocation is presented to the guest as one or
//! more regions: a single region covering `[0, mem_size)` for small guests,
//! or two regions split around the MMIO hole (see [`crate::vmm::arch`]) for
//! guests larger than the hole base.
//!
//! Devices and the boot loader borrow this handle to read and write guest
//! buffers by guest-physical address. The handle is cheap to clone; all
//! clones share the same backing mapping, which stays alive until the last
//! clone is dropped.

use thiserror::Error;
use vm_memory::{
    Address, Bytes, GuestAddress, GuestMemory as _, GuestMemoryMmap, GuestMemoryRegion,
};

pub use vm_memory::ByteValued;

/// Errors returned by guest memory accesses.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The backing mmap could not be created.
    #[error("failed to allocate guest memory: {0}")]
    Alloc(String),

    /// An access fell outside every installed region.
    #[error("guest memory access out of range: {len} bytes at {addr:#x}")]
    OutOfRange { addr: u64, len: usize },
}

/// A guest-physical memory range backed by host memory, in the form KVM's
/// user memory region ioctl wants it.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub guest_addr: u64,
    pub size: u64,
    pub host_addr: u64,
}

/// Guest physical memory shared by the VM, its devices, and the loader.
#[derive(Clone)]
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate guest memory covering the given `(guest_addr, len)` ranges.
    ///
    /// `vm_memory` maps each range with `MAP_PRIVATE | MAP_ANONYMOUS |
    /// MAP_NORESERVE`, so untouched guest pages cost nothing on the host.
    pub fn new(ranges: &[(u64, usize)]) -> Result<Self, MemoryError> {
        let ranges: Vec<(GuestAddress, usize)> = ranges
            .iter()
            .map(|&(addr, len)| (GuestAddress(addr), len))
            .collect();

        let inner =
            GuestMemoryMmap::from_ranges(&ranges).map_err(|e| MemoryError::Alloc(e.to_string()))?;
        let size = ranges.iter().map(|(_, len)| *len as u64).sum();

        Ok(Self { inner, size })
    }

    /// Total memory size in bytes, not counting any hole.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `[addr, addr+len)` falls entirely inside installed regions.
    pub fn check_range(&self, addr: u64, len: usize) -> bool {
        self.inner.check_range(GuestAddress(addr), len)
    }

    /// Read `buf.len()` bytes from the given guest physical address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(buf, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfRange {
                addr,
                len: buf.len(),
            })
    }

    /// Write `buf` at the given guest physical address.
    pub fn write(&self, addr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(buf, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfRange {
                addr,
                len: buf.len(),
            })
    }

    /// Read a plain-data value from the given guest physical address.
    pub fn read_obj<T: ByteValued>(&self, addr: u64) -> Result<T, MemoryError> {
        self.inner
            .read_obj(GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfRange {
                addr,
                len: std::mem::size_of::<T>(),
            })
    }

    /// Write a plain-data value at the given guest physical address.
    pub fn write_obj<T: ByteValued>(&self, val: T, addr: u64) -> Result<(), MemoryError> {
        self.inner
            .write_obj(val, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfRange {
                addr,
                len: std::mem::size_of::<T>(),
            })
    }

    /// Enumerate the installed regions for registration with KVM.
    pub fn regions(&self) -> Vec<MemRegion> {
        self.inner
            .iter()
            .map(|r| MemRegion {
                guest_addr: r.start_addr().raw_value(),
                size: r.len(),
                host_addr: self
                    .inner
                    .get_host_address(r.start_addr())
                    .expect("region has a host mapping") as u64,
            })
            .collect()
    }
}
