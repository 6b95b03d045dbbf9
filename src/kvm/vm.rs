//! VM file descriptor wrapper.

use super::KvmError;
use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, KVM_PIT_SPEAKER_DUMMY};
use vmm_sys_util::eventfd::EventFd;

/// Wrapper around the KVM VM file descriptor.
///
/// The wrapper is deliberately mechanism-only: installing the irqchip, the
/// PIT, and memory regions is driven by the arch setup and the VM lifecycle
/// in [`crate::vmm`], in the order the lifecycle requires.
pub struct Vm {
    fd: kvm_ioctls::VmFd,
}

impl Vm {
    pub(super) fn new(fd: kvm_ioctls::VmFd) -> Self {
        Self { fd }
    }

    /// Set the three-page TSS region required by Intel VT-x. The address
    /// must not collide with a memory slot; the canonical spot just below
    /// 4G is fine because guest RAM never reaches it (the MMIO hole ends
    /// the low region first).
    pub fn set_tss_address(&self, addr: usize) -> Result<(), KvmError> {
        self.fd.set_tss_address(addr).map_err(KvmError::SetTssAddress)
    }

    /// Create the in-kernel interrupt controllers (PIC + IOAPIC + LAPIC).
    /// Required before irqfds can be registered.
    pub fn create_irq_chip(&self) -> Result<(), KvmError> {
        self.fd.create_irq_chip().map_err(KvmError::CreateIrqChip)
    }

    /// Create the in-kernel i8254 PIT with PC-speaker emulation stubbed out.
    pub fn create_pit(&self) -> Result<(), KvmError> {
        let config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };

        self.fd.create_pit2(config).map_err(KvmError::CreatePit)
    }

    /// Map `[guest_addr, guest_addr+size)` onto host memory at `host_addr`.
    ///
    /// # Safety
    ///
    /// The host range must stay mapped and writable for as long as the VM
    /// can run, and must not overlap another slot.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        size: u64,
        host_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size: size,
            userspace_addr: host_addr,
            flags: 0,
        };

        unsafe {
            self.fd
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Route writes to `fd` into the guest as interrupts on `gsi`.
    pub fn register_irqfd(&self, fd: &EventFd, gsi: u32) -> Result<(), KvmError> {
        self.fd
            .register_irqfd(fd, gsi)
            .map_err(|err| KvmError::RegisterIrqfd { gsi, err })
    }

    /// Create a vCPU. Callers are expected to do this on the OS thread the
    /// vCPU will live on; see [`crate::vmm::vcpu`].
    pub fn create_vcpu(&self, id: u64, mmap_size: usize) -> Result<super::Vcpu, KvmError> {
        let fd = self.fd.create_vcpu(id).map_err(KvmError::CreateVcpu)?;
        super::Vcpu::new(fd, mmap_size)
    }
}
