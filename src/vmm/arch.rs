//! x86-64 architecture setup.
//!
//! Everything KVM needs beyond generic lifecycle plumbing lives behind
//! [`ArchSetup`]: in-kernel "hardware", guest-physical memory
//! partitioning, and per-vCPU identity (CPUID, MSRs). The default
//! implementation is [`X86Arch`]; tests substitute their own to run
//! stripped-down guests.

use crate::kvm::{Kvm, KvmError, Vcpu, Vm};
use kvm_bindings::{kvm_msr_entry, CpuId, Msrs};

/// Base of the 1 GiB MMIO hole. Guests larger than this are split into
/// two memory regions around it.
pub const MMIO_HOLE_ADDR: u64 = 0x0_d000_0000;

/// Guest-physical address where memory resumes above the hole.
pub const AFTER_MMIO_HOLE_ADDR: u64 = 0x1_0000_0000;

// CPUID leaf 1 ECX: running under a hypervisor.
const CPUID_1_ECX_HYPERVISOR: u32 = 1 << 31;

// CPUID leaf 6 ECX: hardware coordination feedback (X86_FEATURE_EPB).
// Hidden because we don't virtualize the energy bias MSR it implies.
const CPUID_6_ECX_EPB: u32 = 1 << 3;

const MSR_IA32_MISC_ENABLE: u32 = 0x1a0;
const MISC_ENABLE_FAST_STRING: u64 = 1;

/// Arch-specific hooks called during VM construction, in order:
/// `setup_vm` after the VM is created, `memory_ranges` before guest
/// memory is allocated, and `setup_vcpu` on each vCPU's own thread after
/// it is created and mapped.
pub trait ArchSetup: Send + Sync {
    fn setup_vm(&self, vm: &Vm) -> Result<(), KvmError>;

    /// Partition `mem_size` bytes of guest memory into
    /// `(guest_addr, len)` ranges.
    fn memory_ranges(&self, mem_size: u64) -> Vec<(u64, usize)>;

    fn setup_vcpu(&self, slot: usize, vcpu: &Vcpu) -> Result<(), KvmError>;
}

/// The default x86-64 setup.
pub struct X86Arch {
    supported_cpuid: CpuId,
}

impl X86Arch {
    pub fn new(kvm: &Kvm) -> Result<Self, KvmError> {
        Ok(Self {
            supported_cpuid: kvm.supported_cpuid()?,
        })
    }
}

impl ArchSetup for X86Arch {
    fn setup_vm(&self, vm: &Vm) -> Result<(), KvmError> {
        // TSS pages live in the hole just below 4G, clear of guest RAM.
        vm.set_tss_address(0xfffb_d000)?;
        vm.create_irq_chip()?;
        vm.create_pit()?;
        Ok(())
    }

    fn memory_ranges(&self, mem_size: u64) -> Vec<(u64, usize)> {
        memory_ranges(mem_size)
    }

    fn setup_vcpu(&self, slot: usize, vcpu: &Vcpu) -> Result<(), KvmError> {
        let mut entries = self.supported_cpuid.as_slice().to_vec();

        for entry in &mut entries {
            match entry.function {
                1 => {
                    entry.ecx |= CPUID_1_ECX_HYPERVISOR;
                    // Initial APIC id in EBX[31:24].
                    entry.ebx = (entry.ebx & 0x00ff_ffff) | ((slot as u32) << 24);
                }
                6 => entry.ecx &= !CPUID_6_ECX_EPB,
                _ => {}
            }
        }

        let cpuid = CpuId::from_entries(&entries)
            .map_err(|_| KvmError::SetCpuid(kvm_ioctls::Error::new(libc::EINVAL)))?;
        vcpu.set_cpuid(&cpuid)?;

        let msrs = Msrs::from_entries(&[kvm_msr_entry {
            index: MSR_IA32_MISC_ENABLE,
            data: MISC_ENABLE_FAST_STRING,
            ..Default::default()
        }])
        .map_err(|_| KvmError::SetMsrs(kvm_ioctls::Error::new(libc::EINVAL)))?;
        vcpu.set_msrs(&msrs)?;

        Ok(())
    }
}

/// Compute the guest-physical ranges covering `mem_size` bytes: a single
/// region when the memory fits below the MMIO hole, otherwise two with
/// the remainder resuming above 4G.
pub fn memory_ranges(mem_size: u64) -> Vec<(u64, usize)> {
    if mem_size <= MMIO_HOLE_ADDR {
        vec![(0, mem_size as usize)]
    } else {
        vec![
            (0, MMIO_HOLE_ADDR as usize),
            (AFTER_MMIO_HOLE_ADDR, (mem_size - MMIO_HOLE_ADDR) as usize),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_memory_is_one_region() {
        assert_eq!(memory_ranges(1 << 20), vec![(0, 1 << 20)]);
        assert_eq!(memory_ranges(1 << 30), vec![(0, 1 << 30)]);
        assert_eq!(
            memory_ranges(MMIO_HOLE_ADDR),
            vec![(0, MMIO_HOLE_ADDR as usize)]
        );
    }

    #[test]
    fn large_memory_splits_around_the_hole() {
        let size = 8u64 << 30;
        let ranges = memory_ranges(size);

        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], (0, MMIO_HOLE_ADDR as usize));
        assert_eq!(ranges[1].0, AFTER_MMIO_HOLE_ADDR);
        assert_eq!(
            ranges[0].1 as u64 + ranges[1].1 as u64,
            size,
            "the regions cover all of memory"
        );
    }

    #[test]
    fn one_byte_past_the_hole() {
        let ranges = memory_ranges(MMIO_HOLE_ADDR + 1);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1], (AFTER_MMIO_HOLE_ADDR, 1));
    }
}
