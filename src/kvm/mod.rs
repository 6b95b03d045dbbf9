//! KVM (Kernel-based Virtual Machine) adapter.
//!
//! This module is a thin layer over the `kvm-ioctls` bindings. It owns the
//! small amount of policy the rest of the crate relies on:
//!
//! - opening `/dev/kvm` and validating that the API is stable and the
//!   capabilities we depend on are present,
//! - VM-level plumbing (memory slots, irqfds, the in-kernel irqchip/PIT),
//! - vCPU-level plumbing, including the shared run-state mapping used for
//!   cancellation.
//!
//! Everything else — struct layouts, ioctl numbers, exit decoding — is
//! `kvm-ioctls`/`kvm-bindings` territory and stays there.

mod vcpu;
mod vm;

pub use vcpu::{RunState, Vcpu};
pub use vm::Vm;

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::{Cap, Kvm as KvmFd};
use thiserror::Error;

/// Errors surfaced by the KVM adapter.
#[derive(Error, Debug)]
pub enum KvmError {
    /// /dev/kvm could not be opened. KVM may be unavailable or the
    /// process may lack permission.
    #[error("failed to open /dev/kvm: {0}")]
    Open(#[source] kvm_ioctls::Error),

    /// The kernel speaks a different KVM API version.
    #[error("unstable KVM API version: {0} != {expected}", expected = KVM_STABLE_API_VERSION)]
    ApiVersion(i32),

    /// A capability this hypervisor depends on is missing.
    #[error("missing KVM capabilities: {0:?}")]
    MissingCaps(Vec<Cap>),

    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to get vCPU mmap size: {0}")]
    GetVcpuMmapSize(#[source] kvm_ioctls::Error),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to create PIT: {0}")]
    CreatePit(#[source] kvm_ioctls::Error),

    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to register irqfd for GSI {gsi}: {err}")]
    RegisterIrqfd {
        gsi: u32,
        #[source]
        err: kvm_ioctls::Error,
    },

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to map vCPU run state: {0}")]
    MapRunState(#[source] std::io::Error),

    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("KVM_RUN failed: {0}")]
    Run(#[source] kvm_ioctls::Error),
}

/// The one stable KVM API version, unchanged since Linux 2.6.
pub const KVM_STABLE_API_VERSION: i32 = 12;

/// Capabilities the VM lifecycle depends on. Checked once at open time.
const REQUIRED_CAPS: &[Cap] = &[
    Cap::Irqchip,
    Cap::Hlt,
    Cap::UserMemory,
    Cap::Irqfd,
    Cap::CheckExtensionVm,
    Cap::ImmediateExit,
];

/// An open handle to /dev/kvm, validated for API stability and the
/// capabilities this crate requires.
pub struct Kvm {
    fd: KvmFd,
}

impl Kvm {
    /// Open /dev/kvm and validate it.
    pub fn open() -> Result<Self, KvmError> {
        let fd = KvmFd::new().map_err(KvmError::Open)?;

        let version = fd.get_api_version();
        if version != KVM_STABLE_API_VERSION {
            return Err(KvmError::ApiVersion(version));
        }

        let missing: Vec<Cap> = REQUIRED_CAPS
            .iter()
            .copied()
            .filter(|&cap| !fd.check_extension(cap))
            .collect();

        if !missing.is_empty() {
            return Err(KvmError::MissingCaps(missing));
        }

        Ok(Self { fd })
    }

    /// CPUID entries supported by the host CPU and KVM together, suitable
    /// as a baseline for `KVM_SET_CPUID2`.
    pub fn supported_cpuid(&self) -> Result<kvm_bindings::CpuId, KvmError> {
        self.fd
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(KvmError::GetSupportedCpuid)
    }

    /// Size of the per-vCPU shared run-state mapping.
    pub fn vcpu_mmap_size(&self) -> Result<usize, KvmError> {
        self.fd
            .get_vcpu_mmap_size()
            .map_err(KvmError::GetVcpuMmapSize)
    }

    /// Create a new VM.
    pub fn create_vm(&self) -> Result<Vm, KvmError> {
        let vm = self.fd.create_vm().map_err(KvmError::CreateVm)?;
        Ok(Vm::new(vm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvm_available() -> bool {
        std::path::Path::new("/dev/kvm").exists()
    }

    #[test]
    fn open_validates() {
        if !kvm_available() {
            return;
        }

        let kvm = Kvm::open().unwrap();
        assert!(kvm.vcpu_mmap_size().unwrap() >= 0x1000);
        assert!(!kvm.supported_cpuid().unwrap().as_slice().is_empty());
    }
}
