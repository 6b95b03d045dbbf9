//! vCPU file descriptor wrapper and the shared run-state mapping.

use super::KvmError;
use kvm_bindings::{kvm_regs, kvm_run, kvm_sregs, CpuId, Msrs};
use kvm_ioctls::VcpuExit;
use std::mem::offset_of;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// A vCPU handle: the underlying fd plus its shared run-state mapping.
///
/// All ioctls on the fd must happen on the vCPU's dedicated OS thread
/// (KVM serializes vCPU state per thread); the run-state mapping is the
/// one piece that is shared, so other threads can request an immediate
/// exit or inspect the last exit reason.
pub struct Vcpu {
    fd: kvm_ioctls::VcpuFd,
    state: Arc<RunState>,
}

impl Vcpu {
    pub(super) fn new(fd: kvm_ioctls::VcpuFd, mmap_size: usize) -> Result<Self, KvmError> {
        let state = Arc::new(RunState::map(fd.as_raw_fd(), mmap_size)?);
        Ok(Self { fd, state })
    }

    /// The shared run-state region. Clones stay valid for the life of the
    /// mapping, which outlives the last holder.
    pub fn state(&self) -> Arc<RunState> {
        Arc::clone(&self.state)
    }

    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.fd.get_regs().map_err(KvmError::GetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.fd.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.fd.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.fd.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    pub fn set_cpuid(&self, cpuid: &CpuId) -> Result<(), KvmError> {
        self.fd.set_cpuid2(cpuid).map_err(KvmError::SetCpuid)
    }

    pub fn set_msrs(&self, msrs: &Msrs) -> Result<(), KvmError> {
        self.fd.set_msrs(msrs).map(|_| ()).map_err(KvmError::SetMsrs)
    }

    /// Enter the guest until the next exit.
    pub fn run(&mut self) -> Result<VcpuExit<'_>, kvm_ioctls::Error> {
        self.fd.run()
    }
}

/// The vCPU's shared run-state region, a mapping of `struct kvm_run`.
///
/// Only two fields are touched through this mapping: `immediate_exit`,
/// which the canceller sets from another thread, and `exit_reason`, which
/// callers may read after a run returns. Exit payloads are decoded by the
/// binding layer.
pub struct RunState {
    ptr: *mut u8,
    len: usize,
}

// The mapping is plain shared memory; cross-thread access is limited to
// the atomic and volatile accessors below.
unsafe impl Send for RunState {}
unsafe impl Sync for RunState {}

impl RunState {
    fn map(fd: i32, len: usize) -> Result<Self, KvmError> {
        // SAFETY: mapping a vCPU fd at offset 0 is the documented way to
        // reach struct kvm_run; the length comes from KVM_GET_VCPU_MMAP_SIZE.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(KvmError::MapRunState(std::io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    /// Ask KVM to return from the next (or current) `KVM_RUN` entry with
    /// EINTR instead of entering the guest.
    ///
    /// The store has release ordering so the flag is visible to the vCPU
    /// thread before whatever kick follows it.
    pub fn set_immediate_exit(&self, value: bool) {
        // SAFETY: offset is within the mapping and the field is a single
        // byte, accessed atomically on all sides.
        let flag = unsafe {
            AtomicU8::from_ptr(self.ptr.add(offset_of!(kvm_run, immediate_exit)))
        };
        flag.store(value as u8, Ordering::Release);
    }

    /// The reason for the most recent exit, one of the `KVM_EXIT_*` values.
    pub fn exit_reason(&self) -> u32 {
        // SAFETY: offset is within the mapping; the kernel only updates the
        // field while the vCPU thread is inside KVM_RUN.
        unsafe {
            (self.ptr.add(offset_of!(kvm_run, exit_reason)) as *const u32).read_volatile()
        }
    }
}

impl Drop for RunState {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and nothing else
        // unmaps the region.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}
