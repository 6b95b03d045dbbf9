//! VM lifecycle: configuration, ordered construction, the vCPU run
//! loop, cancellation, and teardown.
//!
//! Construction follows a strict order, each step depending on the one
//! before it: validate KVM, arch VM setup, allocate and install guest
//! memory, create the vCPU on its own thread, build the MMIO bus, wire
//! device irqfds, then let the loader fill memory and registers. The
//! steady state is one thread blocked in `KVM_RUN` dispatching MMIO
//! exits to the bus while queue workers move data.

pub mod arch;
pub mod memory;
mod vcpu;

use crate::devices::virtio::mmio::{Bus, DeviceInfo};
use crate::devices::virtio::DeviceHandler;
use crate::kvm::{Kvm, KvmError, RunState};
use arch::{ArchSetup, X86Arch};
use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit;
use log::{debug, error, info};
use memory::{GuestMemory, MemoryError};
use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;
use vcpu::VcpuWorker;
use vmm_sys_util::eventfd::EventFd;

/// Smallest usable guest memory.
pub const MEM_SIZE_MIN: u64 = 1 << 20;

/// Guest memory size when the config leaves it zero.
pub const MEM_SIZE_DEFAULT: u64 = 1 << 30;

/// Largest supported guest memory.
pub const MEM_SIZE_MAX: u64 = 1 << 40;

/// Boxed error type loaders report; the VM wraps it with context.
pub type LoaderError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from VM construction, running, and teardown.
#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("memory allocation failed: {0}")]
    AllocMemory(#[source] MemoryError),

    #[error("arch setup failed: {0}")]
    Setup(#[source] KvmError),

    #[error("failed to spawn vCPU thread: {0}")]
    SpawnVcpu(#[source] io::Error),

    #[error("vCPU setup failed on slot {slot}: {err}")]
    SetupVcpu {
        slot: usize,
        #[source]
        err: KvmError,
    },

    #[error("irqfd setup failed: {0}")]
    SetupIrqfd(#[source] io::Error),

    #[error("memory load failed: {0}")]
    LoadMemory(#[source] LoaderError),

    #[error("vCPU load failed on slot {slot}: {err}")]
    LoadVcpu {
        slot: usize,
        #[source]
        err: LoaderError,
    },

    #[error("KVM_RUN failed: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("unexpected vCPU exit: {0}")]
    UnexpectedExit(String),

    #[error("canceled")]
    Canceled,

    #[error("the VM is closed")]
    Closed,
}

/// Describes a new VM.
pub struct Config {
    /// Guest memory size in bytes, a multiple of the host page size.
    /// Zero selects [`MEM_SIZE_DEFAULT`].
    pub mem_size: u64,

    /// Virtio-mmio devices, installed on the bus in order.
    pub devices: Vec<Arc<dyn DeviceHandler>>,

    /// Prepares guest memory and vCPU registers before boot.
    pub loader: Box<dyn Loader>,

    /// Arch-specific setup override. The default is [`X86Arch`]; setting
    /// this is mostly useful for tests.
    pub arch: Option<Box<dyn ArchSetup>>,
}

/// A configured VM in the form loaders consume.
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub mem_size: u64,
    pub num_cpu: usize,
    pub devices: Vec<DeviceInfo>,
}

/// Prepares a VM to run: `load_memory` fills guest memory, `load_vcpu`
/// the boot processor's registers.
pub trait Loader: Send + Sync {
    fn load_memory(&self, info: &VmInfo, mem: &GuestMemory) -> Result<(), LoaderError>;

    fn load_vcpu(
        &self,
        info: &VmInfo,
        slot: usize,
        regs: &mut kvm_regs,
        sregs: &mut kvm_sregs,
    ) -> Result<(), LoaderError>;
}

/// A running (or runnable) virtual machine.
pub struct Vm {
    cpus: Vec<Arc<VcpuWorker>>,
    run_states: Vec<Arc<RunState>>,
    bus: Arc<Bus>,
    irqfds: Arc<Mutex<HashMap<u32, EventFd>>>,

    /// The VM fd and guest memory, released at close. Queue workers hold
    /// their own memory clones, so the mapping outlives this handle if
    /// they are still draining.
    resources: Mutex<Option<VmResources>>,

    cancel_evt: EventFd,
    done: AtomicBool,
}

struct VmResources {
    #[allow(dead_code)]
    kvm_vm: Arc<crate::kvm::Vm>,
    #[allow(dead_code)]
    mem: GuestMemory,
}

impl Vm {
    /// Create a new VM.
    pub fn new(cfg: Config) -> Result<Self, VmError> {
        let kvm = Kvm::open()?;

        let mem_size = if cfg.mem_size == 0 {
            MEM_SIZE_DEFAULT
        } else {
            cfg.mem_size
        };
        validate_mem_size(mem_size)?;

        let arch: Arc<dyn ArchSetup> = match cfg.arch {
            Some(arch) => Arc::from(arch),
            None => Arc::new(X86Arch::new(&kvm)?),
        };

        let kvm_vm = Arc::new(kvm.create_vm()?);

        // Arch-specific "hardware": irqchip, PIT, TSS.
        arch.setup_vm(&kvm_vm).map_err(VmError::Setup)?;

        // Allocate and install guest memory.
        let mem =
            GuestMemory::new(&arch.memory_ranges(mem_size)).map_err(VmError::AllocMemory)?;

        for (slot, region) in mem.regions().iter().enumerate() {
            // SAFETY: the regions stay mapped for the VM's lifetime; the
            // device workers hold the memory alive even past close.
            unsafe {
                kvm_vm.set_user_memory_region(
                    slot as u32,
                    region.guest_addr,
                    region.size,
                    region.host_addr,
                )?;
            }
        }

        let mmap_size = kvm.vcpu_mmap_size()?;

        // Create the vCPUs, each on its own thread. The data model
        // carries N but construction builds exactly one boot processor.
        let num_cpu = 1;
        let mut cpus = Vec::with_capacity(num_cpu);
        let mut run_states = Vec::with_capacity(num_cpu);

        for slot in 0..num_cpu {
            let worker = Arc::new(
                VcpuWorker::spawn(format!("vcpu{slot}")).map_err(VmError::SpawnVcpu)?,
            );

            let vm = Arc::clone(&kvm_vm);
            let arch = Arc::clone(&arch);

            let state = worker.call(move |slot_vcpu| -> Result<Arc<RunState>, VmError> {
                let vcpu = vm
                    .create_vcpu(slot as u64, mmap_size)
                    .map_err(|err| VmError::SetupVcpu { slot, err })?;

                arch.setup_vcpu(slot, &vcpu)
                    .map_err(|err| VmError::SetupVcpu { slot, err })?;

                let state = vcpu.state();
                *slot_vcpu = Some(vcpu);
                Ok(state)
            })??;

            run_states.push(state);
            cpus.push(worker);
        }

        // The bus reaches back for memory and IRQs through two narrow
        // handles captured here, not through the VM itself.
        let irqfds: Arc<Mutex<HashMap<u32, EventFd>>> = Arc::new(Mutex::new(HashMap::new()));
        let notify_fds = Arc::clone(&irqfds);

        let bus = Arc::new(Bus::new(
            cfg.devices,
            mem.clone(),
            Box::new(move |irq| {
                if let Some(fd) = notify_fds.lock().unwrap().get(&irq) {
                    fd.write(1)?;
                }

                Ok(())
            }),
        ));

        let info = VmInfo {
            mem_size,
            num_cpu: cpus.len(),
            devices: bus.devices(),
        };

        // Wire up device IRQs.
        for device in &info.devices {
            let evt = EventFd::new(libc::EFD_NONBLOCK).map_err(VmError::SetupIrqfd)?;
            kvm_vm.register_irqfd(&evt, device.irq)?;
            irqfds.lock().unwrap().insert(device.irq, evt);

            debug!(
                "installed virtio {} at {:#x} irq {}",
                device.device_type, device.addr, device.irq
            );
        }

        // Hand memory and registers to the loader.
        let loader: Arc<dyn Loader> = Arc::from(cfg.loader);
        loader
            .load_memory(&info, &mem)
            .map_err(VmError::LoadMemory)?;

        for (slot, worker) in cpus.iter().enumerate() {
            let loader = Arc::clone(&loader);
            let info = info.clone();

            worker.call(move |slot_vcpu| -> Result<(), VmError> {
                let vcpu = slot_vcpu.as_ref().ok_or(VmError::Closed)?;

                let mut regs = vcpu.get_regs()?;
                let mut sregs = vcpu.get_sregs()?;

                loader
                    .load_vcpu(&info, slot, &mut regs, &mut sregs)
                    .map_err(|err| VmError::LoadVcpu { slot, err })?;

                vcpu.set_regs(&regs)?;
                vcpu.set_sregs(&sregs)?;

                Ok(())
            })??;
        }

        info!(
            "vm ready: {} MiB, {} virtio device(s)",
            mem_size >> 20,
            info.devices.len()
        );

        Ok(Self {
            cpus,
            run_states,
            bus,
            irqfds,
            resources: Mutex::new(Some(VmResources { kvm_vm, mem })),
            cancel_evt: EventFd::new(0).map_err(VmError::SetupIrqfd)?,
            done: AtomicBool::new(false),
        })
    }

    /// The boot processor's shared run state, for callers that want to
    /// inspect the last exit reason.
    pub fn vcpu_state(&self, slot: usize) -> Option<Arc<RunState>> {
        self.run_states.get(slot).cloned()
    }

    /// Ask a blocked [`Vm::run`] to return [`VmError::Canceled`].
    pub fn cancel(&self) {
        let _ = self.cancel_evt.write(1);
    }

    /// Run the boot processor until the guest halts or shuts down, an
    /// unrecoverable exit occurs, or [`Vm::cancel`] fires.
    pub fn run(&self) -> Result<(), VmError> {
        if self.done.load(Ordering::Acquire) {
            return Err(VmError::Closed);
        }

        let canceled = Arc::new(AtomicBool::new(false));
        let finished = EventFd::new(0).map_err(VmError::SetupIrqfd)?;

        // The canceller waits for the cancellation signal and translates
        // it into an immediate-exit request plus a kick, so the vCPU
        // leaves the guest even if it never exits on its own.
        let canceller = {
            let cancel_evt = self.cancel_evt.try_clone().map_err(VmError::SetupIrqfd)?;
            let finished = finished.try_clone().map_err(VmError::SetupIrqfd)?;
            let run_state = Arc::clone(&self.run_states[0]);
            let worker = Arc::clone(&self.cpus[0]);
            let canceled = Arc::clone(&canceled);

            thread::Builder::new()
                .name("vm-canceller".into())
                .spawn(move || {
                    let mut fds = [
                        libc::pollfd {
                            fd: cancel_evt.as_raw_fd(),
                            events: libc::POLLIN,
                            revents: 0,
                        },
                        libc::pollfd {
                            fd: finished.as_raw_fd(),
                            events: libc::POLLIN,
                            revents: 0,
                        },
                    ];

                    loop {
                        // SAFETY: two valid pollfds.
                        let n = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
                        if n >= 0 || io::Error::last_os_error().raw_os_error()
                            != Some(libc::EINTR)
                        {
                            break;
                        }
                    }

                    if fds[0].revents & libc::POLLIN != 0 {
                        canceled.store(true, Ordering::SeqCst);
                        run_state.set_immediate_exit(true);
                        worker.kick();
                    }
                })
                .map_err(VmError::SpawnVcpu)?
        };

        let bus = Arc::clone(&self.bus);
        let was_canceled = Arc::clone(&canceled);

        let call_res = self.cpus[0].call(move |slot_vcpu| -> Result<(), VmError> {
            let vcpu = slot_vcpu.as_mut().ok_or(VmError::Closed)?;

            loop {
                match vcpu.run() {
                    Err(err) if err.errno() == libc::EINTR => {
                        if was_canceled.load(Ordering::SeqCst) {
                            vcpu.state().set_immediate_exit(false);
                            return Err(VmError::Canceled);
                        }
                    }

                    Err(err) => return Err(VmError::Run(err)),

                    Ok(VcpuExit::IoIn(..)) | Ok(VcpuExit::IoOut(..)) => {
                        // PIO is absorbed; nothing lives on port space.
                    }

                    Ok(VcpuExit::MmioRead(addr, data)) => {
                        match bus.handle_mmio(addr, data, false) {
                            Ok(false) => debug!("unclaimed mmio read at {addr:#x}"),
                            Ok(true) => {}
                            Err(err) => error!("mmio read at {addr:#x}: {err}"),
                        }
                    }

                    Ok(VcpuExit::MmioWrite(addr, data)) => {
                        let mut buf = data.to_vec();
                        match bus.handle_mmio(addr, &mut buf, true) {
                            Ok(false) => debug!("unclaimed mmio write at {addr:#x}"),
                            Ok(true) => {}
                            Err(err) => error!("mmio write at {addr:#x}: {err}"),
                        }
                    }

                    Ok(VcpuExit::Hlt) => return Ok(()),
                    Ok(VcpuExit::Shutdown) => return Ok(()),

                    Ok(other) => {
                        return Err(VmError::UnexpectedExit(format!("{other:?}")));
                    }
                }
            }
        });

        let _ = finished.write(1);
        let _ = canceller.join();

        call_res.unwrap_or(Err(VmError::Closed))
    }

    /// Stop the VM and release its resources: close the vCPU operation
    /// queues and wait for their threads, shut the bus and its devices
    /// down, then drop the KVM handles. A second call fails with
    /// [`VmError::Closed`].
    pub fn close(&self) -> Result<(), VmError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(VmError::Closed);
        }

        for cpu in &self.cpus {
            cpu.close();
        }

        self.bus.close();

        // Detach the irqfds from the routing table and release the VM fd
        // and our memory handle.
        self.irqfds.lock().unwrap().clear();
        self.resources.lock().unwrap().take();

        Ok(())
    }
}

fn validate_mem_size(mem_size: u64) -> Result<(), VmError> {
    // SAFETY: sysconf with a valid name.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;

    if mem_size % page_size != 0 {
        return Err(VmError::Config(format!(
            "memory size must be a multiple of the host page size ({page_size})"
        )));
    }

    if mem_size < MEM_SIZE_MIN {
        return Err(VmError::Config(format!(
            "memory is too small: {mem_size} < {MEM_SIZE_MIN}"
        )));
    }

    if mem_size > MEM_SIZE_MAX {
        return Err(VmError::Config(format!(
            "memory is too large: {mem_size} > {MEM_SIZE_MAX}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvm::Vm as KvmVm;
    use std::time::{Duration, Instant};

    fn kvm_available() -> bool {
        std::path::Path::new("/dev/kvm").exists()
    }

    /// Bare-metal arch: no irqchip, so HLT reaches userspace.
    struct TestArch;

    impl ArchSetup for TestArch {
        fn setup_vm(&self, _vm: &KvmVm) -> Result<(), KvmError> {
            Ok(())
        }

        fn memory_ranges(&self, mem_size: u64) -> Vec<(u64, usize)> {
            vec![(0, mem_size as usize)]
        }

        fn setup_vcpu(&self, _slot: usize, _vcpu: &crate::kvm::Vcpu) -> Result<(), KvmError> {
            Ok(())
        }
    }

    /// Loads a tiny real-mode program at address zero and points the
    /// vCPU at it.
    struct CodeLoader {
        code: &'static [u8],
    }

    impl Loader for CodeLoader {
        fn load_memory(&self, _info: &VmInfo, mem: &GuestMemory) -> Result<(), LoaderError> {
            mem.write(0, self.code)?;
            Ok(())
        }

        fn load_vcpu(
            &self,
            _info: &VmInfo,
            _slot: usize,
            regs: &mut kvm_regs,
            sregs: &mut kvm_sregs,
        ) -> Result<(), LoaderError> {
            sregs.cs.base = 0;
            sregs.cs.selector = 0;
            regs.rip = 0;
            regs.rflags = 2;
            Ok(())
        }
    }

    fn test_vm(code: &'static [u8]) -> Vm {
        Vm::new(Config {
            mem_size: MEM_SIZE_MIN,
            devices: vec![],
            loader: Box::new(CodeLoader { code }),
            arch: Some(Box::new(TestArch)),
        })
        .unwrap()
    }

    #[test]
    fn mem_size_validation() {
        assert!(validate_mem_size(MEM_SIZE_MIN).is_ok());
        assert!(validate_mem_size(MEM_SIZE_MIN + 1).is_err());
        assert!(validate_mem_size(4096).is_err(), "below the minimum");
        assert!(validate_mem_size(MEM_SIZE_MAX + (1 << 20)).is_err());
    }

    #[test]
    fn halt_program() {
        if !kvm_available() {
            return;
        }

        // A single HLT at the reset vector.
        let vm = test_vm(&[0xf4]);
        vm.run().unwrap();

        assert_eq!(
            vm.vcpu_state(0).unwrap().exit_reason(),
            kvm_bindings::KVM_EXIT_HLT
        );

        vm.close().unwrap();
        assert!(matches!(vm.close(), Err(VmError::Closed)));
    }

    #[test]
    fn run_after_close_fails() {
        if !kvm_available() {
            return;
        }

        let vm = test_vm(&[0xf4]);
        vm.close().unwrap();
        assert!(matches!(vm.run(), Err(VmError::Closed)));
    }

    #[test]
    fn cancellation_interrupts_a_spinning_guest() {
        if !kvm_available() {
            return;
        }

        // jmp $ — never exits on its own.
        let vm = Arc::new(test_vm(&[0xeb, 0xfe]));

        let canceller = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                vm.cancel();
            })
        };

        let start = Instant::now();
        let res = vm.run();
        canceller.join().unwrap();

        assert!(matches!(res, Err(VmError::Canceled)), "got {res:?}");
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "cancellation took {:?}",
            start.elapsed()
        );

        vm.close().unwrap();
    }
}
