//! A minimal KVM hypervisor.
//!
//! krypton boots a 64-bit Linux guest on top of KVM: it creates a VM and
//! its vCPU through `/dev/kvm`, allocates and partitions guest memory,
//! loads a bzImage (plus an optional initrd) for a long-mode entry, and
//! exposes virtio-mmio devices — console, block, and vsock — driven by a
//! packed virtqueue engine.
//!
//! The crate is a library plus a small CLI. The interesting entry points:
//!
//! - [`vmm::Vm`] — lifecycle: [`vmm::Vm::new`], [`vmm::Vm::run`],
//!   [`vmm::Vm::cancel`], [`vmm::Vm::close`].
//! - [`boot::LinuxLoader`] — the Linux boot protocol.
//! - [`devices::virtio`] — device handlers and the transport they sit on.
//!
//! Linux-only: everything here talks to KVM.

#[cfg(target_os = "linux")]
pub mod boot;
#[cfg(target_os = "linux")]
pub mod devices;
#[cfg(target_os = "linux")]
pub mod kvm;
#[cfg(target_os = "linux")]
pub mod vmm;
