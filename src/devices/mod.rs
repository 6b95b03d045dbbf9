//! Device emulation.

pub mod virtio;
