//! Linux boot parameter structures.
//!
//! [`BootParams`] is the "zeropage", a bit-exact image of the kernel's
//! packed `struct boot_params`. Field names and offsets follow
//! Documentation/arch/x86/boot.html; reserved and obsolete regions are
//! kept as anonymous padding so the layout stays byte-for-byte right.

use crate::vmm::memory::ByteValued;
use std::mem::{offset_of, size_of};

/// Required value of [`SetupHeader::header`]: "HdrS".
pub const SETUP_HEADER_MAGIC: u32 = 0x5372_6448;

/// Size of the zeropage in bytes.
pub const ZEROPAGE_SIZE: usize = 0x1000;

/// xloadflags bit 0: the kernel has a 64-bit entry point at +0x200.
pub const XLF_KERNEL_64: u16 = 1 << 0;

/// The boot protocol's memory map entry (`struct boot_e820_entry`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootE820Entry {
    pub addr: u64,
    pub size: u64,
    pub type_: u32,
}

// SAFETY: packed plain-data struct.
unsafe impl ByteValued for BootE820Entry {}

/// RAM, as opposed to reserved/ACPI/etc regions.
pub const E820_TYPE_RAM: u32 = 1;

/// The part of the zeropage that explains how to boot the kernel
/// (`struct setup_header`). A boot loader copies it out of the bzImage,
/// customizes it, and copies it back into the zeropage it builds.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetupHeader {
    pub setup_sects: u8,
    pub root_flags: u16,
    pub syssize: u32,
    pub ram_size: u16,
    pub vid_mode: u16,
    pub root_dev: u16,
    pub boot_flag: u16,
    pub jump: u16,
    pub header: u32,
    pub version: u16,
    pub realmode_swtch: u32,
    pub start_sys_seg: u16,
    pub kernel_version: u16,
    pub type_of_loader: u8,
    pub loadflags: u8,
    pub setup_move_size: u16,
    pub code32_start: u32,
    pub ramdisk_image: u32,
    pub ramdisk_size: u32,
    pub bootsect_kludge: u32,
    pub heap_end_ptr: u16,
    pub ext_loader_ver: u8,
    pub ext_loader_type: u8,
    pub cmd_line_ptr: u32,
    pub initrd_addr_max: u32,
    pub kernel_alignment: u32,
    pub relocatable_kernel: u8,
    pub min_alignment: u8,
    pub xloadflags: u16,
    pub cmdline_size: u32,
    pub hardware_subarch: u32,
    pub hardware_subarch_data: u64,
    pub payload_offset: u32,
    pub payload_length: u32,
    pub setup_data: u64,
    pub pref_address: u64,
    pub init_size: u32,
    pub handover_offset: u32,
    pub kernel_info_offset: u32,
}

// SAFETY: packed plain-data struct.
unsafe impl ByteValued for SetupHeader {}

/// The zeropage (`struct boot_params`).
#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BootParams {
    _screen_info: [u8; 64],       // 0x000
    _apm_bios_info: [u8; 20],     // 0x040
    _pad2: [u8; 4],               // 0x054
    _tboot_addr: u64,             // 0x058
    _ist_info: [u8; 16],          // 0x060
    _acpi_rsdp_addr: u64,         // 0x070
    _pad3: [u8; 8],               // 0x078
    _hd0_info: [u8; 16],          // 0x080
    _hd1_info: [u8; 16],          // 0x090
    _sys_desc_table: [u8; 16],    // 0x0a0
    _olpc_ofw_header: [u8; 16],   // 0x0b0
    _ext_ramdisk_image: u32,      // 0x0c0
    _ext_ramdisk_size: u32,       // 0x0c4
    _ext_cmd_line_ptr: u32,       // 0x0c8
    _pad4: [u8; 112],             // 0x0cc
    _cc_blob_address: u32,        // 0x13c
    _edid_info: [u8; 128],        // 0x140
    _efi_info: [u8; 32],          // 0x1c0
    _alt_mem_k: u32,              // 0x1e0
    _scratch: u32,                // 0x1e4
    pub e820_entries: u8,         // 0x1e8
    _eddbuf_entries: u8,          // 0x1e9
    _edd_mbr_sig_buf_entries: u8, // 0x1ea
    _kbd_status: u8,              // 0x1eb
    _secure_boot: u8,             // 0x1ec
    _pad5: [u8; 2],               // 0x1ed
    _sentinel: u8,                // 0x1ef
    _pad6: [u8; 1],               // 0x1f0
    pub hdr: SetupHeader,         // 0x1f1
    _pad7: [u8; 36],
    _edd_mbr_sig_buffer: [u8; 64], // 0x290
    pub e820_table: [BootE820Entry; 128], // 0x2d0
    _pad8: [u8; 48],              // 0xcd0
    _eddbuf: [u8; 492],           // 0xd00
    _pad9: [u8; 276],             // 0xeec
}

// SAFETY: packed plain-data struct.
unsafe impl ByteValued for BootParams {}

impl Default for BootParams {
    fn default() -> Self {
        // SAFETY: every field is plain data for which zero is valid.
        unsafe { std::mem::zeroed() }
    }
}

const _: () = assert!(size_of::<BootParams>() == ZEROPAGE_SIZE);
const _: () = assert!(size_of::<SetupHeader>() == 123);
const _: () = assert!(size_of::<BootE820Entry>() == 20);
const _: () = assert!(offset_of!(BootParams, hdr) == 0x1f1);
const _: () = assert!(offset_of!(BootParams, e820_table) == 0x2d0);

impl BootParams {
    /// Serialize into the packed on-disk/in-memory layout. Always
    /// exactly [`ZEROPAGE_SIZE`] bytes.
    pub fn marshal(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Parse a packed zeropage. Fails on fewer than
    /// [`ZEROPAGE_SIZE`] bytes.
    pub fn unmarshal(data: &[u8]) -> Result<Self, super::BootError> {
        if data.len() < ZEROPAGE_SIZE {
            return Err(super::BootError::ShortZeropage(data.len()));
        }

        Ok(*Self::from_slice(&data[..ZEROPAGE_SIZE]).expect("size and alignment checked"))
    }

    /// Append an E820 entry.
    pub fn add_e820(&mut self, addr: u64, size: u64, type_: u32) {
        self.e820_table[self.e820_entries as usize] = BootE820Entry { addr, size, type_ };
        self.e820_entries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_pinned() {
        // The "HdrS" magic lands at its documented offset.
        assert_eq!(offset_of!(BootParams, hdr) + offset_of!(SetupHeader, header), 0x202);
        assert_eq!(offset_of!(SetupHeader, xloadflags), 0x236 - 0x1f1);
    }

    #[test]
    fn marshal_roundtrip() {
        let mut bp = BootParams::default();
        bp.hdr.header = SETUP_HEADER_MAGIC;
        bp.hdr.setup_sects = 4;
        bp.hdr.syssize = 0x1234;
        bp.hdr.cmd_line_ptr = 0x20000;
        bp.add_e820(0, 0x9fc00, E820_TYPE_RAM);
        bp.add_e820(0x10_0000, 0x100_0000, E820_TYPE_RAM);

        let raw = bp.marshal();
        assert_eq!(raw.len(), ZEROPAGE_SIZE);

        // Spot-check wire offsets.
        assert_eq!(&raw[0x202..0x206], &SETUP_HEADER_MAGIC.to_le_bytes());
        assert_eq!(raw[0x1e8], 2, "e820 entry count");
        assert_eq!(&raw[0x2d0 + 8..0x2d0 + 16], &0x9fc00u64.to_le_bytes());

        let back = BootParams::unmarshal(&raw).unwrap();
        assert!(back == bp);
    }

    #[test]
    fn unmarshal_short_fails() {
        assert!(BootParams::unmarshal(&[0u8; 100]).is_err());
        assert!(BootParams::unmarshal(&[0u8; ZEROPAGE_SIZE - 1]).is_err());
        assert!(BootParams::unmarshal(&[0u8; ZEROPAGE_SIZE]).is_ok());
    }
}
