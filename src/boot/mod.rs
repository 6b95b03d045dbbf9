//! Linux boot protocol loader.
//!
//! Boots a 64-bit bzImage directly into long mode, skipping real-mode
//! setup entirely: the loader builds the zeropage, a GDT, and identity
//! page tables in guest memory, places the kernel and optional initrd,
//! and points the boot processor at the kernel's 64-bit entry point.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/arch/x86/boot.html>
//!
//! # Guest physical layout
//!
//! ```text
//! 0x0000_1000  GDT (null, code, data, TSS)
//! 0x0000_2000  PML4
//! 0x0000_3000  PDPT
//! 0x0000_4000  PD (512 x 2 MiB identity mappings)
//! 0x0001_0000  zeropage (boot_params)
//! 0x0002_0000  kernel command line
//! 0x0010_0000  protected-mode kernel
//! high memory  initrd, as high as initrd_addr_max allows
//! ```

pub mod params;

use crate::vmm::memory::{GuestMemory, MemoryError};
use crate::vmm::{Loader, LoaderError, VmInfo};
use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};
use log::info;
use params::{BootParams, E820_TYPE_RAM, SETUP_HEADER_MAGIC, XLF_KERNEL_64};
use thiserror::Error;

/// Errors from parsing a kernel image or laying out guest memory.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("bzImage is too short for a boot header: {0} bytes")]
    ShortZeropage(usize),

    #[error("bad bzImage header magic: {0:#x} != {magic:#x}", magic = SETUP_HEADER_MAGIC)]
    BadMagic(u32),

    #[error("bzImage has no 64-bit entry point at +0x200")]
    NoLongModeEntry,

    #[error("bzImage is truncated: wants {want} bytes, has {have}")]
    TruncatedImage { want: usize, have: usize },

    #[error("guest memory is too small for the kernel")]
    MemoryTooSmall,

    #[error("only the boot processor can be loaded, not slot {0}")]
    UnsupportedSlot(usize),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

const GDT_ADDR: u64 = 0x1000;
const PML4_ADDR: u64 = 0x2000;
const PDPT_ADDR: u64 = 0x3000;
const PD_ADDR: u64 = 0x4000;
const ZEROPAGE_ADDR: u64 = 0x10000;
const CMDLINE_ADDR: u64 = 0x20000;
const KERNEL_ADDR: u64 = 0x10_0000;

// Entries are packed `base | flags | limit` in descriptor format; the
// flags word carries type/S/DPL/P in its low byte and AVL/L/DB/G in the
// high nibble.
const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << (56 - 24))
        | ((flags as u64 & 0x0000_f0ff) << 40)
        | ((limit as u64 & 0x000f_0000) << (48 - 16))
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
}

const GDT: [u64; 4] = [
    0,                               // null
    gdt_entry(0xa09b, 0, 0xfffff),   // code: 64-bit, present, type 0xb
    gdt_entry(0xc093, 0, 0xfffff),   // data: present, writable
    gdt_entry(0x808b, 0, 0xfffff),   // TSS: present, type 0xb
];

// setup_header loadflags bit 0: protected-mode code loads at 0x100000.
const LOADED_HIGH: u8 = 1 << 0;

// Page table entry bits.
const PTE_PRESENT_RW: u64 = 0x03;
const PTE_LARGE_PRESENT_RW: u64 = 0x83;

// Control register and EFER bits for long mode.
const CR0_PE: u64 = 1 << 0;
const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// Boots a 64-bit Linux kernel.
pub struct LinuxLoader {
    /// The kernel, a bzImage.
    pub kernel: Vec<u8>,

    /// Compressed cpio of the initial ramdisk, if any.
    pub initrd: Option<Vec<u8>>,

    /// The kernel command line. Device stanzas are prepended.
    pub cmdline: String,
}

impl LinuxLoader {
    fn load_memory_inner(&self, info: &VmInfo, mem: &GuestMemory) -> Result<(), BootError> {
        let image = BootParams::unmarshal(&self.kernel)?;

        let magic = image.hdr.header;
        if magic != SETUP_HEADER_MAGIC {
            return Err(BootError::BadMagic(magic));
        }

        if image.hdr.xloadflags & XLF_KERNEL_64 == 0 {
            return Err(BootError::NoLongModeEntry);
        }

        // Build a clean zeropage around the image's setup header.
        let mut params = BootParams::default();
        params.hdr = image.hdr;
        params.hdr.vid_mode = 0xffff;
        params.hdr.type_of_loader = 0xff;
        params.hdr.loadflags = LOADED_HIGH;

        // GDT and identity page tables: one PML4 entry, one PDPT entry,
        // 512 2-MiB pages covering the first gigabyte.
        for (i, entry) in GDT.iter().enumerate() {
            mem.write_obj(*entry, GDT_ADDR + i as u64 * 8)?;
        }

        mem.write_obj(PDPT_ADDR | PTE_PRESENT_RW, PML4_ADDR)?;
        mem.write_obj(PD_ADDR | PTE_PRESENT_RW, PDPT_ADDR)?;
        for i in 0..512u64 {
            mem.write_obj((i << 21) | PTE_LARGE_PRESENT_RW, PD_ADDR + i * 8)?;
        }

        // The command line starts with a stanza per virtio-mmio device
        // so the kernel can discover them.
        let mut args: Vec<String> = info
            .devices
            .iter()
            .map(|d| format!("virtio_mmio.device={:#x}@{:#x}:{}", d.size, d.addr, d.irq))
            .collect();
        args.extend(self.cmdline.split_whitespace().map(str::to_string));
        let cmdline = args.join(" ");

        let mut cmdline_z = cmdline.clone().into_bytes();
        cmdline_z.push(0);
        mem.write(CMDLINE_ADDR, &cmdline_z)?;

        params.hdr.cmd_line_ptr = CMDLINE_ADDR as u32;
        params.hdr.cmdline_size = cmdline.len() as u32 + 1;

        if let Some(initrd) = &self.initrd {
            // As high as the kernel allows, but inside guest memory,
            // rounded down to a page boundary.
            let addr_max = u64::from(image.hdr.initrd_addr_max).min(info.mem_size);
            let addr = (addr_max - initrd.len() as u64) & !0xfff;

            mem.write(addr, initrd)?;

            params.hdr.ramdisk_image = addr as u32;
            params.hdr.ramdisk_size = initrd.len() as u32;

            info!("initrd: {} bytes at {addr:#x}", initrd.len());
        }

        // The BIOS memory map: conventional memory below 640K, then RAM
        // from the kernel's load address up, split around the MMIO hole
        // when the guest is large enough to reach it.
        params.add_e820(0, 0x0009_fc00, E820_TYPE_RAM);

        let hole = crate::vmm::arch::MMIO_HOLE_ADDR;
        if info.mem_size <= hole {
            params.add_e820(KERNEL_ADDR, info.mem_size - KERNEL_ADDR, E820_TYPE_RAM);
        } else {
            params.add_e820(KERNEL_ADDR, hole - KERNEL_ADDR, E820_TYPE_RAM);
            params.add_e820(
                crate::vmm::arch::AFTER_MMIO_HOLE_ADDR,
                info.mem_size - hole,
                E820_TYPE_RAM,
            );
        }

        mem.write(ZEROPAGE_ADDR, &params.marshal())?;

        // The protected-mode kernel sits after the real-mode setup
        // sectors in the image.
        let offset = (1 + image.hdr.setup_sects as usize) * 512;
        let len = image.hdr.syssize as usize * 16;

        if self.kernel.len() < offset + len {
            return Err(BootError::TruncatedImage {
                want: offset + len,
                have: self.kernel.len(),
            });
        }

        if info.mem_size < KERNEL_ADDR + len as u64 {
            return Err(BootError::MemoryTooSmall);
        }

        mem.write(KERNEL_ADDR, &self.kernel[offset..offset + len])?;

        info!("kernel: {len} bytes at {KERNEL_ADDR:#x}, cmdline \"{cmdline}\"");

        Ok(())
    }
}

impl Loader for LinuxLoader {
    fn load_memory(&self, info: &VmInfo, mem: &GuestMemory) -> Result<(), LoaderError> {
        self.load_memory_inner(info, mem).map_err(Into::into)
    }

    fn load_vcpu(
        &self,
        _info: &VmInfo,
        slot: usize,
        regs: &mut kvm_regs,
        sregs: &mut kvm_sregs,
    ) -> Result<(), LoaderError> {
        if slot != 0 {
            return Err(BootError::UnsupportedSlot(slot).into());
        }

        sregs.gdt.base = GDT_ADDR;
        sregs.gdt.limit = (GDT.len() * 8 - 1) as u16;

        let code = kvm_segment {
            base: 0,
            limit: 0xfffff,
            selector: 0x8,
            type_: 0xb,
            present: 1,
            s: 1,
            l: 1,
            g: 1,
            ..Default::default()
        };

        let data = kvm_segment {
            base: 0,
            limit: 0xfffff,
            selector: 0x10,
            type_: 0x3,
            present: 1,
            db: 1,
            s: 1,
            g: 1,
            ..Default::default()
        };

        let tss = kvm_segment {
            base: 0,
            limit: 0xfffff,
            selector: 0x18,
            type_: 0xb,
            present: 1,
            g: 1,
            ..Default::default()
        };

        sregs.cs = code;
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;
        sregs.tr = tss;

        sregs.cr0 |= CR0_PE | CR0_PG;
        sregs.cr3 = PML4_ADDR;
        sregs.cr4 = CR4_PAE;
        sregs.efer |= EFER_LME | EFER_LMA;

        regs.rflags = 0x2;

        // The kernel finds its boot_params through RSI and enters 64-bit
        // code at +0x200.
        regs.rsi = ZEROPAGE_ADDR;
        regs.rip = KERNEL_ADDR + 0x200;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::mmio::DeviceInfo;
    use crate::devices::virtio::DeviceId;
    use params::ZEROPAGE_SIZE;

    const PAYLOAD_LEN: usize = 4096;

    /// A synthetic bzImage: a boot header plus a recognizable
    /// protected-mode payload after 3+1 setup sectors.
    fn fake_bzimage() -> Vec<u8> {
        let mut header = BootParams::default();
        header.hdr.header = SETUP_HEADER_MAGIC;
        header.hdr.xloadflags = XLF_KERNEL_64;
        header.hdr.setup_sects = 3;
        header.hdr.syssize = (PAYLOAD_LEN / 16) as u32;
        header.hdr.initrd_addr_max = 0x18_0000;

        let mut image = header.marshal();
        image.resize((1 + 3) * 512, 0);
        image.extend((0..PAYLOAD_LEN).map(|i| i as u8));
        image
    }

    fn test_info() -> VmInfo {
        VmInfo {
            mem_size: 2 << 20,
            num_cpu: 1,
            devices: vec![DeviceInfo {
                device_type: DeviceId::Console,
                irq: 5,
                addr: 0xd000_0000,
                size: 0x1000,
            }],
        }
    }

    fn loaded(loader: &LinuxLoader) -> GuestMemory {
        let mem = GuestMemory::new(&[(0, 2 << 20)]).unwrap();
        loader.load_memory_inner(&test_info(), &mem).unwrap();
        mem
    }

    #[test]
    fn rejects_bad_images() {
        let info = test_info();
        let mem = GuestMemory::new(&[(0, 2 << 20)]).unwrap();

        let short = LinuxLoader {
            kernel: vec![0; 100],
            initrd: None,
            cmdline: String::new(),
        };
        assert!(matches!(
            short.load_memory_inner(&info, &mem),
            Err(BootError::ShortZeropage(100))
        ));

        let unmagical = LinuxLoader {
            kernel: vec![0; ZEROPAGE_SIZE],
            initrd: None,
            cmdline: String::new(),
        };
        assert!(matches!(
            unmagical.load_memory_inner(&info, &mem),
            Err(BootError::BadMagic(0))
        ));

        let mut no64 = BootParams::default();
        no64.hdr.header = SETUP_HEADER_MAGIC;
        let legacy = LinuxLoader {
            kernel: no64.marshal(),
            initrd: None,
            cmdline: String::new(),
        };
        assert!(matches!(
            legacy.load_memory_inner(&info, &mem),
            Err(BootError::NoLongModeEntry)
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut image = fake_bzimage();
        image.truncate(image.len() - 1);

        let loader = LinuxLoader {
            kernel: image,
            initrd: None,
            cmdline: String::new(),
        };

        let mem = GuestMemory::new(&[(0, 2 << 20)]).unwrap();
        assert!(matches!(
            loader.load_memory_inner(&test_info(), &mem),
            Err(BootError::TruncatedImage { .. })
        ));
    }

    #[test]
    fn places_the_kernel() {
        let loader = LinuxLoader {
            kernel: fake_bzimage(),
            initrd: None,
            cmdline: "console=hvc0".into(),
        };
        let mem = loaded(&loader);

        let mut payload = vec![0u8; PAYLOAD_LEN];
        mem.read(KERNEL_ADDR, &mut payload).unwrap();
        assert_eq!(payload[0], 0);
        assert_eq!(payload[255], 255);
        assert_eq!(payload[256], 0);
    }

    #[test]
    fn builds_the_zeropage() {
        let loader = LinuxLoader {
            kernel: fake_bzimage(),
            initrd: None,
            cmdline: "console=hvc0 reboot=t".into(),
        };
        let mem = loaded(&loader);

        let mut raw = vec![0u8; ZEROPAGE_SIZE];
        mem.read(ZEROPAGE_ADDR, &mut raw).unwrap();
        let zp = BootParams::unmarshal(&raw).unwrap();

        assert_eq!({ zp.hdr.header }, SETUP_HEADER_MAGIC);
        assert_eq!({ zp.hdr.type_of_loader }, 0xff);
        assert_eq!({ zp.hdr.vid_mode }, 0xffff);
        assert_eq!({ zp.hdr.cmd_line_ptr }, CMDLINE_ADDR as u32);

        // Two RAM entries: below 640K and from 1M to the end of a small
        // guest.
        assert_eq!({ zp.e820_entries }, 2);
        assert_eq!(
            { zp.e820_table[0] },
            params::BootE820Entry {
                addr: 0,
                size: 0x9fc00,
                type_: E820_TYPE_RAM,
            }
        );
        assert_eq!(
            { zp.e820_table[1] },
            params::BootE820Entry {
                addr: KERNEL_ADDR,
                size: (2 << 20) - KERNEL_ADDR,
                type_: E820_TYPE_RAM,
            }
        );
    }

    #[test]
    fn cmdline_names_the_devices() {
        let loader = LinuxLoader {
            kernel: fake_bzimage(),
            initrd: None,
            cmdline: "console=hvc0".into(),
        };
        let mem = loaded(&loader);

        let mut raw = vec![0u8; 128];
        mem.read(CMDLINE_ADDR, &mut raw).unwrap();
        let nul = raw.iter().position(|&b| b == 0).unwrap();
        let cmdline = std::str::from_utf8(&raw[..nul]).unwrap();

        assert_eq!(
            cmdline,
            "virtio_mmio.device=0x1000@0xd0000000:5 console=hvc0"
        );
    }

    #[test]
    fn places_the_initrd_high_and_aligned() {
        let initrd = vec![0xabu8; 0x2345];
        let loader = LinuxLoader {
            kernel: fake_bzimage(),
            initrd: Some(initrd.clone()),
            cmdline: String::new(),
        };
        let mem = loaded(&loader);

        let mut raw = vec![0u8; ZEROPAGE_SIZE];
        mem.read(ZEROPAGE_ADDR, &mut raw).unwrap();
        let zp = BootParams::unmarshal(&raw).unwrap();

        let addr = u64::from(zp.hdr.ramdisk_image);
        assert_eq!(addr % 0x1000, 0);
        assert!(addr + initrd.len() as u64 <= 0x18_0000);
        assert_eq!({ zp.hdr.ramdisk_size }, initrd.len() as u32);

        let mut got = vec![0u8; initrd.len()];
        mem.read(addr, &mut got).unwrap();
        assert_eq!(got, initrd);
    }

    #[test]
    fn long_mode_registers() {
        let loader = LinuxLoader {
            kernel: fake_bzimage(),
            initrd: None,
            cmdline: String::new(),
        };

        let mut regs = kvm_regs::default();
        let mut sregs = kvm_sregs::default();
        loader.load_vcpu(&test_info(), 0, &mut regs, &mut sregs).unwrap();

        assert_eq!(regs.rip, KERNEL_ADDR + 0x200);
        assert_eq!(regs.rsi, ZEROPAGE_ADDR);
        assert_eq!(regs.rflags, 2);

        assert_eq!(sregs.cr3, PML4_ADDR);
        assert_eq!(sregs.cr4, CR4_PAE);
        assert_eq!(sregs.cr0 & (CR0_PE | CR0_PG), CR0_PE | CR0_PG);
        assert_eq!(sregs.efer & (EFER_LME | EFER_LMA), EFER_LME | EFER_LMA);

        assert_eq!(sregs.cs.selector, 0x8);
        assert_eq!(sregs.cs.l, 1);
        assert_eq!(sregs.ss.selector, 0x10);
        assert_eq!(sregs.tr.selector, 0x18);
        assert_eq!(sregs.gdt.base, GDT_ADDR);
        assert_eq!(sregs.gdt.limit, 31);

        assert!(loader.load_vcpu(&test_info(), 1, &mut regs, &mut sregs).is_err());
    }

    #[test]
    fn gdt_encoding() {
        assert_eq!(gdt_entry(0xa09b, 0, 0xfffff), 0x00af_9b00_0000_ffff);
        assert_eq!(gdt_entry(0xc093, 0, 0xfffff), 0x00cf_9300_0000_ffff);
        assert_eq!(gdt_entry(0x808b, 0, 0xfffff), 0x008f_8b00_0000_ffff);
    }

    #[test]
    fn identity_page_tables() {
        let loader = LinuxLoader {
            kernel: fake_bzimage(),
            initrd: None,
            cmdline: String::new(),
        };
        let mem = loaded(&loader);

        assert_eq!(mem.read_obj::<u64>(PML4_ADDR).unwrap(), PDPT_ADDR | 0x03);
        assert_eq!(mem.read_obj::<u64>(PDPT_ADDR).unwrap(), PD_ADDR | 0x03);
        assert_eq!(mem.read_obj::<u64>(PD_ADDR).unwrap(), 0x83);
        assert_eq!(
            mem.read_obj::<u64>(PD_ADDR + 511 * 8).unwrap(),
            (511 << 21) | 0x83
        );
    }
}
