//! Virtio block device with pluggable storage.
//!
//! A single request queue carries three-descriptor chains: a 16-byte
//! read-only header, a data buffer, and a one-byte write-only status.
//! Storage backends implement [`BlockStorage`]; writes are optional and
//! detected once when the driver brings the device up.

use super::queue::{Chain, Virtq};
use super::{DeviceHandler, DeviceId, VirtioError};
use crate::vmm::memory::ByteValued;
use log::{error, warn};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// VIRTIO_BLK_F_RO: device is read-only.
pub const BLK_F_RO: u64 = 1 << 5;

const SECTOR_SIZE: u64 = 512;

// request types

const BLK_T_IN: u32 = 0;
const BLK_T_OUT: u32 = 1;

// request status bytes

const BLK_S_OK: u8 = 0;
const BLK_S_IOERR: u8 = 1;
const BLK_S_UNSUPP: u8 = 2;

/// Backing storage for a block device.
///
/// Storage is read-only at the trait level; writable backends additionally
/// implement `write_at` and report it via `writable`.
pub trait BlockStorage: Send + Sync {
    /// Read up to `buf.len()` bytes at byte offset `offset`, returning how
    /// many were read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Storage size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Write `buf` at byte offset `offset`. Backends that stay read-only
    /// keep the default.
    fn write_at(&self, _buf: &[u8], _offset: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "storage is read-only",
        ))
    }

    /// Whether this backend supports `write_at`.
    fn writable(&self) -> bool {
        false
    }
}

/// Layout of the device config space, as in `struct virtio_blk_config`.
/// Only `capacity` is populated.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
struct BlockConfig {
    capacity: u64, // in 512-byte sectors
    size_max: u32,
    seg_max: u32,
    geometry_cylinders: u16,
    geometry_heads: u8,
    geometry_sectors: u8,
    blk_size: u32,
    topology_physical_block_exp: u8,
    topology_alignment_offset: u8,
    topology_min_io_size: u16,
    topology_opt_io_size: u32,
    writeback: u8,
    _unused0: u8,
    num_queues: u16,
    max_discard_sectors: u32,
    max_discard_seg: u32,
    discard_sector_alignment: u32,
    max_write_zeroes_sectors: u32,
    max_write_zeroes_seg: u32,
    write_zeroes_may_unmap: u8,
    _unused1: [u8; 3],
    max_secure_erase_sectors: u32,
    max_secure_erase_seg: u32,
    secure_erase_sector_alignment: u32,
}

// SAFETY: packed plain-data struct.
unsafe impl ByteValued for BlockConfig {}

/// A virtio block device.
pub struct Block {
    storage: Arc<dyn BlockStorage>,
    read_only: bool,
    write_enabled: AtomicBool,
}

impl Block {
    /// Create a block device over `storage`. `read_only` forces the
    /// device read-only even when the storage could accept writes.
    pub fn new(storage: Arc<dyn BlockStorage>, read_only: bool) -> Self {
        Self {
            storage,
            read_only,
            write_enabled: AtomicBool::new(false),
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only || !self.storage.writable()
    }

    fn handle_request(&self, chain: &Chain) -> Result<u32, VirtioError> {
        if chain.len() != 3 {
            return Err(VirtioError::BadChain("block request is not 3 descriptors"));
        }

        let descs = chain.descs();

        if !descs[0].is_read_only() || descs[0].len != 16 {
            return Err(VirtioError::BadChain("bad block request header"));
        }

        if !descs[2].is_write_only() || descs[2].len != 1 {
            return Err(VirtioError::BadChain("bad block status descriptor"));
        }

        let hdr = chain.read_buf(0)?;
        let req_type = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        let sector = u32::from_le_bytes(hdr[8..12].try_into().unwrap());
        let offset = u64::from(sector) * SECTOR_SIZE;

        let mut transferred = 0usize;

        let status = match req_type {
            BLK_T_IN => {
                if !descs[1].is_write_only() {
                    return Err(VirtioError::BadChain("block read into read-only buffer"));
                }

                let mut buf = vec![0u8; descs[1].len as usize];
                match self.storage.read_at(&mut buf, offset) {
                    Ok(n) => {
                        chain.write_buf(1, &buf[..n])?;
                        transferred = n;
                        BLK_S_OK
                    }
                    Err(err) => {
                        error!("block read at {offset:#x}: {err}");
                        BLK_S_IOERR
                    }
                }
            }

            BLK_T_OUT => {
                if !self.write_enabled.load(Ordering::Acquire) {
                    BLK_S_UNSUPP
                } else if !descs[1].is_read_only() {
                    return Err(VirtioError::BadChain("block write from writable buffer"));
                } else {
                    let buf = chain.read_buf(1)?;
                    match self.storage.write_at(&buf, offset) {
                        Ok(n) => {
                            transferred = n;
                            BLK_S_OK
                        }
                        Err(err) => {
                            error!("block write at {offset:#x}: {err}");
                            BLK_S_IOERR
                        }
                    }
                }
            }

            _ => BLK_S_UNSUPP,
        };

        chain.write_buf(2, &[status])?;

        // The published length counts payload bytes only, not the status
        // byte.
        Ok(transferred as u32)
    }
}

impl DeviceHandler for Block {
    fn device_type(&self) -> DeviceId {
        DeviceId::Block
    }

    fn features(&self) -> u64 {
        if self.is_read_only() {
            BLK_F_RO
        } else {
            0
        }
    }

    fn ready(&self, negotiated_features: u64) -> Result<(), VirtioError> {
        if self.is_read_only() && negotiated_features & BLK_F_RO == 0 {
            return Err(VirtioError::Unsupported(
                "write access to a read-only block device",
            ));
        }

        self.write_enabled
            .store(!self.is_read_only(), Ordering::Release);

        Ok(())
    }

    fn handle(&self, queue_num: u16, q: &Virtq) -> Result<(), VirtioError> {
        if queue_num != 0 {
            return Ok(());
        }

        while let Some(chain) = q.next()? {
            let n = self.handle_request(&chain)?;
            chain.release(n)?;
        }

        Ok(())
    }

    fn read_config(&self, buf: &mut [u8], offset: usize) -> Result<(), VirtioError> {
        let size = self.storage.size().map_err(VirtioError::Io)?;
        if size % SECTOR_SIZE != 0 {
            warn!("block storage size {size} is not sector-aligned");
        }

        let config = BlockConfig {
            capacity: size / SECTOR_SIZE,
            ..Default::default()
        };

        let raw = config.as_slice();
        if offset > raw.len() {
            return Err(VirtioError::ConfigRead(offset));
        }

        let n = buf.len().min(raw.len() - offset);
        buf[..n].copy_from_slice(&raw[offset..offset + n]);

        Ok(())
    }
}

/// Read-write storage backed by host memory.
pub struct MemStorage {
    bytes: Mutex<Vec<u8>>,
}

impl MemStorage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }
}

impl BlockStorage for MemStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let bytes = self.bytes.lock().unwrap();
        let start = (offset as usize).min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.bytes.lock().unwrap().len() as u64)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut bytes = self.bytes.lock().unwrap();
        let start = (offset as usize).min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        bytes[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn writable(&self) -> bool {
        true
    }
}

/// Read-write storage backed by a file. Whether writes actually succeed
/// depends on how the file was opened; the device's read-only flag is the
/// place to disable them up front.
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl BlockStorage for FileStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(buf, offset)
    }

    fn writable(&self) -> bool {
        true
    }
}

/// Read-only storage backed by an HTTP URL. The server must answer HEAD
/// requests and GET requests with a Range header.
pub struct HttpStorage {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpStorage {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl BlockStorage for HttpStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let end = offset + buf.len() as u64 - 1;
        let res = self
            .client
            .get(&self.url)
            .header("range", format!("bytes={offset}-{end}"))
            .send()
            .map_err(io::Error::other)?;

        if res.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(io::Error::other(format!(
                "GET {}: status {} != 206",
                self.url,
                res.status()
            )));
        }

        let body = res.bytes().map_err(io::Error::other)?;
        let n = buf.len().min(body.len());
        buf[..n].copy_from_slice(&body[..n]);

        Ok(n)
    }

    fn size(&self) -> io::Result<u64> {
        let res = self
            .client
            .head(&self.url)
            .send()
            .map_err(io::Error::other)?;

        if !res.status().is_success() {
            return Err(io::Error::other(format!(
                "HEAD {}: status {}",
                self.url,
                res.status()
            )));
        }

        res.content_length().ok_or_else(|| {
            io::Error::other(format!("HEAD {}: no content-length", self.url))
        })
    }
}
