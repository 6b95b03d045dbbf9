//! Packed virtqueue engine.
//!
//! Implements the packed virtqueue layout from VIRTIO 1.2 §2.7. Split
//! virtqueues are not supported. A packed queue is a single ring of
//! descriptors that both sides write: the driver marks descriptors
//! *available*, the device overwrites them *used*. Who owns a slot is
//! decided by the AVAIL/USED flag bits against a wrap counter that flips
//! on every full traversal of the ring.
//!
//! The engine consumes available descriptor chains in ring order via
//! [`Virtq::next`] and publishes them back in the same order via
//! [`Chain::release`], honoring the driver's event suppression area when
//! deciding whether to send a used-buffer notification.

use super::VirtioError;
use crate::vmm::memory::{ByteValued, GuestMemory};
use std::sync::{Arc, Mutex};

/// Buffer continues in the next descriptor.
pub const DESC_F_NEXT: u16 = 1;

/// Buffer is device write-only (otherwise device read-only).
pub const DESC_F_WRITE: u16 = 2;

/// Buffer contains a descriptor table of its own.
pub const DESC_F_INDIRECT: u16 = 4;

/// Descriptor availability marker, interpreted against the wrap counter.
pub const DESC_F_AVAIL: u16 = 1 << 7;

/// Descriptor used marker, interpreted against the wrap counter.
pub const DESC_F_USED: u16 = 1 << 15;

const EVENT_FLAGS_ENABLE: u16 = 0x0;
const EVENT_FLAGS_DISABLE: u16 = 0x1;
const EVENT_FLAGS_DESC: u16 = 0x2;

/// A descriptor in a packed virtqueue (`struct pvirtq_desc`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub id: u16,
    pub flags: u16,
}

// SAFETY: plain little-endian integers, no padding.
unsafe impl ByteValued for Desc {}

impl Desc {
    /// Size of a descriptor in guest memory.
    pub const SIZE: u64 = 16;

    pub fn is_write_only(&self) -> bool {
        self.flags & DESC_F_WRITE != 0
    }

    pub fn is_read_only(&self) -> bool {
        !self.is_write_only()
    }
}

/// An event suppression area (`struct pvirtq_event_suppress`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSuppress {
    pub desc: u16,
    pub flags: u16,
}

// SAFETY: two u16s, no padding.
unsafe impl ByteValued for EventSuppress {}

impl EventSuppress {
    /// Size of an event suppression area in guest memory.
    pub const SIZE: u64 = 4;

    /// Whether the other side asked to skip the notification for a used
    /// element published at `index` with the given wrap state.
    fn suppresses(&self, index: u16, wrap: bool) -> bool {
        !(self.flags == EVENT_FLAGS_ENABLE
            || (self.flags == EVENT_FLAGS_DESC
                && self.desc & !(1 << 15) == index
                && (self.desc >> 15 == 1) == wrap))
    }
}

/// Called after a used element is published, unless suppressed.
pub type NotifyFn = Box<dyn Fn() -> Result<(), VirtioError> + Send + Sync>;

/// Guest-physical addresses of a queue's three regions.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueRegions {
    /// The descriptor ring, `num_desc * 16` bytes.
    pub desc: u64,
    /// Driver event suppression area, read by the device.
    pub driver_event: u64,
    /// Device event suppression area, written by the device.
    pub device_event: u64,
}

struct Position {
    avail_idx: u16,
    used_idx: u16,
    wrap: bool,
}

struct Inner {
    mem: GuestMemory,
    regions: QueueRegions,
    num_desc: u16,
    pos: Mutex<Position>,
    notify: NotifyFn,
}

/// A packed virtqueue overlaying guest memory.
///
/// Cheap to clone; clones share position state. Chains must be taken and
/// released one at a time per queue — the per-queue worker model
/// guarantees this, and [`Chain`] consuming itself on release enforces
/// the single-release half of the contract.
#[derive(Clone)]
pub struct Virtq {
    inner: Arc<Inner>,
}

/// A chain of one or more descriptors, valid until released.
pub struct Chain {
    q: Arc<Inner>,
    id: u16,
    skip: u16,
    descs: Vec<Desc>,
}

impl Virtq {
    /// Create a queue over the given regions.
    ///
    /// The device side of the event suppression pair is initialized to
    /// "events enabled" so the driver keeps notifying us.
    pub fn new(
        mem: GuestMemory,
        regions: QueueRegions,
        num_desc: u16,
        notify: NotifyFn,
    ) -> Result<Self, VirtioError> {
        mem.write_obj(EventSuppress::default(), regions.device_event)?;

        Ok(Self {
            inner: Arc::new(Inner {
                mem,
                regions,
                num_desc,
                pos: Mutex::new(Position {
                    avail_idx: 0,
                    used_idx: 0,
                    wrap: true,
                }),
                notify,
            }),
        })
    }

    /// Return the next available descriptor chain, or `None` if the ring
    /// is empty or the driver has not made anything available.
    pub fn next(&self) -> Result<Option<Chain>, VirtioError> {
        let inner = &self.inner;
        if inner.num_desc == 0 {
            return Ok(None);
        }

        let mut pos = inner.pos.lock().unwrap();

        let head = match inner.advance(&mut pos)? {
            Some(i) => i,
            None => return Ok(None),
        };

        let head_desc = inner.desc_at(head)?;
        let mut id = head_desc.id;
        let mut skip = 1u16;
        let mut descs = vec![head_desc];

        if head_desc.flags & DESC_F_NEXT != 0 {
            // The chain continues in the following ring slots. The buffer
            // id lives in the last descriptor of the chain.
            while let Some(i) = inner.advance(&mut pos)? {
                let d = inner.desc_at(i)?;
                descs.push(d);
                id = d.id;
                skip += 1;

                if d.flags & DESC_F_NEXT == 0 {
                    break;
                }
            }
        } else if head_desc.flags & DESC_F_INDIRECT != 0 {
            // The chain lives out-of-band in a driver-supplied table.
            descs = inner.indirect_table(&head_desc)?;
        }

        Ok(Some(Chain {
            q: Arc::clone(inner),
            id,
            skip,
            descs,
        }))
    }
}

impl Inner {
    /// If the descriptor at `avail_idx` is available, step past it and
    /// return its index.
    fn advance(&self, pos: &mut Position) -> Result<Option<u16>, VirtioError> {
        let d = self.desc_at(pos.avail_idx)?;
        let avail = d.flags & DESC_F_AVAIL != 0;
        let used = d.flags & DESC_F_USED != 0;

        if avail == used || avail != pos.wrap {
            return Ok(None);
        }

        let index = pos.avail_idx;

        pos.avail_idx += 1;
        if pos.avail_idx == self.num_desc {
            pos.avail_idx = 0;
        }

        Ok(Some(index))
    }

    fn desc_at(&self, index: u16) -> Result<Desc, VirtioError> {
        let addr = self.regions.desc + u64::from(index) * Desc::SIZE;
        Ok(self.mem.read_obj(addr)?)
    }

    fn indirect_table(&self, head: &Desc) -> Result<Vec<Desc>, VirtioError> {
        if head.len == 0 || head.len as u64 % Desc::SIZE != 0 {
            return Err(VirtioError::InvalidIndirect);
        }

        let count = head.len as u64 / Desc::SIZE;
        let mut descs = Vec::with_capacity(count as usize);

        for i in 0..count {
            let d = self
                .mem
                .read_obj(head.addr + i * Desc::SIZE)
                .map_err(|_| VirtioError::InvalidIndirect)?;
            descs.push(d);
        }

        Ok(descs)
    }

    fn release(&self, chain: &Chain, bytes_written: u32) -> Result<(), VirtioError> {
        let mut pos = self.pos.lock().unwrap();

        let d = self.desc_at(pos.used_idx)?;
        let avail = d.flags & DESC_F_AVAIL != 0;
        let used = d.flags & DESC_F_USED != 0;
        if avail == used || avail != pos.wrap {
            // The driver handed us more chains than the ring can take
            // back, which both sides' bookkeeping makes impossible.
            panic!("packed queue: used ring full");
        }

        let mut flags = 0;

        if pos.wrap {
            flags |= DESC_F_AVAIL | DESC_F_USED;
        }

        if bytes_written > 0 {
            flags |= DESC_F_WRITE;
        }

        self.mem.write_obj(
            Desc {
                addr: 0,
                len: bytes_written,
                id: chain.id,
                flags,
            },
            self.regions.desc + u64::from(pos.used_idx) * Desc::SIZE,
        )?;

        let index = pos.used_idx;
        let wrap = pos.wrap;

        pos.used_idx += chain.skip;
        if pos.used_idx >= self.num_desc {
            pos.used_idx -= self.num_desc;
            pos.wrap = !pos.wrap;
        }

        drop(pos);

        let suppress: EventSuppress = self.mem.read_obj(self.regions.driver_event)?;
        if !suppress.suppresses(index, wrap) {
            (self.notify)()?;
        }

        Ok(())
    }
}

impl Chain {
    /// The descriptors making up the chain. At least one.
    pub fn descs(&self) -> &[Desc] {
        &self.descs
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Copy descriptor `i`'s buffer out of guest memory.
    pub fn read_buf(&self, i: usize) -> Result<Vec<u8>, VirtioError> {
        let d = &self.descs[i];
        let mut buf = vec![0u8; d.len as usize];
        self.q.mem.read(d.addr, &mut buf)?;
        Ok(buf)
    }

    /// Copy `data` into descriptor `i`'s buffer. `data` must fit.
    pub fn write_buf(&self, i: usize, data: &[u8]) -> Result<(), VirtioError> {
        let d = &self.descs[i];
        if data.len() > d.len as usize {
            return Err(VirtioError::BadChain("write exceeds descriptor buffer"));
        }

        self.q.mem.write(d.addr, data)?;
        Ok(())
    }

    /// Publish the chain as used, recording how many bytes the device
    /// wrote into its buffers, and notify the driver unless suppressed.
    pub fn release(self, bytes_written: u32) -> Result<(), VirtioError> {
        self.q.clone().release(&self, bytes_written)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub const DESC_ADDR: u64 = 0x1000;
    pub const DRIVER_EVENT_ADDR: u64 = 0x3000;
    pub const DEVICE_EVENT_ADDR: u64 = 0x3100;

    /// A simulated driver over a ring in real guest memory.
    pub struct TestRing {
        pub mem: GuestMemory,
        pub num_desc: u16,
        slot: u16,
        wrap: bool,
    }

    impl TestRing {
        pub fn new(num_desc: u16) -> Self {
            let mem = GuestMemory::new(&[(0, 0x10000)]).unwrap();
            Self {
                mem,
                num_desc,
                slot: 0,
                wrap: true,
            }
        }

        pub fn regions(&self) -> QueueRegions {
            QueueRegions {
                desc: DESC_ADDR,
                driver_event: DRIVER_EVENT_ADDR,
                device_event: DEVICE_EVENT_ADDR,
            }
        }

        pub fn queue(&self, notify: NotifyFn) -> Virtq {
            Virtq::new(self.mem.clone(), self.regions(), self.num_desc, notify).unwrap()
        }

        pub fn queue_quiet(&self) -> Virtq {
            self.queue(Box::new(|| Ok(())))
        }

        /// Make a descriptor available at the next ring slot.
        pub fn push(&mut self, mut desc: Desc) {
            desc.flags |= if self.wrap { DESC_F_AVAIL } else { DESC_F_USED };

            self.mem
                .write_obj(desc, DESC_ADDR + u64::from(self.slot) * Desc::SIZE)
                .unwrap();

            self.slot += 1;
            if self.slot == self.num_desc {
                self.slot = 0;
                self.wrap = !self.wrap;
            }
        }

        pub fn set_driver_event(&self, ev: EventSuppress) {
            self.mem.write_obj(ev, DRIVER_EVENT_ADDR).unwrap();
        }

        /// Read back the used element published at a ring slot.
        pub fn used_at(&self, slot: u16) -> Desc {
            self.mem
                .read_obj(DESC_ADDR + u64::from(slot) * Desc::SIZE)
                .unwrap()
        }
    }

    pub fn counting_notify() -> (NotifyFn, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            count,
        )
    }

    #[test]
    fn empty_ring() {
        let ring = TestRing::new(0);
        let q = ring.queue_quiet();
        assert!(q.next().unwrap().is_none());
    }

    #[test]
    fn nothing_available() {
        let ring = TestRing::new(4);
        let q = ring.queue_quiet();
        assert!(q.next().unwrap().is_none());
    }

    #[test]
    fn one_available() {
        let mut ring = TestRing::new(4);
        let q = ring.queue_quiet();

        ring.push(Desc {
            addr: 0x4000,
            len: 8,
            id: 7,
            flags: 0,
        });

        let c = q.next().unwrap().unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.descs()[0].addr, 0x4000);

        c.release(1).unwrap();

        let used = ring.used_at(0);
        assert_eq!(used.id, 7);
        assert_eq!(used.len, 1);
        assert_ne!(used.flags & DESC_F_WRITE, 0, "written chains carry WRITE");

        assert!(q.next().unwrap().is_none());
    }

    #[test]
    fn release_without_write_clears_write_flag() {
        let mut ring = TestRing::new(4);
        let q = ring.queue_quiet();

        ring.push(Desc::default());
        q.next().unwrap().unwrap().release(0).unwrap();

        assert_eq!(ring.used_at(0).flags & DESC_F_WRITE, 0);
    }

    #[test]
    fn chained() {
        let mut ring = TestRing::new(8);
        let q = ring.queue_quiet();

        ring.push(Desc {
            flags: DESC_F_NEXT,
            ..Default::default()
        });
        ring.push(Desc {
            flags: DESC_F_NEXT,
            ..Default::default()
        });
        ring.push(Desc {
            id: 42,
            ..Default::default()
        });

        let c = q.next().unwrap().unwrap();
        assert_eq!(c.len(), 3);

        c.release(0).unwrap();

        // The buffer id comes from the last descriptor, and the used
        // element advances the ring by the whole chain.
        assert_eq!(ring.used_at(0).id, 42);
        assert!(q.next().unwrap().is_none());

        ring.push(Desc {
            id: 43,
            ..Default::default()
        });
        let c = q.next().unwrap().unwrap();
        c.release(0).unwrap();
        assert_eq!(ring.used_at(3).id, 43);
    }

    #[test]
    fn indirect() {
        let mut ring = TestRing::new(4);
        let q = ring.queue_quiet();

        let table = 0x5000u64;
        for i in 0..2u64 {
            ring.mem
                .write_obj(
                    Desc {
                        addr: 0x6000 + i * 0x100,
                        len: 0x100,
                        id: 0,
                        flags: 0,
                    },
                    table + i * Desc::SIZE,
                )
                .unwrap();
        }

        ring.push(Desc {
            addr: table,
            len: 32,
            id: 9,
            flags: DESC_F_INDIRECT,
        });
        ring.push(Desc {
            id: 10,
            ..Default::default()
        });

        let c = q.next().unwrap().unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.descs()[1].addr, 0x6100);

        // An indirect chain occupies a single ring slot.
        c.release(0).unwrap();
        assert_eq!(ring.used_at(0).id, 9);

        let c = q.next().unwrap().unwrap();
        assert_eq!(c.len(), 1);
        c.release(0).unwrap();
        assert_eq!(ring.used_at(1).id, 10);
    }

    #[test]
    fn malformed_indirect() {
        let mut ring = TestRing::new(4);
        let q = ring.queue_quiet();

        ring.push(Desc {
            addr: 0x5000,
            len: 17,
            id: 0,
            flags: DESC_F_INDIRECT,
        });

        assert!(matches!(q.next(), Err(VirtioError::InvalidIndirect)));
    }

    #[test]
    fn buffers_roundtrip() {
        let mut ring = TestRing::new(4);
        let q = ring.queue_quiet();

        ring.mem.write(0x4000, b"hello").unwrap();
        ring.push(Desc {
            addr: 0x4000,
            len: 5,
            id: 0,
            flags: 0,
        });

        let c = q.next().unwrap().unwrap();
        assert_eq!(c.read_buf(0).unwrap(), b"hello");

        c.write_buf(0, b"world").unwrap();
        assert_eq!(c.read_buf(0).unwrap(), b"world");

        assert!(matches!(
            c.write_buf(0, b"toolong"),
            Err(VirtioError::BadChain(_))
        ));
    }

    #[test]
    fn consumed_in_ring_order() {
        let mut ring = TestRing::new(8);
        let q = ring.queue_quiet();

        for id in 0..20u16 {
            ring.push(Desc {
                id,
                ..Default::default()
            });

            let c = q.next().unwrap().unwrap();
            assert_eq!(c.descs()[0].id, id);
            c.release(0).unwrap();
            assert_eq!(ring.used_at(id % 8).id, id);
        }
    }

    #[test]
    fn wrap_discipline() {
        let num = 4u16;
        let mut ring = TestRing::new(num);
        let q = ring.queue_quiet();

        // First traversal publishes with wrap=true (AVAIL|USED set),
        // second with wrap=false (both clear), third flips back.
        for lap in 0..3 {
            for slot in 0..num {
                ring.push(Desc::default());
                q.next().unwrap().unwrap().release(0).unwrap();

                let flags = ring.used_at(slot).flags;
                let marked = flags & (DESC_F_AVAIL | DESC_F_USED);
                if lap % 2 == 0 {
                    assert_eq!(marked, DESC_F_AVAIL | DESC_F_USED);
                } else {
                    assert_eq!(marked, 0);
                }
            }
        }
    }

    #[test]
    fn notify_once_per_release_when_enabled() {
        let mut ring = TestRing::new(8);
        let (notify, count) = counting_notify();
        let q = ring.queue(notify);

        for _ in 0..5 {
            ring.push(Desc::default());
            q.next().unwrap().unwrap().release(0).unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn notify_suppressed_when_disabled() {
        let mut ring = TestRing::new(8);
        let (notify, count) = counting_notify();
        let q = ring.queue(notify);

        ring.set_driver_event(EventSuppress {
            desc: 0,
            flags: super::EVENT_FLAGS_DISABLE,
        });

        for _ in 0..5 {
            ring.push(Desc::default());
            q.next().unwrap().unwrap().release(0).unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn notify_for_matching_descriptor_only() {
        let mut ring = TestRing::new(8);
        let (notify, count) = counting_notify();
        let q = ring.queue(notify);

        // Wrap bit set: only the element published at index 2 during the
        // first traversal rings through.
        ring.set_driver_event(EventSuppress {
            desc: 2 | 1 << 15,
            flags: super::EVENT_FLAGS_DESC,
        });

        for _ in 0..4 {
            ring.push(Desc::default());
            q.next().unwrap().unwrap().release(0).unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "used ring full")]
    fn release_into_unavailable_slot_panics() {
        let mut ring = TestRing::new(2);
        let q = ring.queue_quiet();

        ring.push(Desc::default());
        let c = q.next().unwrap().unwrap();

        // Clobber the slot so it no longer reads as driver-owned.
        ring.mem
            .write_obj(Desc::default(), DESC_ADDR)
            .unwrap();

        let _ = c.release(0);
    }
}
