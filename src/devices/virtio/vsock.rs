//! Virtio socket (vsock) device.
//!
//! Implements VIRTIO 1.2 vsock packet framing and stream semantics with
//! credit-based flow control. Three queues: rx (device to driver), tx
//! (driver to device), and an event queue the device keeps idle.
//!
//! Guests connect out to `(cid, port)` addresses the host has registered
//! with [`Vsock::listen`]; each accepted connection is a [`VsockConn`]
//! the host reads and writes like a socket. Data flowing guest-to-host is
//! buffered in an OS pipe whose capacity doubles as the flow's advertised
//! `buf_alloc` credit.

use super::queue::{Chain, Virtq};
use super::{DeviceHandler, DeviceId, VirtioError};
use crate::vmm::memory::ByteValued;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::time::Instant;

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;
const EVENT_QUEUE: u16 = 2;

/// Stream socket type. Seqpacket is not supported.
const TYPE_STREAM: u16 = 1;

// packet operations

const OP_INVALID: u16 = 0;
const OP_REQUEST: u16 = 1;
const OP_RESPONSE: u16 = 2;
const OP_RST: u16 = 3;
const OP_SHUTDOWN: u16 = 4;
const OP_RW: u16 = 5;
const OP_CREDIT_UPDATE: u16 = 6;
const OP_CREDIT_REQUEST: u16 = 7;

// shutdown flag bits

const SHUTDOWN_F_RECV: u32 = 1 << 0;
const SHUTDOWN_F_SEND: u32 = 1 << 1;

/// Wire size of a packet header (`struct virtio_vsock_hdr`).
pub const HDR_SIZE: usize = 44;

/// The guest CID used when none is configured.
pub const DEFAULT_GUEST_CID: u64 = 3;

/// A vsock packet header. Every packet on the rx and tx queues starts
/// with one; `len` counts the payload bytes that follow.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketHdr {
    pub src_cid: u64,
    pub dst_cid: u64,
    pub src_port: u32,
    pub dst_port: u32,
    pub len: u32,
    pub type_: u16,
    pub op: u16,
    pub flags: u32,
    pub buf_alloc: u32,
    pub fwd_cnt: u32,
}

// SAFETY: packed plain-data struct, little-endian on every supported
// target.
unsafe impl ByteValued for PacketHdr {}

impl PacketHdr {
    pub fn flow_id(&self) -> FlowId {
        FlowId {
            src_cid: self.src_cid,
            dst_cid: self.dst_cid,
            src_port: self.src_port,
            dst_port: self.dst_port,
        }
    }
}

/// The connection 4-tuple, as seen from the side that sent the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub src_cid: u64,
    pub dst_cid: u64,
    pub src_port: u32,
    pub dst_port: u32,
}

impl FlowId {
    /// The same flow as seen from the other side.
    pub fn swap(self) -> FlowId {
        FlowId {
            src_cid: self.dst_cid,
            dst_cid: self.src_cid,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    pub fn src_addr(self) -> VsockAddr {
        VsockAddr {
            cid: self.src_cid,
            port: self.src_port,
        }
    }

    pub fn dst_addr(self) -> VsockAddr {
        VsockAddr {
            cid: self.dst_cid,
            port: self.dst_port,
        }
    }
}

/// A vsock address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsockAddr {
    pub cid: u64,
    pub port: u32,
}

impl fmt::Display for VsockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cid, self.port)
    }
}

/// Config space layout (`struct virtio_vsock_config`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
struct VsockConfig {
    guest_cid: u64,
}

// SAFETY: a single little-endian integer.
unsafe impl ByteValued for VsockConfig {}

/// The vsock device: virtio handler on one side, host socket factory on
/// the other.
pub struct Vsock {
    guest_cid: u64,
    weak: Weak<Vsock>,
    closed: AtomicBool,

    // The rx queue handle, installed when the guest readies the queue.
    // Consumers wait here for the driver to post receive buffers.
    rx_q: Mutex<Option<Virtq>>,
    rx_cond: Condvar,

    flows: Mutex<HashMap<FlowId, Arc<Flow>>>,
    listeners: Mutex<HashMap<VsockAddr, SyncSender<VsockConn>>>,
}

/// Per-flow state shared between the device and its host-side conn.
struct Flow {
    id: FlowId,
    type_: u16,

    /// Our receive buffer allowance, the capacity of the pipe.
    buf_alloc: u32,

    /// Bytes we have consumed from the driver (written into the pipe).
    fwd_cnt: AtomicU32,

    /// The driver's last advertised credit: `buf_alloc << 32 | fwd_cnt`.
    driver_credit: AtomicU64,

    closed: AtomicBool,

    /// Guest-to-host pipe. The write end disappears when the flow shuts
    /// down, which reads back as EOF on the host side.
    pipe_w: Mutex<Option<File>>,
    pipe_r: Mutex<File>,

    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,

    /// Host-writer bookkeeping, paired with `credit_cond`.
    write_pos: Mutex<WritePos>,
    credit_cond: Condvar,

    /// Driver shutdown bits, touched only by the tx worker.
    shutdown: Mutex<Shutdown>,
}

#[derive(Default)]
struct WritePos {
    /// Bytes sent to the driver on this flow.
    num_bytes_rx: u32,
}

#[derive(Default)]
struct Shutdown {
    recv: bool,
    send: bool,
}

enum RxWait {
    Closed,
    TimedOut,
    Virtio(VirtioError),
}

impl Vsock {
    /// Create a vsock device. `guest_cid` of `None` selects
    /// [`DEFAULT_GUEST_CID`]; explicit CIDs must be in `[3, 2^32)` —
    /// 0 and 1 are reserved, 2 is the host.
    pub fn new(guest_cid: Option<i64>) -> io::Result<Arc<Self>> {
        let cid = guest_cid.unwrap_or(DEFAULT_GUEST_CID as i64);

        if !(DEFAULT_GUEST_CID as i64..1 << 32).contains(&cid) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid guest CID {cid}"),
            ));
        }

        Ok(Arc::new_cyclic(|weak| Self {
            guest_cid: cid as u64,
            weak: weak.clone(),
            closed: AtomicBool::new(false),
            rx_q: Mutex::new(None),
            rx_cond: Condvar::new(),
            flows: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }))
    }

    /// The CID the guest identifies itself with.
    pub fn guest_cid(&self) -> u64 {
        self.guest_cid
    }

    /// Register a listener for guest connections to `(cid, port)`.
    pub fn listen(&self, cid: u64, port: u32) -> io::Result<VsockListener> {
        let addr = VsockAddr { cid, port };
        let mut listeners = self.listeners.lock().unwrap();

        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("vsock listen {addr}: device closed"),
            ));
        }

        if listeners.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("vsock listen {addr}: address already in use"),
            ));
        }

        // Depth 1: one connection may be pending; further requests are
        // refused with RST until it is accepted.
        let (tx, rx) = mpsc::sync_channel(1);
        listeners.insert(addr, tx);

        Ok(VsockListener {
            addr,
            conn_rx: rx,
            device: self.weak.upgrade().expect("device is alive"),
        })
    }

    /// Block until the driver has posted an rx buffer, then return it as
    /// a chain. Wakes early on device close, flow close, or `deadline`.
    fn take_rx_chain(&self, deadline: Option<Instant>, flow: Option<&Flow>) -> Result<Chain, RxWait> {
        let mut q = self.rx_q.lock().unwrap();

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(RxWait::Closed);
            }

            if let Some(f) = flow {
                if f.closed.load(Ordering::Acquire) {
                    return Err(RxWait::Closed);
                }
            }

            if let Some(vq) = q.as_ref() {
                match vq.next() {
                    Ok(Some(chain)) => {
                        validate_rx_chain(&chain).map_err(RxWait::Virtio)?;
                        return Ok(chain);
                    }
                    Ok(None) => {}
                    Err(err) => return Err(RxWait::Virtio(err)),
                }
            }

            q = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(RxWait::TimedOut);
                    }

                    self.rx_cond.wait_timeout(q, d - now).unwrap().0
                }
                None => self.rx_cond.wait(q).unwrap(),
            };
        }
    }

    fn notify_rx_waiters(&self) {
        let _q = self.rx_q.lock().unwrap();
        self.rx_cond.notify_all();
    }

    /// Send a header-only control packet to the driver.
    fn rx_ctrl(&self, hdr: PacketHdr) -> Result<(), VirtioError> {
        let chain = self.take_rx_chain(None, None).map_err(|err| match err {
            RxWait::Virtio(e) => e,
            _ => VirtioError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "vsock device closed",
            )),
        })?;

        chain.write_buf(0, hdr.as_slice())?;
        chain.release(HDR_SIZE as u32)
    }

    /// Refuse the packet `req` answers to with a reset.
    fn send_rst(&self, req: &PacketHdr) -> Result<(), VirtioError> {
        self.rx_ctrl(PacketHdr {
            src_cid: req.dst_cid,
            dst_cid: req.src_cid,
            src_port: req.dst_port,
            dst_port: req.src_port,
            type_: req.type_,
            op: OP_RST,
            ..Default::default()
        })
    }

    fn handle_tx(&self, q: &Virtq) -> Result<(), VirtioError> {
        while let Some(chain) = q.next()? {
            let parsed = parse_tx_packet(&chain);

            let res = match &parsed {
                Ok((hdr, data)) => self.handle_packet(hdr, data),
                Err(_) => Ok(()),
            };

            chain.release(0)?;
            parsed?;
            res?;
        }

        Ok(())
    }

    fn handle_packet(&self, hdr: &PacketHdr, data: &[u8]) -> Result<(), VirtioError> {
        if hdr.type_ != TYPE_STREAM {
            return self.send_rst(hdr);
        }

        let flow = self.flows.lock().unwrap().get(&hdr.flow_id()).cloned();

        match (&flow, hdr.op) {
            // Only connection requests may address an unknown flow, and
            // requests must not address a known one.
            (None, op) if op != OP_REQUEST => return self.send_rst(hdr),
            (Some(_), OP_REQUEST) => return self.send_rst(hdr),
            _ => {}
        }

        if let Some(flow) = &flow {
            flow.update_driver_credit(hdr);
        }

        match hdr.op {
            OP_REQUEST => self.handle_request(hdr),
            OP_SHUTDOWN => self.handle_shutdown(&flow.unwrap(), hdr),
            OP_RW => self.handle_rw(&flow.unwrap(), data),

            OP_CREDIT_UPDATE => {
                let flow = flow.unwrap();
                let _pos = flow.write_pos.lock().unwrap();
                flow.credit_cond.notify_all();
                Ok(())
            }

            OP_RST => Err(VirtioError::Unsupported("vsock driver-initiated reset")),
            OP_CREDIT_REQUEST => Err(VirtioError::Unsupported("vsock credit request")),
            OP_INVALID => Err(VirtioError::Unsupported("vsock invalid operation")),
            _ => Err(VirtioError::Unsupported("vsock operation")),
        }
    }

    fn handle_request(&self, hdr: &PacketHdr) -> Result<(), VirtioError> {
        let addr = hdr.flow_id().dst_addr();

        let listener = self.listeners.lock().unwrap().get(&addr).cloned();
        let Some(listener) = listener else {
            debug!("vsock: no listener for {addr}, resetting");
            return self.send_rst(hdr);
        };

        let (pipe_r, pipe_w) = pipe()?;
        let buf_alloc = pipe_capacity(&pipe_w)?;

        let flow = Arc::new(Flow {
            id: hdr.flow_id(),
            type_: hdr.type_,
            buf_alloc,
            fwd_cnt: AtomicU32::new(0),
            driver_credit: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pipe_w: Mutex::new(Some(pipe_w)),
            pipe_r: Mutex::new(pipe_r),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            write_pos: Mutex::new(WritePos::default()),
            credit_cond: Condvar::new(),
            shutdown: Mutex::new(Shutdown::default()),
        });

        flow.update_driver_credit(hdr);

        self.flows.lock().unwrap().insert(flow.id, Arc::clone(&flow));

        let conn = VsockConn {
            flow: Arc::clone(&flow),
            device: self.weak.upgrade().expect("device is alive"),
        };

        match listener.try_send(conn) {
            Ok(()) => self.rx_ctrl(PacketHdr {
                src_cid: hdr.dst_cid,
                dst_cid: hdr.src_cid,
                src_port: hdr.dst_port,
                dst_port: hdr.src_port,
                type_: flow.type_,
                op: OP_RESPONSE,
                buf_alloc: flow.buf_alloc,
                fwd_cnt: flow.fwd_cnt.load(Ordering::SeqCst),
                ..Default::default()
            }),

            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.flows.lock().unwrap().remove(&flow.id);
                self.send_rst(hdr)
            }
        }
    }

    fn handle_shutdown(&self, flow: &Arc<Flow>, hdr: &PacketHdr) -> Result<(), VirtioError> {
        let both = {
            let mut sd = flow.shutdown.lock().unwrap();
            sd.recv |= hdr.flags & SHUTDOWN_F_RECV != 0;
            sd.send |= hdr.flags & SHUTDOWN_F_SEND != 0;
            sd.recv && sd.send
        };

        if both {
            self.flows.lock().unwrap().remove(&flow.id);
            flow.mark_closed();
            self.notify_rx_waiters();
            return self.send_rst(hdr);
        }

        Ok(())
    }

    fn handle_rw(&self, flow: &Arc<Flow>, data: &[u8]) -> Result<(), VirtioError> {
        {
            let mut w = flow.pipe_w.lock().unwrap();
            match w.as_mut() {
                Some(w) => w.write_all(data)?,
                // Already shut down; nowhere to put the data.
                None => return Ok(()),
            }
        }

        let fwd_cnt = flow
            .fwd_cnt
            .fetch_add(data.len() as u32, Ordering::SeqCst)
            .wrapping_add(data.len() as u32);

        // A credit update goes straight back after every transfer. A
        // batching heuristic could cut this traffic later.
        self.rx_ctrl(PacketHdr {
            src_cid: flow.id.dst_cid,
            dst_cid: flow.id.src_cid,
            src_port: flow.id.dst_port,
            dst_port: flow.id.src_port,
            type_: flow.type_,
            op: OP_CREDIT_UPDATE,
            buf_alloc: flow.buf_alloc,
            fwd_cnt,
            ..Default::default()
        })
    }
}

impl DeviceHandler for Vsock {
    fn device_type(&self) -> DeviceId {
        DeviceId::Socket
    }

    fn handle(&self, queue_num: u16, q: &Virtq) -> Result<(), VirtioError> {
        match queue_num {
            RX_QUEUE => {
                // The driver posted receive buffers; hold on to the queue
                // and wake whoever is waiting for a chain.
                *self.rx_q.lock().unwrap() = Some(q.clone());
                self.rx_cond.notify_all();
                Ok(())
            }

            TX_QUEUE => self.handle_tx(q),

            EVENT_QUEUE => Ok(()),

            _ => Ok(()),
        }
    }

    fn read_config(&self, buf: &mut [u8], offset: usize) -> Result<(), VirtioError> {
        let config = VsockConfig {
            guest_cid: self.guest_cid,
        };

        let raw = config.as_slice();
        if offset > raw.len() {
            return Err(VirtioError::ConfigRead(offset));
        }

        let n = buf.len().min(raw.len() - offset);
        buf[..n].copy_from_slice(&raw[offset..offset + n]);

        if n < buf.len() {
            return Err(VirtioError::ConfigRead(offset + n));
        }

        Ok(())
    }

    fn close(&self) {
        {
            let _q = self.rx_q.lock().unwrap();
            self.closed.store(true, Ordering::Release);
        }
        self.rx_cond.notify_all();

        // Dropping the listener senders fails pending accepts.
        self.listeners.lock().unwrap().clear();

        let flows: Vec<Arc<Flow>> = self.flows.lock().unwrap().drain().map(|(_, f)| f).collect();
        for flow in flows {
            flow.mark_closed();
        }
    }
}

impl Flow {
    fn update_driver_credit(&self, hdr: &PacketHdr) {
        let credit = u64::from(hdr.buf_alloc) << 32 | u64::from(hdr.fwd_cnt);
        self.driver_credit.store(credit, Ordering::SeqCst);
    }

    fn mark_closed(&self) {
        {
            let _pos = self.write_pos.lock().unwrap();
            self.closed.store(true, Ordering::SeqCst);
        }
        self.credit_cond.notify_all();

        // Reader sees EOF once buffered data is drained.
        *self.pipe_w.lock().unwrap() = None;
    }
}

/// A listener for guest-initiated vsock connections.
pub struct VsockListener {
    addr: VsockAddr,
    conn_rx: Receiver<VsockConn>,
    device: Arc<Vsock>,
}

impl VsockListener {
    /// Wait for the next guest connection.
    pub fn accept(&self) -> io::Result<VsockConn> {
        self.conn_rx.recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("vsock accept {}: device closed", self.addr),
            )
        })
    }

    pub fn addr(&self) -> VsockAddr {
        self.addr
    }
}

impl Drop for VsockListener {
    fn drop(&mut self) {
        self.device.listeners.lock().unwrap().remove(&self.addr);
    }
}

/// The host side of an established flow. Reads drain the guest-to-host
/// pipe; writes frame payloads into the driver's rx buffers, subject to
/// the driver's advertised credit.
pub struct VsockConn {
    flow: Arc<Flow>,
    device: Arc<Vsock>,
}

impl VsockConn {
    pub fn local_addr(&self) -> VsockAddr {
        self.flow.id.src_addr()
    }

    pub fn peer_addr(&self) -> VsockAddr {
        self.flow.id.dst_addr()
    }

    /// Set the deadline for in-flight and future reads. `None` waits
    /// forever.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.flow.read_deadline.lock().unwrap() = deadline;
    }

    /// Set the deadline for in-flight and future writes. `None` waits
    /// forever.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.flow.write_deadline.lock().unwrap() = deadline;

        // Wake blocked writers so they pick the new deadline up.
        {
            let _pos = self.flow.write_pos.lock().unwrap();
        }
        self.flow.credit_cond.notify_all();
        self.device.notify_rx_waiters();
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Close the host side. Blocked reads and writes return.
    pub fn close(&self) {
        self.flow.mark_closed();
        self.device.notify_rx_waiters();
    }

    /// Wait until the driver has room for `len` more bytes.
    fn wait_for_credit(&self, len: u32, deadline: Option<Instant>) -> io::Result<()> {
        let flow = &self.flow;
        let mut pos = flow.write_pos.lock().unwrap();

        loop {
            if flow.closed.load(Ordering::SeqCst) || self.device.closed.load(Ordering::SeqCst) {
                return Err(closed_err(flow.id));
            }

            let credit = flow.driver_credit.load(Ordering::SeqCst);
            let buf_alloc = (credit >> 32) as u32;
            let fwd_cnt = credit as u32;
            let free = buf_alloc.wrapping_sub(pos.num_bytes_rx.wrapping_sub(fwd_cnt));

            if len < free {
                return Ok(());
            }

            pos = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(timeout_err(flow.id));
                    }

                    flow.credit_cond.wait_timeout(pos, d - now).unwrap().0
                }
                None => flow.credit_cond.wait(pos).unwrap(),
            };
        }
    }
}

impl Read for VsockConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = *self.flow.read_deadline.lock().unwrap();
        let reader = self.flow.pipe_r.lock().unwrap();

        if let Some(d) = deadline {
            let now = Instant::now();
            let timeout = d.saturating_duration_since(now).as_millis() as i32;

            let mut pfd = libc::pollfd {
                fd: reader.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };

            // SAFETY: one valid pollfd.
            let n = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n == 0 {
                return Err(timeout_err(self.flow.id));
            }
        }

        (&*reader).read(buf)
    }
}

impl Write for VsockConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;

        while written < buf.len() {
            let res = self.write_chunk(&buf[written..]);
            match res {
                Ok(n) => written += n,
                Err(err) => {
                    return if written > 0 { Ok(written) } else { Err(err) };
                }
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl VsockConn {
    fn write_chunk(&self, buf: &[u8]) -> io::Result<usize> {
        let flow = &self.flow;
        let deadline = *flow.write_deadline.lock().unwrap();

        let chain = self
            .device
            .take_rx_chain(deadline, Some(flow))
            .map_err(|err| match err {
                RxWait::Closed => closed_err(flow.id),
                RxWait::TimedOut => timeout_err(flow.id),
                RxWait::Virtio(e) => io::Error::other(e),
            })?;

        let capacity = chain.descs()[0].len as usize - HDR_SIZE;
        let len = buf.len().min(capacity);

        self.wait_for_credit(len as u32, deadline)?;

        let hdr = PacketHdr {
            src_cid: flow.id.dst_cid,
            dst_cid: flow.id.src_cid,
            src_port: flow.id.dst_port,
            dst_port: flow.id.src_port,
            len: len as u32,
            type_: flow.type_,
            op: OP_RW,
            buf_alloc: flow.buf_alloc,
            fwd_cnt: flow.fwd_cnt.load(Ordering::SeqCst),
            ..Default::default()
        };

        let mut packet = Vec::with_capacity(HDR_SIZE + len);
        packet.extend_from_slice(hdr.as_slice());
        packet.extend_from_slice(&buf[..len]);

        chain
            .write_buf(0, &packet)
            .and_then(|()| chain.release((HDR_SIZE + len) as u32))
            .map_err(io::Error::other)?;

        let mut pos = flow.write_pos.lock().unwrap();
        pos.num_bytes_rx = pos.num_bytes_rx.wrapping_add(len as u32);

        Ok(len)
    }
}

fn closed_err(id: FlowId) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("vsock {}: connection closed", id.src_addr()),
    )
}

fn timeout_err(id: FlowId) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("vsock {}: deadline exceeded", id.src_addr()),
    )
}

/// An rx chain carries a single write-only descriptor with room for at
/// least a packet header.
fn validate_rx_chain(chain: &Chain) -> Result<(), VirtioError> {
    if chain.len() != 1 {
        return Err(VirtioError::BadChain("vsock rx chain with multiple descriptors"));
    }

    if chain.descs()[0].is_read_only() {
        return Err(VirtioError::BadChain("read-only vsock rx descriptor"));
    }

    if (chain.descs()[0].len as usize) < HDR_SIZE {
        return Err(VirtioError::BadChain("vsock rx descriptor too short"));
    }

    Ok(())
}

/// Split a tx chain into its header and payload. The payload either
/// trails the header in the same descriptor or fills a second read-only
/// descriptor of exactly `hdr.len` bytes.
fn parse_tx_packet(chain: &Chain) -> Result<(PacketHdr, Vec<u8>), VirtioError> {
    let descs = chain.descs();

    if descs[0].is_write_only() {
        return Err(VirtioError::BadChain("write-only vsock header descriptor"));
    }

    if (descs[0].len as usize) < HDR_SIZE {
        return Err(VirtioError::BadChain("short vsock header descriptor"));
    }

    let head = chain.read_buf(0)?;
    let hdr = *PacketHdr::from_slice(&head[..HDR_SIZE])
        .ok_or(VirtioError::BadChain("unreadable vsock header"))?;

    let mut data = head[HDR_SIZE..].to_vec();
    if !data.is_empty() {
        if data.len() < hdr.len as usize {
            return Err(VirtioError::BadChain("vsock payload shorter than hdr.len"));
        }
        data.truncate(hdr.len as usize);
    }

    if chain.len() > 1 {
        if !data.is_empty() {
            return Err(VirtioError::BadChain(
                "vsock data descriptor after in-header payload",
            ));
        }

        if descs[1].is_write_only() {
            return Err(VirtioError::BadChain("write-only vsock data descriptor"));
        }

        if descs[1].len != hdr.len {
            return Err(VirtioError::BadChain("vsock data length mismatch"));
        }

        data = chain.read_buf(1)?;
    }

    Ok((hdr, data))
}

fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0i32; 2];

    // SAFETY: pipe2 fills the two fds we hand it.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: fresh fds, ownership moves into the Files.
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

fn pipe_capacity(pipe: &File) -> io::Result<u32> {
    // SAFETY: F_GETPIPE_SZ takes no argument and returns the capacity.
    let n = unsafe { libc::fcntl(pipe.as_raw_fd(), libc::F_GETPIPE_SZ) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as u32)
}
