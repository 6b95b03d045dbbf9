//! Virtio console device.
//!
//! Two queues: receive (guest-writable buffers filled from a host reader)
//! and transmit (guest-readable buffers drained into a host writer). The
//! guest sees it as `hvc0`.

use super::queue::Virtq;
use super::{DeviceHandler, DeviceId, VirtioError};
use std::io::{Read, Write};
use std::sync::Mutex;

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

/// A virtio console bridging the guest to a host reader and writer.
/// Either side may be absent, in which case its queue is serviced but
/// idle.
pub struct Console {
    input: Option<Mutex<Box<dyn Read + Send>>>,
    output: Option<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(
        input: Option<Box<dyn Read + Send>>,
        output: Option<Box<dyn Write + Send>>,
    ) -> Self {
        Self {
            input: input.map(Mutex::new),
            output: output.map(Mutex::new),
        }
    }

    fn handle_rx(&self, input: &Mutex<Box<dyn Read + Send>>, q: &Virtq) -> Result<(), VirtioError> {
        while let Some(chain) = q.next()? {
            if chain.descs().iter().any(|d| d.is_read_only()) {
                return Err(VirtioError::BadChain("read-only descriptor in rx chain"));
            }

            let mut buf = vec![0u8; chain.descs()[0].len as usize];
            let n = input.lock().unwrap().read(&mut buf)?;

            chain.write_buf(0, &buf[..n])?;
            chain.release(n as u32)?;
        }

        Ok(())
    }

    fn handle_tx(
        &self,
        output: &Mutex<Box<dyn Write + Send>>,
        q: &Virtq,
    ) -> Result<(), VirtioError> {
        while let Some(chain) = q.next()? {
            if chain.descs().iter().any(|d| d.is_write_only()) {
                return Err(VirtioError::BadChain("write-only descriptor in tx chain"));
            }

            let mut out = output.lock().unwrap();
            for i in 0..chain.len() {
                let buf = chain.read_buf(i)?;
                out.write_all(&buf)?;
            }
            out.flush()?;
            drop(out);

            chain.release(0)?;
        }

        Ok(())
    }
}

impl DeviceHandler for Console {
    fn device_type(&self) -> DeviceId {
        DeviceId::Console
    }

    fn handle(&self, queue_num: u16, q: &Virtq) -> Result<(), VirtioError> {
        match queue_num {
            RX_QUEUE => {
                if let Some(input) = &self.input {
                    return self.handle_rx(input, q);
                }
            }

            TX_QUEUE => {
                if let Some(output) = &self.output {
                    return self.handle_tx(output, q);
                }
            }

            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::tests::TestRing;
    use crate::devices::virtio::queue::{Desc, DESC_F_NEXT, DESC_F_WRITE};
    use std::io::Cursor;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn tx_writes_out() {
        let mut ring = TestRing::new(8);
        let q = ring.queue_quiet();

        let out = SharedBuf::default();
        let console = Console::new(None, Some(Box::new(out.clone())));

        let msg = b"hello from the guest\n";
        ring.mem.write(0x4000, msg).unwrap();
        ring.push(Desc {
            addr: 0x4000,
            len: msg.len() as u32,
            id: 1,
            flags: 0,
        });

        console.handle(TX_QUEUE, &q).unwrap();

        let got = out.0.lock().unwrap().clone();
        assert_eq!(got, msg);
        assert_eq!(ring.used_at(0).len, 0);
    }

    #[test]
    fn tx_concatenates_chained_buffers() {
        let mut ring = TestRing::new(8);
        let q = ring.queue_quiet();

        let out = SharedBuf::default();
        let console = Console::new(None, Some(Box::new(out.clone())));

        ring.mem.write(0x4000, b"hello ").unwrap();
        ring.mem.write(0x5000, b"world").unwrap();
        ring.push(Desc {
            addr: 0x4000,
            len: 6,
            id: 0,
            flags: DESC_F_NEXT,
        });
        ring.push(Desc {
            addr: 0x5000,
            len: 5,
            id: 0,
            flags: 0,
        });

        console.handle(TX_QUEUE, &q).unwrap();

        assert_eq!(out.0.lock().unwrap().as_slice(), b"hello world");
    }

    #[test]
    fn rx_fills_guest_buffer() {
        let mut ring = TestRing::new(8);
        let q = ring.queue_quiet();

        let console = Console::new(Some(Box::new(Cursor::new(b"type this".to_vec()))), None);

        ring.push(Desc {
            addr: 0x4000,
            len: 64,
            id: 2,
            flags: DESC_F_WRITE,
        });

        console.handle(RX_QUEUE, &q).unwrap();

        assert_eq!(ring.used_at(0).len, 9);

        let mut buf = [0u8; 9];
        ring.mem.read(0x4000, &mut buf).unwrap();
        assert_eq!(&buf, b"type this");
    }

    #[test]
    fn rx_rejects_readable_descriptors() {
        let mut ring = TestRing::new(8);
        let q = ring.queue_quiet();

        let console = Console::new(Some(Box::new(Cursor::new(Vec::new()))), None);

        ring.push(Desc {
            addr: 0x4000,
            len: 64,
            id: 0,
            flags: 0,
        });

        assert!(matches!(
            console.handle(RX_QUEUE, &q),
            Err(VirtioError::BadChain(_))
        ));
    }

    #[test]
    fn tx_rejects_writable_descriptors() {
        let mut ring = TestRing::new(8);
        let q = ring.queue_quiet();

        let console = Console::new(None, Some(Box::new(SharedBuf::default())));

        ring.push(Desc {
            addr: 0x4000,
            len: 64,
            id: 0,
            flags: DESC_F_WRITE,
        });

        assert!(matches!(
            console.handle(TX_QUEUE, &q),
            Err(VirtioError::BadChain(_))
        ));
    }

    #[test]
    fn idle_without_endpoints() {
        let mut ring = TestRing::new(8);
        let q = ring.queue_quiet();

        let console = Console::new(None, None);

        ring.push(Desc {
            addr: 0x4000,
            len: 16,
            id: 0,
            flags: DESC_F_WRITE,
        });

        // Chains stay pending until an endpoint exists.
        console.handle(RX_QUEUE, &q).unwrap();
        assert!(q.next().unwrap().is_some());
    }
}
