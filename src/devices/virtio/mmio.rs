//! Virtio-mmio device bus.
//!
//! Each installed device owns a 4 KiB register window and an IRQ line,
//! assigned sequentially from [`MMIO_BASE`] and [`BASE_IRQ`]. The bus
//! routes MMIO exits to the owning device, which runs the virtio-mmio
//! transport state machine (reset → feature negotiation → queue
//! configuration → running) behind a per-device lock.
//!
//! When the guest flips a queue to ready, the device resolves the queue's
//! three regions in guest memory, builds a packed [`Virtq`] and parks a
//! worker thread on a depth-1 wake channel. `QueueNotify` writes post a
//! coalescing wake; the worker calls the device handler, which drains the
//! queue and raises used-buffer interrupts through the bus's IRQ notify
//! callback (an eventfd write, routed into the guest by KVM).

use super::queue::{EventSuppress, QueueRegions, Virtq};
use super::{DeviceHandler, DeviceId, VirtioError, REQUIRED_FEATURES};
use crate::vmm::memory::GuestMemory;
use log::{debug, error};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Guest physical address of the first device's register window.
pub const MMIO_BASE: u64 = 0xd000_0000;

/// Size of each device's register window.
pub const MMIO_SIZE: u64 = 0x1000;

/// IRQ line of the first device; subsequent devices count up from here.
pub const BASE_IRQ: u32 = 5;

/// Queues per device. The transport exposes a selector this wide; devices
/// in this crate use at most three.
pub const MAX_QUEUES: usize = 16;

// mmio register offsets

const REG_MAGIC_VALUE: u64 = 0x000; // always 0x74726976 (R, "virt")
const REG_VERSION: u64 = 0x004; // always 0x2 (R)
const REG_DEVICE_ID: u64 = 0x008; // virtio subsystem device id (R)
const REG_VENDOR_ID: u64 = 0x00c; // virtio subsystem vendor id (R)
const REG_DEVICE_FEATURES: u64 = 0x010; // feature flags, word selected by 0x014 (R)
const REG_DEVICE_FEATURES_SEL: u64 = 0x014; // word selection for 0x010 (W)
const REG_DRIVER_FEATURES: u64 = 0x020; // feature flags activated by the driver (W)
const REG_DRIVER_FEATURES_SEL: u64 = 0x024; // word selection for 0x020 (W)
const REG_QUEUE_SEL: u64 = 0x030; // virtual queue index (W)
const REG_QUEUE_NUM_MAX: u64 = 0x034; // maximum virtual queue size (R)
const REG_QUEUE_NUM: u64 = 0x038; // virtual queue size (W)
const REG_QUEUE_READY: u64 = 0x044; // virtual queue ready bit (RW)
const REG_QUEUE_NOTIFY: u64 = 0x050; // queue notifier (W)
const REG_INTERRUPT_STATUS: u64 = 0x060; // interrupt status (R)
const REG_INTERRUPT_ACK: u64 = 0x064; // interrupt acknowledge (W)
const REG_STATUS: u64 = 0x070; // device status (RW)
const REG_QUEUE_DESC_LOW: u64 = 0x080; // descriptor area GPA, low word (W)
const REG_QUEUE_DESC_HIGH: u64 = 0x084; // descriptor area GPA, high word (W)
const REG_QUEUE_DRIVER_LOW: u64 = 0x090; // driver area GPA, low word (W)
const REG_QUEUE_DRIVER_HIGH: u64 = 0x094; // driver area GPA, high word (W)
const REG_QUEUE_DEVICE_LOW: u64 = 0x0a0; // device area GPA, low word (W)
const REG_QUEUE_DEVICE_HIGH: u64 = 0x0a4; // device area GPA, high word (W)
const REG_CONFIG_GENERATION: u64 = 0x0fc; // configuration atomicity value (R)
const REG_DEVICE_CONFIG: u64 = 0x100; // device-specific config space (RW)

const MAGIC_VALUE: u32 = 0x7472_6976; // "virt"
const MMIO_VERSION: u32 = 2;
const VENDOR_ID: u32 = 0xffff;
const QUEUE_NUM_MAX: u32 = 1 << 15;

// device status bits

pub const STATUS_ACKNOWLEDGE: u32 = 1; // recognized by the guest
pub const STATUS_DRIVER: u32 = 2; // the guest has a driver
pub const STATUS_DRIVER_OK: u32 = 4; // ready to drive
pub const STATUS_FEATURES_OK: u32 = 8; // features negotiated
pub const STATUS_NEEDS_RESET: u32 = 64; // fatal device error
pub const STATUS_FAILED: u32 = 128; // fatal driver error

const NEGOTIATING_FEATURES: u32 = STATUS_ACKNOWLEDGE | STATUS_DRIVER;
const CONFIGURING_QUEUES: u32 = NEGOTIATING_FEATURES | STATUS_FEATURES_OK;
const OPERATING_NORMALLY: u32 = CONFIGURING_QUEUES | STATUS_DRIVER_OK;

// interrupt status bits

/// The device has used at least one buffer.
pub const INT_STATUS_USED_BUFFER: u32 = 1 << 0;

/// The configuration of the device has changed.
pub const INT_STATUS_CONFIG_CHANGE: u32 = 1 << 1;

/// Raises IRQ `irq` in the guest, typically by writing the irqfd
/// registered for that GSI.
pub type IrqNotifyFn = Box<dyn Fn(u32) -> std::io::Result<()> + Send + Sync>;

/// Describes an installed virtio-mmio device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub device_type: DeviceId,
    pub irq: u32,
    pub addr: u64,
    pub size: u64,
}

/// The virtio-mmio bus. Owns one [`Device`] per handler.
pub struct Bus {
    devices: Vec<Arc<Device>>,
}

struct Device {
    info: DeviceInfo,
    handler: Arc<dyn DeviceHandler>,
    mem: GuestMemory,
    notify: Arc<IrqNotifyFn>,
    state: Mutex<DeviceState>,
}

#[derive(Default)]
struct DeviceState {
    status: u32,
    version: u32,

    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,

    queue_sel: u32,
    queues: [QueueState; MAX_QUEUES],

    int_status: u32,

    wake: [Option<SyncSender<()>>; MAX_QUEUES],
}

#[derive(Debug, Clone, Copy, Default)]
struct QueueState {
    ready: u32,
    num_desc: u32,
    desc_addr: u64,
    driver_addr: u64,
    device_addr: u64,
}

impl Bus {
    /// Install a device for each handler, assigning IRQs and register
    /// windows sequentially. `notify` is called whenever a device wants to
    /// interrupt the guest.
    pub fn new(
        handlers: Vec<Arc<dyn DeviceHandler>>,
        mem: GuestMemory,
        notify: IrqNotifyFn,
    ) -> Self {
        let notify = Arc::new(notify);

        let devices = handlers
            .into_iter()
            .enumerate()
            .map(|(i, handler)| {
                Arc::new(Device {
                    info: DeviceInfo {
                        device_type: handler.device_type(),
                        irq: BASE_IRQ + i as u32,
                        addr: MMIO_BASE + i as u64 * MMIO_SIZE,
                        size: MMIO_SIZE,
                    },
                    handler,
                    mem: mem.clone(),
                    notify: Arc::clone(&notify),
                    state: Mutex::new(DeviceState::default()),
                })
            })
            .collect();

        Self { devices }
    }

    /// Describe the installed devices, in installation order.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|d| d.info).collect()
    }

    /// Route an MMIO exit to the device owning `addr`. Returns `false` if
    /// no device claims the address.
    pub fn handle_mmio(
        &self,
        addr: u64,
        data: &mut [u8],
        is_write: bool,
    ) -> Result<bool, VirtioError> {
        let dev = self
            .devices
            .iter()
            .find(|d| addr >= d.info.addr && addr < d.info.addr + d.info.size);

        match dev {
            Some(dev) => {
                Device::handle_mmio(dev, addr - dev.info.addr, data, is_write)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Shut down every device: retire the queue workers' wake channels and
    /// close the handlers.
    ///
    /// Workers are detached threads; dropping a queue's wake sender ends
    /// its worker loop, and a worker blocked in its handler exits as soon
    /// as the handler's own close unblocks it. Workers keep the guest
    /// memory mapping alive through their queue handles, so reclaiming
    /// memory stays safe regardless of when they finish.
    pub fn close(&self) {
        for dev in &self.devices {
            dev.state.lock().unwrap().wake = Default::default();
            dev.handler.close();
        }
    }
}

impl Device {
    fn handle_mmio(
        dev: &Arc<Device>,
        offset: u64,
        data: &mut [u8],
        is_write: bool,
    ) -> Result<(), VirtioError> {
        let mut state = dev.state.lock().unwrap();

        let res = if is_write {
            Device::write_reg(dev, &mut state, offset, data)
        } else {
            dev.read_reg(&mut state, offset, data)
        };

        if res.is_err() {
            dev.fault_locked(&mut state);
        }

        res
    }

    /// Mark the device broken: set NEEDS_RESET, bump the config
    /// generation, and if the device was running tell the driver via a
    /// config-change interrupt.
    fn fault_locked(&self, state: &mut MutexGuard<'_, DeviceState>) {
        if state.status & (STATUS_NEEDS_RESET | STATUS_FAILED) != 0 {
            return;
        }

        let was_running = state.status == OPERATING_NORMALLY;
        state.status |= STATUS_NEEDS_RESET;
        state.version = state.version.wrapping_add(1);

        if was_running {
            state.int_status |= INT_STATUS_CONFIG_CHANGE;
            if let Err(err) = (self.notify)(self.info.irq) {
                error!(
                    "virtio {}: config change notification failed on irq {}: {err}",
                    self.info.device_type, self.info.irq
                );
            }
        }
    }

    fn fault(&self) {
        let mut state = self.state.lock().unwrap();
        self.fault_locked(&mut state);
    }

    fn read_reg(
        &self,
        state: &mut DeviceState,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), VirtioError> {
        let value = match offset {
            REG_MAGIC_VALUE => MAGIC_VALUE,
            REG_VERSION => MMIO_VERSION,
            REG_DEVICE_ID => self.handler.device_type() as u32,
            REG_VENDOR_ID => VENDOR_ID,
            REG_DEVICE_FEATURES => {
                (self.features() >> (32 * state.device_features_sel)) as u32
            }
            REG_QUEUE_NUM_MAX => QUEUE_NUM_MAX,
            REG_QUEUE_READY => selected_queue(state).ready,
            REG_INTERRUPT_STATUS => state.int_status,
            REG_STATUS => state.status,
            REG_CONFIG_GENERATION => state.version,

            off if off >= REG_DEVICE_CONFIG => {
                return self
                    .handler
                    .read_config(data, (off - REG_DEVICE_CONFIG) as usize);
            }

            _ => return Err(VirtioError::InvalidValue),
        };

        put_le32(data, value);
        Ok(())
    }

    fn write_reg(
        dev: &Arc<Device>,
        state: &mut DeviceState,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), VirtioError> {
        // A broken device only accepts status writes (to be reset).
        if state.status & (STATUS_NEEDS_RESET | STATUS_FAILED) != 0 && offset != REG_STATUS {
            return Err(VirtioError::NotPermitted);
        }

        let v = get_le32(data);

        match offset {
            REG_DEVICE_FEATURES_SEL => {
                check(state.status == NEGOTIATING_FEATURES)?;
                check_value(v <= 1)?;
                state.device_features_sel = v;
            }

            REG_DRIVER_FEATURES_SEL => {
                check(state.status == NEGOTIATING_FEATURES)?;
                check_value(v <= 1)?;
                state.driver_features_sel = v;
            }

            REG_DRIVER_FEATURES => {
                check(state.status == NEGOTIATING_FEATURES)?;
                state.driver_features |= u64::from(v) << (32 * state.driver_features_sel);

                if state.driver_features & !dev.features() != 0 {
                    return Err(VirtioError::InvalidValue);
                }
            }

            REG_QUEUE_SEL => {
                check(state.status == CONFIGURING_QUEUES)?;
                check_value((v as usize) < MAX_QUEUES)?;
                state.queue_sel = v;
            }

            REG_QUEUE_NUM => {
                check_queue_config(state)?;
                check_value(v <= QUEUE_NUM_MAX)?;
                selected_queue(state).num_desc = v;
            }

            REG_QUEUE_DESC_LOW => {
                check_queue_config(state)?;
                selected_queue(state).desc_addr |= u64::from(v);
            }

            REG_QUEUE_DESC_HIGH => {
                check_queue_config(state)?;
                selected_queue(state).desc_addr |= u64::from(v) << 32;
            }

            REG_QUEUE_DRIVER_LOW => {
                check_queue_config(state)?;
                selected_queue(state).driver_addr |= u64::from(v);
            }

            REG_QUEUE_DRIVER_HIGH => {
                check_queue_config(state)?;
                selected_queue(state).driver_addr |= u64::from(v) << 32;
            }

            REG_QUEUE_DEVICE_LOW => {
                check_queue_config(state)?;
                selected_queue(state).device_addr |= u64::from(v);
            }

            REG_QUEUE_DEVICE_HIGH => {
                check_queue_config(state)?;
                selected_queue(state).device_addr |= u64::from(v) << 32;
            }

            REG_QUEUE_READY => {
                check(state.status == CONFIGURING_QUEUES)?;
                check_value(v == 1)?;
                check(selected_queue(state).ready == 0)?;
                Device::queue_ready(dev, state)?;
            }

            REG_QUEUE_NOTIFY => {
                check(state.status == OPERATING_NORMALLY)?;
                check_value((v as usize) < MAX_QUEUES)?;
                check(state.queues[v as usize].ready == 1)?;

                if let Some(wake) = &state.wake[v as usize] {
                    match wake.try_send(()) {
                        // A full channel means a wake is already pending;
                        // notifications coalesce.
                        Ok(()) | Err(TrySendError::Full(())) => {}
                        Err(TrySendError::Disconnected(())) => {
                            return Err(VirtioError::NotPermitted)
                        }
                    }
                }
            }

            REG_INTERRUPT_ACK => {
                check(state.status == OPERATING_NORMALLY)?;
                state.int_status &= !v;
            }

            REG_STATUS => return dev.write_status(state, v),

            _ => return Err(VirtioError::InvalidValue),
        }

        Ok(())
    }

    fn write_status(&self, state: &mut DeviceState, v: u32) -> Result<(), VirtioError> {
        if v == 0 {
            debug!("virtio {}: reset", self.info.device_type);

            // Dropping the wake senders terminates the queue workers.
            *state = DeviceState::default();

            return Ok(());
        }

        // Outside of reset, status only accretes bits, and the driver may
        // never claim the device needs a reset.
        if v & STATUS_NEEDS_RESET != 0 || v & state.status != state.status {
            return Err(VirtioError::NotPermitted);
        }

        state.status = v;
        state.version = state.version.wrapping_add(1);

        if v & STATUS_FAILED != 0 {
            error!("virtio {}: driver failed", self.info.device_type);
            return Err(VirtioError::DriverFailed);
        }

        if state.status == OPERATING_NORMALLY {
            if state.driver_features & REQUIRED_FEATURES != REQUIRED_FEATURES {
                return Err(VirtioError::MissingRequiredFeatures(state.driver_features));
            }

            self.handler.ready(state.driver_features)?;
        }

        Ok(())
    }

    /// Bring the selected queue up: validate its regions, build the
    /// virtqueue, and park a worker on a fresh wake channel.
    fn queue_ready(dev: &Arc<Device>, state: &mut DeviceState) -> Result<(), VirtioError> {
        let qn = state.queue_sel as usize;

        selected_queue(state).ready = 1;
        state.version = state.version.wrapping_add(1);

        let q = *selected_queue(state);

        let regions = QueueRegions {
            desc: q.desc_addr,
            driver_event: q.driver_addr,
            device_event: q.device_addr,
        };

        for (addr, len) in [
            (regions.desc, q.num_desc as usize * 16),
            (regions.driver_event, EventSuppress::SIZE as usize),
            (regions.device_event, EventSuppress::SIZE as usize),
        ] {
            if !dev.mem.check_range(addr, len) {
                return Err(VirtioError::Memory(
                    crate::vmm::memory::MemoryError::OutOfRange { addr, len },
                ));
            }
        }

        let notify_dev = Arc::clone(dev);
        let notify = Box::new(move || {
            let mut state = notify_dev.state.lock().unwrap();
            state.int_status |= INT_STATUS_USED_BUFFER;
            (notify_dev.notify)(notify_dev.info.irq).map_err(VirtioError::Io)
        });

        let vq = Virtq::new(dev.mem.clone(), regions, q.num_desc as u16, notify)?;

        debug!(
            "virtio {}: queue {qn} ready, {} descriptors",
            dev.info.device_type, q.num_desc
        );

        let (wake_tx, wake_rx) = mpsc::sync_channel::<()>(1);
        state.wake[qn] = Some(wake_tx);

        let worker_dev = Arc::clone(dev);
        let handler = Arc::clone(&dev.handler);
        thread::Builder::new()
            .name(format!("virtio-{}-q{qn}", dev.info.device_type))
            .spawn(move || {
                while wake_rx.recv().is_ok() {
                    if let Err(err) = handler.handle(qn as u16, &vq) {
                        error!(
                            "virtio {}: queue {qn} failed: {err}",
                            worker_dev.info.device_type
                        );
                        worker_dev.fault();
                        break;
                    }
                }
            })
            .map_err(VirtioError::Io)?;

        Ok(())
    }

    fn features(&self) -> u64 {
        REQUIRED_FEATURES | self.handler.features()
    }
}

fn selected_queue(state: &mut DeviceState) -> &mut QueueState {
    &mut state.queues[state.queue_sel as usize % MAX_QUEUES]
}

fn check(permitted: bool) -> Result<(), VirtioError> {
    if permitted {
        Ok(())
    } else {
        Err(VirtioError::NotPermitted)
    }
}

fn check_value(valid: bool) -> Result<(), VirtioError> {
    if valid {
        Ok(())
    } else {
        Err(VirtioError::InvalidValue)
    }
}

fn check_queue_config(state: &mut DeviceState) -> Result<(), VirtioError> {
    check(state.status == CONFIGURING_QUEUES && selected_queue(state).ready == 0)
}

fn put_le32(data: &mut [u8], v: u32) {
    let bytes = v.to_le_bytes();
    let n = data.len().min(4);
    data[..n].copy_from_slice(&bytes[..n]);
}

fn get_le32(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = data.len().min(4);
    bytes[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(bytes)
}
