//! vCPU worker threads.
//!
//! KVM requires that all state ioctls and the run loop for a given vCPU
//! happen on one OS thread. Each vCPU therefore gets a dedicated thread
//! consuming a queue of closures; [`VcpuWorker::call`] runs a closure
//! there and returns its result, serializing all access to the vCPU fd.
//!
//! The worker thread registers a no-op handler for the kick signal so a
//! `pthread_kill` interrupts an in-flight `KVM_RUN` with EINTR without
//! killing the process. The canceller pairs that kick with the
//! immediate-exit flag in the shared run state.

use super::VmError;
use crate::kvm::Vcpu;
use libc::{c_int, c_void, siginfo_t};
use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, Once};
use std::thread::{self, JoinHandle};
use vmm_sys_util::signal::{register_signal_handler, Killable};

type VcpuOp = Box<dyn FnOnce(&mut Option<Vcpu>) + Send>;

fn kick_signum() -> c_int {
    libc::SIGRTMIN()
}

extern "C" fn kick_handler(_num: c_int, _info: *mut siginfo_t, _ctx: *mut c_void) {}

fn register_kick_handler() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        register_signal_handler(kick_signum(), kick_handler)
            .expect("failed to register the vCPU kick signal handler");
    });
}

/// A vCPU's dedicated OS thread and operation queue.
///
/// The thread owns the `Vcpu` handle; it is created by the first
/// operation and dropped (closing the fd and unmapping the run state)
/// when the queue closes.
pub struct VcpuWorker {
    op_tx: Mutex<Option<Sender<VcpuOp>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VcpuWorker {
    pub fn spawn(name: String) -> io::Result<Self> {
        let (op_tx, op_rx) = mpsc::channel::<VcpuOp>();

        let thread = thread::Builder::new().name(name).spawn(move || {
            register_kick_handler();

            let mut vcpu: Option<Vcpu> = None;
            for op in op_rx {
                op(&mut vcpu);
            }
        })?;

        Ok(Self {
            op_tx: Mutex::new(Some(op_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `f` on the vCPU thread and return its result. Calls are
    /// serialized in submission order.
    pub fn call<T, F>(&self, f: F) -> Result<T, VmError>
    where
        F: FnOnce(&mut Option<Vcpu>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let op_tx = match self.op_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(VmError::Closed),
        };

        let (res_tx, res_rx) = mpsc::channel();
        let op: VcpuOp = Box::new(move |vcpu| {
            let _ = res_tx.send(f(vcpu));
        });

        op_tx.send(op).map_err(|_| VmError::Closed)?;
        res_rx.recv().map_err(|_| VmError::Closed)
    }

    /// Interrupt the vCPU thread, forcing an in-flight `KVM_RUN` to
    /// return EINTR.
    pub fn kick(&self) {
        if let Some(thread) = self.thread.lock().unwrap().as_ref() {
            let _ = thread.kill(kick_signum());
        }
    }

    /// Close the operation queue and wait for the thread to finish its
    /// current operation and exit.
    pub fn close(&self) {
        self.op_tx.lock().unwrap().take();

        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_run_in_order() {
        let worker = VcpuWorker::spawn("vcpu-test".into()).unwrap();

        let a = worker.call(|_| 1).unwrap();
        let b = worker.call(move |_| a + 1).unwrap();
        assert_eq!(b, 2);

        worker.close();
        assert!(matches!(worker.call(|_| ()), Err(VmError::Closed)));
    }

    #[test]
    fn close_twice_is_quiet() {
        let worker = VcpuWorker::spawn("vcpu-test".into()).unwrap();
        worker.close();
        worker.close();
    }
}
