//! Trait boundaries for the VMM-side collaborators this crate calls into
//! but does not implement: device emulation, interrupt routing, and the
//! big lock that serializes everything off the vCPU's own run loop.
//!
//! A real embedding VMM supplies its own implementations. The default
//! [`StdMainLoopLock`] and the demo devices under [`crate::devices`] exist
//! so the run loop and lifecycle manager can be driven end-to-end without
//! pulling in a full device model.

use std::sync::{Condvar, Mutex, MutexGuard};

/// Source of pending virtual interrupts for the PIC/IOAPIC/APIC path.
/// Queried by the run loop's pre-run step before each resume.
pub trait InterruptController {
    /// Is a hardware IRQ line currently asserted and unmasked?
    fn has_pending_hard_irq(&self) -> bool;
    /// Acknowledge and return the vector for the pending IRQ.
    fn ack_hard_irq(&mut self) -> u8;
}

/// Port I/O device model, consulted by the non-string I/O exit handler.
pub trait PortIoBus {
    fn io_read(&mut self, port: u16, data: &mut [u8]);
    fn io_write(&mut self, port: u16, data: &[u8]);
}

/// Host-backed guest physical memory accessor, used by the MMIO exit
/// handler to source/sink the bytes an in-kernel emulation call needs.
pub trait PhysMemoryAccess {
    fn read_physical(&self, gpa: u64, data: &mut [u8]) -> bool;
    fn write_physical(&self, gpa: u64, data: &[u8]) -> bool;
}

/// Invoked when the run loop observes a debug exception it can't resolve on
/// its own. The default implementation does nothing; a VMM with a GDB stub
/// would forward to it here.
pub trait GuestDebugHandler {
    fn handle_guest_debug(&mut self, vpid: u32);
}

/// No-op debug handler used when the embedding binary doesn't wire up a
/// real one.
#[derive(Default)]
pub struct NullGuestDebugHandler;

impl GuestDebugHandler for NullGuestDebugHandler {
    fn handle_guest_debug(&mut self, _vpid: u32) {}
}

/// The VMM's single big lock: serializes everything except the blocking
/// driver `run_vcpu` call itself. Each vCPU thread holds this for the
/// entirety of its loop body except while inside that call.
///
/// This is a thin `Mutex<()>` + `Condvar` pair, the natural mapping for a
/// one-thread-per-vCPU, one-shared-lock, one-halt-condvar model. An
/// embedding VMM that already has its own iothread lock can implement the
/// same shape instead of using this type.
pub struct StdMainLoopLock {
    mutex: Mutex<()>,
    halt_cond: Condvar,
}

impl StdMainLoopLock {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            halt_cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait on the halt condition variable, atomically releasing `guard`
    /// and reacquiring it before returning. Used by the idle-wait step of
    /// the accelerator's per-vCPU thread loop.
    pub fn wait_halt<'a>(&'a self, guard: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        self.halt_cond
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wake every thread blocked in `wait_halt`.
    pub fn notify_halt(&self) {
        self.halt_cond.notify_all();
    }
}

impl Default for StdMainLoopLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_halt_wakes_on_notify() {
        let lock = Arc::new(StdMainLoopLock::new());
        let waiter = lock.clone();
        let handle = thread::spawn(move || {
            let guard = waiter.lock();
            let _guard = waiter.wait_halt(guard);
        });

        thread::sleep(Duration::from_millis(20));
        lock.notify_halt();
        handle.join().unwrap();
    }
}
