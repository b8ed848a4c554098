//! Accelerator lifecycle: opening the driver, registering guest memory, and
//! running one dedicated OS thread per vCPU.
//!
//! Each vCPU thread holds [`StdMainLoopLock`] for its entire loop body
//! except while blocked inside the driver's `run_vcpu` call, so device
//! emulation on other threads never races a vCPU mid-instruction. The
//! thread parks on the lock's halt condvar whenever its vCPU is halted and
//! nothing has woken it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::collab::{InterruptController, PhysMemoryAccess, PortIoBus, StdMainLoopLock};
use crate::driver::{CvmDriver, DriverError};
use crate::memory::MemoryMapTracker;
use crate::protocol::VmHandle;
use crate::vcpu::{StepOutcome, Vcpu, VcpuError};

#[derive(Error, Debug)]
pub enum AccelError {
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Name used for each per-vCPU thread, following the
/// `"<accelerator name> vCPU <index>"` convention.
fn thread_name(accel_name: &str, index: u32) -> String {
    format!("{accel_name} vCPU {index}")
}

/// Per-vCPU handle the accelerator keeps after spawning its thread.
struct VcpuHandle {
    join: JoinHandle<()>,
    exit_request: Arc<AtomicBool>,
}

/// Owns the driver connection, the memory map tracker, and every running
/// vCPU thread for one virtual machine.
pub struct Accelerator<D: CvmDriver + Send + Sync + 'static> {
    name: String,
    driver: Arc<D>,
    vm: VmHandle,
    lock: Arc<StdMainLoopLock>,
    memory: Arc<Mutex<MemoryMapTracker<D>>>,
    vcpus: Mutex<HashMap<u32, VcpuHandle>>,
}

impl<D: CvmDriver + Send + Sync + 'static> Accelerator<D> {
    /// Open the driver and create a fresh VM. `name` seeds the per-vCPU
    /// thread names, e.g. `"noircv"` produces `"noircv vCPU 0"`.
    pub fn init(name: impl Into<String>, driver: D) -> Result<Self, AccelError> {
        let driver = Arc::new(driver);
        let vm = driver.create_vm()?;
        eprintln!("[noircv] created vm {vm:#x}");
        let memory = Arc::new(Mutex::new(MemoryMapTracker::new(driver.clone(), vm)));
        Ok(Self {
            name: name.into(),
            driver,
            vm,
            lock: Arc::new(StdMainLoopLock::new()),
            memory,
            vcpus: Mutex::new(HashMap::new()),
        })
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn vm(&self) -> VmHandle {
        self.vm
    }

    pub fn main_loop_lock(&self) -> &Arc<StdMainLoopLock> {
        &self.lock
    }

    /// Register a RAM-backed region with the shared memory map tracker.
    /// Typically called once at startup for the whole of guest RAM.
    pub fn register_memory_region(&self, gpa: u64, size: u64, host_va: u64, rom: bool) {
        self.memory
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .region_add(gpa, size, host_va, rom);
    }

    /// Spawn the dedicated thread for vCPU `index`. `make_devices` builds
    /// this thread's device collaborators; it runs on the new thread, not
    /// the caller's, so non-`Send` device state is fine.
    pub fn spawn_vcpu<F, I, P, M>(&self, index: u32, make_devices: F) -> Result<(), AccelError>
    where
        F: FnOnce() -> (I, P, M) + Send + 'static,
        I: InterruptController + 'static,
        P: PortIoBus + 'static,
        M: PhysMemoryAccess + 'static,
    {
        let exit_request = Arc::new(AtomicBool::new(false));
        let driver = self.driver.clone();
        let vm = self.vm;
        let lock = self.lock.clone();
        let exit_flag = exit_request.clone();
        let memory = self.memory.clone();

        let builder = thread::Builder::new().name(thread_name(&self.name, index));
        let join = builder
            .spawn(move || {
                let (mut interrupts, mut io, mut phys) = make_devices();

                let mut guard = lock.lock();
                if let Err(e) = driver.create_vcpu(vm, index) {
                    eprintln!("[noircv vcpu {index}] create_vcpu failed: {e}");
                    return;
                }
                let mut vcpu = Vcpu::new(driver.clone(), vm, index);
                vcpu.activate();
                eprintln!("[noircv vcpu {index}] created");

                loop {
                    if exit_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let outcome = {
                        let memory_guard = memory.lock().unwrap_or_else(|p| p.into_inner());
                        let (new_guard, outcome) =
                            vcpu.step(&lock, guard, &mut interrupts, &mut io, &mut phys, &memory_guard);
                        guard = new_guard;
                        outcome
                    };

                    match outcome {
                        Ok(StepOutcome::Continue) => {}
                        Ok(StepOutcome::Halted) => {
                            while !exit_flag.load(Ordering::SeqCst) {
                                guard = lock.wait_halt(guard);
                            }
                            vcpu.invalidate_tsc();
                        }
                        Ok(StepOutcome::Rescinded) => {}
                        Ok(StepOutcome::ExternalEventPending) => {
                            // INIT/TPR observed; the VMM drives the actual
                            // reset out-of-band and calls sync_post_reset
                            // before this vCPU runs again.
                        }
                        Ok(StepOutcome::ShutdownRequested) => {
                            eprintln!("[noircv vcpu {index}] shutdown condition observed");
                            break;
                        }
                        Err(VcpuError::Driver(e)) => {
                            eprintln!("[noircv vcpu {index}] driver error, stopping: {e}");
                            break;
                        }
                        Err(VcpuError::InvalidState { rip, .. }) => {
                            eprintln!("[noircv vcpu {index}] invalid state at rip {rip:#x}, stopping");
                            break;
                        }
                        Err(VcpuError::GuestPanic { rip, reason, .. }) => {
                            eprintln!(
                                "[noircv vcpu {index}] guest panic at rip {rip:#x}, stopping: {reason}"
                            );
                            break;
                        }
                    }
                }

                if let Err(e) = driver.delete_vcpu(vm, index) {
                    eprintln!("[noircv vcpu {index}] delete_vcpu failed: {e}");
                }
                eprintln!("[noircv vcpu {index}] destroyed");
            })
            .expect("failed to spawn vcpu thread");

        self.vcpus.lock().unwrap().insert(index, VcpuHandle { join, exit_request });
        Ok(())
    }

    /// Cancel and join a running vCPU thread.
    pub fn unplug_vcpu(&self, index: u32) {
        let handle = self.vcpus.lock().unwrap().remove(&index);
        if let Some(handle) = handle {
            handle.exit_request.store(true, Ordering::SeqCst);
            if let Err(e) = self.driver.rescind_vcpu(self.vm, index) {
                eprintln!("[noircv vcpu {index}] rescind_vcpu during unplug failed: {e}");
            }
            self.lock.notify_halt();
            let _ = handle.join.join();
        }
    }

    /// Interrupt a halted or running vCPU so it re-evaluates its exit flag
    /// or pending injections on the next loop iteration. A no-op when
    /// called from the target vCPU's own thread (it's already awake).
    pub fn kick_vcpu(&self, index: u32) {
        if thread::current().name() == Some(&thread_name(&self.name, index)) {
            return;
        }
        if let Err(e) = self.driver.rescind_vcpu(self.vm, index) {
            eprintln!("[noircv vcpu {index}] rescind_vcpu during kick failed: {e}");
        }
        self.lock.notify_halt();
    }
}

impl<D: CvmDriver + Send + Sync + 'static> Drop for Accelerator<D> {
    fn drop(&mut self) {
        let indices: Vec<u32> = self.vcpus.lock().unwrap().keys().copied().collect();
        for index in indices {
            self.unplug_vcpu(index);
        }
        if let Err(e) = self.driver.delete_vm(self.vm) {
            eprintln!("[noircv] delete_vm failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EmulationInfo;
    use crate::protocol::{
        AddrMapInfo, EventInjection, ExitContext, ExitPayload, InterceptCode, NoirStatus,
        RegisterType, SegReg, VpState,
    };
    use std::sync::atomic::AtomicU32;

    struct HaltingDriver {
        calls: AtomicU32,
    }

    impl CvmDriver for HaltingDriver {
        fn create_vm(&self) -> Result<VmHandle, DriverError> {
            Ok(1)
        }
        fn delete_vm(&self, _vm: VmHandle) -> Result<(), DriverError> {
            Ok(())
        }
        fn create_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn delete_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn set_mapping(&self, _vm: VmHandle, _map: &AddrMapInfo) -> Result<(), DriverError> {
            Ok(())
        }
        fn inject_event(&self, _vm: VmHandle, _vpid: u32, _event: &EventInjection) -> Result<(), DriverError> {
            Ok(())
        }
        fn view_register(
            &self,
            _vm: VmHandle,
            _vpid: u32,
            _reg: RegisterType,
            _buf: &mut [u8],
        ) -> Result<usize, DriverError> {
            Ok(0)
        }
        fn edit_register(
            &self,
            _vm: VmHandle,
            _vpid: u32,
            _reg: RegisterType,
            _buf: &[u8],
        ) -> Result<(), DriverError> {
            Ok(())
        }
        fn run_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<ExitContext, DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExitContext {
                intercept_code: InterceptCode::HltInstruction,
                payload: ExitPayload::None,
                cs: SegReg::default(),
                rip: 0,
                rflags: 0,
                next_rip: 0,
                vp_state: VpState::default(),
            })
        }
        fn rescind_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn try_emulate(
            &self,
            _vm: VmHandle,
            _vpid: u32,
            _info: &EmulationInfo,
            _buf: &mut [u8],
        ) -> Result<NoirStatus, DriverError> {
            Ok(crate::protocol::status::SUCCESS)
        }
    }

    struct NoIrq;
    impl InterruptController for NoIrq {
        fn has_pending_hard_irq(&self) -> bool {
            false
        }
        fn ack_hard_irq(&mut self) -> u8 {
            0
        }
    }
    struct NoIo;
    impl PortIoBus for NoIo {
        fn io_read(&mut self, _port: u16, _data: &mut [u8]) {}
        fn io_write(&mut self, _port: u16, _data: &[u8]) {}
    }
    struct NoPhys;
    impl PhysMemoryAccess for NoPhys {
        fn read_physical(&self, _gpa: u64, _data: &mut [u8]) -> bool {
            true
        }
        fn write_physical(&self, _gpa: u64, _data: &[u8]) -> bool {
            true
        }
    }

    #[test]
    fn spawn_and_unplug_a_vcpu_thread() {
        let accel = Accelerator::init("noircv-test", HaltingDriver { calls: AtomicU32::new(0) }).unwrap();
        accel.spawn_vcpu(0, || (NoIrq, NoIo, NoPhys)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        accel.unplug_vcpu(0);
        assert!(accel.vcpus.lock().unwrap().is_empty());
    }

    #[test]
    fn kick_from_another_thread_wakes_a_halted_vcpu() {
        let accel = Arc::new(Accelerator::init("noircv-test", HaltingDriver { calls: AtomicU32::new(0) }).unwrap());
        accel.spawn_vcpu(0, || (NoIrq, NoIo, NoPhys)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        accel.kick_vcpu(0);
        accel.unplug_vcpu(0);
    }
}
