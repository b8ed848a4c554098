//! Per-vCPU run loop: the state machine that turns one `run_vcpu` call into
//! a dispatched exit, plus the pre-run injection step that feeds the next
//! one.
//!
//! A [`Vcpu`] owns no thread of its own; [`crate::accel`] drives it from a
//! dedicated OS thread while holding the shared main-loop lock. Everything
//! here runs synchronously and is safe to unit test without a real driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};

use thiserror::Error;

use crate::collab::{InterruptController, PhysMemoryAccess, PortIoBus, StdMainLoopLock};
use crate::driver::{CvmDriver, DriverError, EmulationInfo};
use crate::memory::MemoryMapTracker;
use crate::protocol::{
    status, EventInjection, EventType, ExitContext, ExitPayload, InterceptCode, IoContext,
    IoDirection, MemoryAccessContext, VmHandle,
};
use crate::registers::{CpuState, RegisterSync, SyncLevel};

/// RFLAGS.IF — interrupts enabled.
const RFLAGS_IF: u64 = 1 << 9;

/// Mask for a string-I/O index register (RSI/RDI), sized per
/// `IoContext::address_width` (in bytes: 2, 4, or 8).
fn address_mask(address_width: u8) -> u64 {
    match address_width {
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

#[derive(Error, Debug)]
pub enum VcpuError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("vcpu {vpid} reported invalid state at rip {rip:#x}")]
    InvalidState { vpid: u32, rip: u64 },

    /// An exit this crate has no emulator for, or an emulation request the
    /// host rejected. The accelerator tears the vCPU thread down on this;
    /// it is guest-fatal, not a transport failure.
    #[error("vcpu {vpid} guest panic at rip {rip:#x}: {reason}")]
    GuestPanic { vpid: u32, rip: u64, reason: String },
}

/// The run loop's position in its own state machine. `crate::accel` reads
/// this to decide when a vCPU is safe to tear down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Inactive,
    Ready,
    PreRun,
    Running,
    PostRun,
}

/// What the caller should do after one [`Vcpu::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Ordinary exit, handled in-line; call `step` again.
    Continue,
    /// `HltInstruction` observed with no interrupt already pending; the
    /// accelerator should idle-wait until a wakeup condition (IRQ, NMI,
    /// unplug) fires.
    Halted,
    /// `ShutdownCondition` observed; the vCPU should be torn down.
    ShutdownRequested,
    /// `Rescission` observed; another thread cancelled our `run_vcpu` call.
    /// Not an error, just means the caller should check its own exit flag.
    Rescinded,
    /// Pre-run observed a pending INIT or TPR-threshold signal and skipped
    /// `run_vcpu` this cycle so the VMM can process it first.
    ExternalEventPending,
}

/// One vCPU's run loop state plus the architectural register cache the
/// register synchronizer pushes to and pulls from.
pub struct Vcpu<D: CvmDriver> {
    pub vpid: u32,
    driver: Arc<D>,
    vm: VmHandle,
    regs: RegisterSync<D>,
    pub state: VcpuState,
    pub cpu: CpuState,
    dirty: bool,
    tsc_valid: bool,

    /// The hypervisor reports a virtual interrupt is awaiting a window.
    interrupt_pending: bool,
    /// The guest is not in an interrupt-shadow.
    interruptible: bool,
    /// Last exit left the guest able to take a PIC IRQ; cleared every
    /// pre-run (one-shot hint).
    ready_for_pic_interrupt: bool,

    pending_nmi: AtomicBool,
    pending_smi: AtomicBool,
    pending_init: AtomicBool,
    pending_tpr: AtomicBool,
}

impl<D: CvmDriver> Vcpu<D> {
    pub fn new(driver: Arc<D>, vm: VmHandle, vpid: u32) -> Self {
        let regs = RegisterSync::new(driver.clone(), vm, vpid);
        Self {
            vpid,
            driver,
            vm,
            regs,
            state: VcpuState::Inactive,
            cpu: CpuState::default(),
            dirty: true,
            tsc_valid: false,
            interrupt_pending: false,
            interruptible: true,
            ready_for_pic_interrupt: false,
            pending_nmi: AtomicBool::new(false),
            pending_smi: AtomicBool::new(false),
            pending_init: AtomicBool::new(false),
            pending_tpr: AtomicBool::new(false),
        }
    }

    /// Request an NMI be injected on the next pre-run step. Safe to call
    /// from another thread.
    pub fn request_nmi(&self) {
        self.pending_nmi.store(true, Ordering::SeqCst);
    }

    /// Request an SMI. SMM is not modeled by this accelerator; the next
    /// pre-run step logs and drops the request rather than forcing a
    /// return, matching the documented limitation (§1 Non-goals).
    pub fn request_smi(&self) {
        self.pending_smi.store(true, Ordering::SeqCst);
    }

    /// Signal a pending INIT IPI. The next pre-run step forces a return to
    /// the VMM instead of running the guest; the VMM is expected to drive
    /// the actual reset through [`Vcpu::sync_post_reset`].
    pub fn request_init(&self) {
        self.pending_init.store(true, Ordering::SeqCst);
    }

    /// Signal a TPR-threshold crossing from the local APIC emulation. Same
    /// forced-return treatment as [`Vcpu::request_init`].
    pub fn request_tpr_update(&self) {
        self.pending_tpr.store(true, Ordering::SeqCst);
    }

    /// `sync_state`: pull every register from the hypervisor into the VMM
    /// image, but only if the image isn't already dirty (§4.D).
    pub fn sync_state(&mut self) {
        if !self.dirty {
            let _ = self.regs.pull(&mut self.cpu, !self.tsc_valid);
            if !self.tsc_valid {
                self.tsc_valid = true;
            }
            self.dirty = true;
        }
    }

    /// `sync_post_reset`: push the reset-level register subset and clear
    /// `dirty`.
    pub fn sync_post_reset(&mut self) {
        let _ = self.regs.push(&self.cpu, SyncLevel::Reset);
        self.dirty = false;
    }

    /// `sync_post_init`: push the full register subset (includes TSC) and
    /// clear `dirty`.
    pub fn sync_post_init(&mut self) {
        let _ = self.regs.push(&self.cpu, SyncLevel::Full);
        self.tsc_valid = true;
        self.dirty = false;
    }

    /// `sync_pre_loadvm`: mark the image dirty; the actual push happens at
    /// the next run.
    pub fn sync_pre_loadvm(&mut self) {
        self.dirty = true;
    }

    /// Invalidate the cached TSC. The VMM calls this on every transition to
    /// the running state so the next pull refreshes it (§4.D); the only
    /// "stopped" sub-state this crate itself models is `Halted`, so
    /// `crate::accel` calls this when a vCPU leaves its halt wait.
    pub fn invalidate_tsc(&mut self) {
        self.tsc_valid = false;
    }

    /// Push register state and transition `Inactive -> Ready`. Called once
    /// after `create_vcpu` succeeds, mirroring `synchronize_post_init`.
    pub fn activate(&mut self) {
        self.sync_post_init();
        self.state = VcpuState::Ready;
    }

    fn guest_panic(&self, rip: u64, reason: impl Into<String>) -> VcpuError {
        eprintln!(
            "[noircv vcpu {}] guest panic at rip {rip:#x}: registers = {:?}",
            self.vpid, self.cpu
        );
        VcpuError::GuestPanic {
            vpid: self.vpid,
            rip,
            reason: reason.into(),
        }
    }

    /// Pre-run injection step (§4.E). Returns `false` when the caller
    /// should skip `run_vcpu` this cycle (a pending INIT/TPR signal forces
    /// an early return to the VMM).
    fn pre_run(&mut self, interrupts: &mut dyn InterruptController) -> bool {
        self.state = VcpuState::PreRun;

        if self.dirty {
            let _ = self.regs.push(&self.cpu, SyncLevel::Runtime);
            self.dirty = false;
        }

        let ready_for_pic = self.ready_for_pic_interrupt;
        self.ready_for_pic_interrupt = false;

        let mut proceed = true;
        if !self.interrupt_pending {
            if self.pending_nmi.swap(false, Ordering::SeqCst) {
                self.interruptible = false;
                let event = EventInjection {
                    vector: 2,
                    event_type: EventType::Nmi,
                    error_code_valid: false,
                    priority: 0,
                    error_code: 0,
                };
                if let Err(e) = self.driver.inject_event(self.vm, self.vpid, &event) {
                    eprintln!("[noircv vcpu {}] NMI injection failed: {e}", self.vpid);
                }
            }

            if self.pending_smi.swap(false, Ordering::SeqCst) {
                eprintln!("[noircv vcpu {}] SMI requested; SMM is not supported, ignoring", self.vpid);
            }

            if self.pending_init.swap(false, Ordering::SeqCst)
                || self.pending_tpr.swap(false, Ordering::SeqCst)
            {
                proceed = false;
            }
        }

        if proceed && ready_for_pic && interrupts.has_pending_hard_irq() {
            let vector = interrupts.ack_hard_irq();
            eprintln!("[noircv vcpu {}] injecting external interrupt vector {vector:#x}", self.vpid);
            let event = EventInjection {
                vector,
                event_type: EventType::ExternalInterrupt,
                error_code_valid: false,
                priority: 0,
                error_code: 0,
            };
            if let Err(e) = self.driver.inject_event(self.vm, self.vpid, &event) {
                eprintln!("[noircv vcpu {}] IRQ injection failed: {e}", self.vpid);
            }
        }

        proceed
    }

    /// Run one exit cycle: push dirty state, inject pending events, call
    /// into the driver, pull fresh state back, and dispatch the exit.
    ///
    /// `guard` is the caller's held main-loop lock. Per §5, the lock is
    /// dropped only around the blocking `run_vcpu` call itself; pre-run
    /// injection and exit dispatch (which touch shared device/interrupt
    /// state) run with it held. The (possibly reacquired) guard is handed
    /// back to the caller alongside the outcome.
    pub fn step<'a>(
        &mut self,
        lock: &'a StdMainLoopLock,
        guard: MutexGuard<'a, ()>,
        interrupts: &mut dyn InterruptController,
        io: &mut dyn PortIoBus,
        phys: &mut dyn PhysMemoryAccess,
        memory: &MemoryMapTracker<D>,
    ) -> (MutexGuard<'a, ()>, Result<StepOutcome, VcpuError>) {
        if !self.pre_run(interrupts) {
            self.state = VcpuState::Ready;
            return (guard, Ok(StepOutcome::ExternalEventPending));
        }

        self.state = VcpuState::Running;
        let refresh_tsc = !self.tsc_valid;

        drop(guard);
        let exit = self.driver.run_vcpu(self.vm, self.vpid);
        let guard = lock.lock();

        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => return (guard, Err(e.into())),
        };
        self.state = VcpuState::PostRun;

        let _ = self.regs.pull(&mut self.cpu, refresh_tsc);
        if refresh_tsc {
            self.tsc_valid = true;
        }

        self.interrupt_pending = exit.vp_state.interrupt_pending;
        self.interruptible = !exit.vp_state.interrupt_shadow;
        self.ready_for_pic_interrupt =
            self.interruptible && !self.interrupt_pending && (exit.rflags & RFLAGS_IF) != 0;

        let outcome = self.dispatch(exit, io, phys, memory);
        (guard, outcome)
    }

    fn dispatch(
        &mut self,
        exit: ExitContext,
        io: &mut dyn PortIoBus,
        phys: &mut dyn PhysMemoryAccess,
        memory: &MemoryMapTracker<D>,
    ) -> Result<StepOutcome, VcpuError> {
        match exit.intercept_code {
            InterceptCode::InvalidState => Err(VcpuError::InvalidState {
                vpid: self.vpid,
                rip: exit.rip,
            }),
            InterceptCode::ShutdownCondition => {
                eprintln!("[noircv vcpu {}] shutdown condition observed at rip {:#x}", self.vpid, exit.rip);
                Ok(StepOutcome::ShutdownRequested)
            }
            InterceptCode::Rescission => {
                self.state = VcpuState::Ready;
                Ok(StepOutcome::Rescinded)
            }
            InterceptCode::HltInstruction => {
                if let Err(e) = self.regs.edit_ip(exit.next_rip) {
                    eprintln!("[noircv vcpu {}] failed to advance rip past hlt: {e}", self.vpid);
                }
                self.cpu.rip = exit.next_rip;
                self.state = VcpuState::Ready;
                if self.interrupt_pending {
                    Ok(StepOutcome::Continue)
                } else {
                    Ok(StepOutcome::Halted)
                }
            }
            InterceptCode::IoInstruction => {
                self.state = VcpuState::Ready;
                if let ExitPayload::Io(ctx) = &exit.payload {
                    self.handle_io(
                        exit.rip,
                        ctx,
                        exit.next_rip,
                        exit.vp_state.paging_enabled,
                        io,
                        memory,
                    )?;
                }
                Ok(StepOutcome::Continue)
            }
            InterceptCode::MemoryAccess => {
                self.state = VcpuState::Ready;
                if let ExitPayload::MemoryAccess(ctx) = &exit.payload {
                    self.handle_memory_access(exit.rip, ctx, phys)?;
                }
                Ok(StepOutcome::Continue)
            }
            other => Err(self.guest_panic(exit.rip, format!("unhandled intercept {other:?}"))),
        }
    }

    fn handle_io(
        &mut self,
        rip: u64,
        ctx: &IoContext,
        next_rip: u64,
        paging_enabled: bool,
        io: &mut dyn PortIoBus,
        memory: &MemoryMapTracker<D>,
    ) -> Result<(), VcpuError> {
        let size = (ctx.operand_size as usize).clamp(1, 4);

        if !ctx.string {
            match ctx.direction {
                IoDirection::Out => {
                    let rax = self.cpu.gpr.rax.to_le_bytes();
                    io.io_write(ctx.port, &rax[..size]);
                }
                IoDirection::In => {
                    let mut buf = [0u8; 4];
                    io.io_read(ctx.port, &mut buf[..size]);
                    let mut rax = self.cpu.gpr.rax.to_le_bytes();
                    rax[..size].copy_from_slice(&buf[..size]);
                    self.cpu.gpr.rax = u64::from_le_bytes(rax);
                    if let Err(e) = self.regs.push_gpr(&self.cpu.gpr) {
                        eprintln!("[noircv vcpu {}] failed to post port-in result: {e}", self.vpid);
                    }
                }
            }
        } else {
            // Documented limitation (§1 Non-goals): string port I/O while
            // paging is enabled is not supported, since the GVA the guest
            // used cannot be walked through the page tables here.
            if paging_enabled {
                return Err(self.guest_panic(
                    rip,
                    "string port I/O with paging enabled is unsupported",
                ));
            }

            let mask = address_mask(ctx.address_width);
            let backward = self.cpu.rflags & (1 << 10) != 0;
            let step = if backward { -(size as i64) } else { size as i64 };
            let count = if ctx.repeat { self.cpu.gpr.rcx } else { 1 };
            let mut index = match ctx.direction {
                IoDirection::Out => ctx.rsi & mask,
                IoDirection::In => ctx.rdi & mask,
            };

            for _ in 0..count {
                let gva = ctx.segment.base.wrapping_add(index);
                let mut buf = [0u8; 4];
                match ctx.direction {
                    IoDirection::Out => {
                        memory.copy_physical(&mut buf[..size], gva, true);
                        io.io_write(ctx.port, &buf[..size]);
                    }
                    IoDirection::In => {
                        io.io_read(ctx.port, &mut buf[..size]);
                        memory.copy_physical(&mut buf[..size], gva, false);
                    }
                }
                index = index.wrapping_add_signed(step) & mask;
            }

            match ctx.direction {
                IoDirection::Out => self.cpu.gpr.rsi = index,
                IoDirection::In => self.cpu.gpr.rdi = index,
            }
            if ctx.repeat {
                self.cpu.gpr.rcx = 0;
            }
            if let Err(e) = self.regs.push_gpr(&self.cpu.gpr) {
                eprintln!("[noircv vcpu {}] failed to post string-io gpr update: {e}", self.vpid);
            }
        }

        if let Err(e) = self.regs.edit_ip(next_rip) {
            eprintln!("[noircv vcpu {}] failed to advance rip past io instruction: {e}", self.vpid);
        }
        self.cpu.rip = next_rip;
        Ok(())
    }

    /// MMIO handler (§4.E). `ctx.decoded` is required; an execute-class
    /// fault or an undecoded access both indicate a mapping/decode bug the
    /// guest cannot recover from.
    fn handle_memory_access(
        &self,
        rip: u64,
        ctx: &MemoryAccessContext,
        phys: &mut dyn PhysMemoryAccess,
    ) -> Result<(), VcpuError> {
        if ctx.execute {
            return Err(self.guest_panic(rip, "MMIO exit reported an execute-class fault"));
        }
        if !ctx.decoded {
            return Err(self.guest_panic(rip, "MMIO exit left the access undecoded"));
        }

        let size = (ctx.operand_size as usize).clamp(1, 8);
        let mut buf = [0u8; 8];
        if !ctx.write {
            phys.read_physical(ctx.gpa, &mut buf[..size]);
        }

        let info = EmulationInfo {
            gpa: ctx.gpa,
            instruction_bytes: ctx.instruction_bytes,
            fetched_bytes: ctx.fetched_bytes,
        };
        match self.driver.try_emulate(self.vm, self.vpid, &info, &mut buf[..size]) {
            Ok(s) if status::is_success(s) => {
                if ctx.write {
                    phys.write_physical(ctx.gpa, &buf[..size]);
                }
                Ok(())
            }
            Ok(s) if s == status::EMU_DUAL_MEMORY_OPERANDS => {
                Err(self.guest_panic(rip, "MMIO emulation touched two distinct memory operands"))
            }
            Ok(s) if s == status::EMU_UNKNOWN_INSTRUCTION => {
                Err(self.guest_panic(rip, "MMIO emulation could not decode the faulting instruction"))
            }
            Ok(s) => Err(self.guest_panic(rip, format!("MMIO emulation failed with status {s:#x}"))),
            Err(e) => Err(self.guest_panic(rip, format!("try_emulate transport error: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EmulationInfo as Emu;
    use crate::protocol::{
        AddrMapInfo, CrAccessContext, ExceptionContext, ExitContext, NoirStatus, RegisterType,
        SegReg, VpState,
    };
    use std::sync::Mutex;

    struct StubDriver {
        exits: Mutex<Vec<ExitContext>>,
    }

    impl CvmDriver for StubDriver {
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
            Ok(self.exits.lock().unwrap().remove(0))
        }
        fn rescind_vcpu(&self, _vm: VmHandle, _vpid: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn try_emulate(&self, _vm: VmHandle, _vpid: u32, _info: &Emu, _buf: &mut [u8]) -> Result<NoirStatus, DriverError> {
            Ok(status::SUCCESS)
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

    struct RecordingIo {
        writes: Vec<(u16, Vec<u8>)>,
        read_value: u32,
    }
    impl PortIoBus for RecordingIo {
        fn io_read(&mut self, _port: u16, data: &mut [u8]) {
            let bytes = self.read_value.to_le_bytes();
            data.copy_from_slice(&bytes[..data.len()]);
        }
        fn io_write(&mut self, port: u16, data: &[u8]) {
            self.writes.push((port, data.to_vec()));
        }
    }

    struct NullPhys;
    impl PhysMemoryAccess for NullPhys {
        fn read_physical(&self, _gpa: u64, _data: &mut [u8]) -> bool {
            true
        }
        fn write_physical(&self, _gpa: u64, _data: &[u8]) -> bool {
            true
        }
    }

    fn blank_exit(code: InterceptCode, payload: ExitPayload) -> ExitContext {
        ExitContext {
            intercept_code: code,
            payload,
            cs: SegReg::default(),
            rip: 0,
            rflags: 0,
            next_rip: 1,
            vp_state: VpState::default(),
        }
    }

    /// Drives one `step` with a fresh, uncontended main-loop lock so tests
    /// don't have to thread the lock themselves.
    fn step_test<D: CvmDriver>(
        vcpu: &mut Vcpu<D>,
        interrupts: &mut dyn InterruptController,
        io: &mut dyn PortIoBus,
        phys: &mut dyn PhysMemoryAccess,
        memory: &MemoryMapTracker<D>,
    ) -> Result<StepOutcome, VcpuError> {
        let lock = StdMainLoopLock::new();
        let guard = lock.lock();
        let (_guard, result) = vcpu.step(&lock, guard, interrupts, io, phys, memory);
        result
    }

    #[test]
    fn halt_transitions_to_ready_and_reports_halted() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(InterceptCode::HltInstruction, ExitPayload::None)]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let outcome = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        )
        .unwrap();
        assert_eq!(outcome, StepOutcome::Halted);
        assert_eq!(vcpu.state, VcpuState::Ready);
        assert_eq!(vcpu.cpu.rip, 1);
    }

    #[test]
    fn halt_with_interrupt_already_pending_does_not_halt() {
        let mut exit = blank_exit(InterceptCode::HltInstruction, ExitPayload::None);
        exit.vp_state.interrupt_pending = true;
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![exit]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let outcome = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        )
        .unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
    }

    #[test]
    fn invalid_state_is_surfaced_as_an_error() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(InterceptCode::InvalidState, ExitPayload::None)]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let result = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        );
        assert!(matches!(result, Err(VcpuError::InvalidState { .. })));
    }

    #[test]
    fn non_string_out_writes_low_bytes_of_rax() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(
                InterceptCode::IoInstruction,
                ExitPayload::Io(IoContext {
                    direction: IoDirection::Out,
                    string: false,
                    repeat: false,
                    operand_size: 1,
                    address_width: 8,
                    port: 0x3f8,
                    rax: 0,
                    rcx: 0,
                    rsi: 0,
                    rdi: 0,
                    segment: SegReg::default(),
                }),
            )]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        vcpu.cpu.gpr.rax = 0x41;
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let mut io = RecordingIo { writes: vec![], read_value: 0 };
        step_test(&mut vcpu, &mut NoIrq, &mut io, &mut NullPhys, &memory).unwrap();
        assert_eq!(io.writes, vec![(0x3f8, vec![0x41])]);
        assert_eq!(vcpu.cpu.rip, 1);
    }

    #[test]
    fn non_string_in_updates_rax() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(
                InterceptCode::IoInstruction,
                ExitPayload::Io(IoContext {
                    direction: IoDirection::In,
                    string: false,
                    repeat: false,
                    operand_size: 4,
                    address_width: 8,
                    port: 0x60,
                    rax: 0,
                    rcx: 0,
                    rsi: 0,
                    rdi: 0,
                    segment: SegReg::default(),
                }),
            )]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let mut io = RecordingIo { writes: vec![], read_value: 0xdead_beef };
        step_test(&mut vcpu, &mut NoIrq, &mut io, &mut NullPhys, &memory).unwrap();
        assert_eq!(vcpu.cpu.gpr.rax, 0xdead_beef);
    }

    #[test]
    fn unrecognized_intercept_is_a_guest_panic_not_silently_continued() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(
                InterceptCode::CrAccess,
                ExitPayload::CrAccess(CrAccessContext::default()),
            )]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let result = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        );
        assert!(matches!(result, Err(VcpuError::GuestPanic { .. })));
    }

    #[test]
    fn exception_payload_is_a_guest_panic() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(
                InterceptCode::Exception,
                ExitPayload::Exception(ExceptionContext::default()),
            )]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let result = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        );
        assert!(matches!(result, Err(VcpuError::GuestPanic { .. })));
    }

    #[test]
    fn mmio_execute_fault_is_a_guest_panic() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(
                InterceptCode::MemoryAccess,
                ExitPayload::MemoryAccess(MemoryAccessContext {
                    read: false,
                    write: false,
                    execute: true,
                    user: false,
                    fetched_bytes: 0,
                    instruction_bytes: [0; 15],
                    gpa: 0xfee0_0000,
                    gva: 0,
                    operand_size: 4,
                    decoded: true,
                }),
            )]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let result = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        );
        assert!(matches!(result, Err(VcpuError::GuestPanic { .. })));
    }

    #[test]
    fn mmio_undecoded_access_is_a_guest_panic() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(
                InterceptCode::MemoryAccess,
                ExitPayload::MemoryAccess(MemoryAccessContext {
                    read: true,
                    write: false,
                    execute: false,
                    user: false,
                    fetched_bytes: 0,
                    instruction_bytes: [0; 15],
                    gpa: 0xfee0_0020,
                    gva: 0,
                    operand_size: 4,
                    decoded: false,
                }),
            )]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let result = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        );
        assert!(matches!(result, Err(VcpuError::GuestPanic { .. })));
    }

    #[test]
    fn mmio_decoded_read_continues_and_sources_from_phys() {
        let driver = Arc::new(StubDriver {
            exits: Mutex::new(vec![blank_exit(
                InterceptCode::MemoryAccess,
                ExitPayload::MemoryAccess(MemoryAccessContext {
                    read: true,
                    write: false,
                    execute: false,
                    user: false,
                    fetched_bytes: 0,
                    instruction_bytes: [0; 15],
                    gpa: 0xfee0_0020,
                    gva: 0,
                    operand_size: 4,
                    decoded: true,
                }),
            )]),
        });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let outcome = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        )
        .unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
    }

    #[test]
    fn pending_init_forces_an_external_event_return_without_running() {
        let driver = Arc::new(StubDriver { exits: Mutex::new(vec![]) });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.activate();
        vcpu.request_init();
        let memory = MemoryMapTracker::new(vcpu_driver_clone(&vcpu), 1);
        let outcome = step_test(
            &mut vcpu,
            &mut NoIrq,
            &mut RecordingIo { writes: vec![], read_value: 0 },
            &mut NullPhys,
            &memory,
        )
        .unwrap();
        assert_eq!(outcome, StepOutcome::ExternalEventPending);
    }

    #[test]
    fn sync_post_reset_and_post_init_clear_dirty() {
        let driver = Arc::new(StubDriver { exits: Mutex::new(vec![]) });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.sync_pre_loadvm();
        assert!(vcpu.dirty);
        vcpu.sync_post_reset();
        assert!(!vcpu.dirty);
        vcpu.sync_pre_loadvm();
        vcpu.sync_post_init();
        assert!(!vcpu.dirty);
    }

    #[test]
    fn sync_state_is_a_no_op_pull_when_already_dirty() {
        let driver = Arc::new(StubDriver { exits: Mutex::new(vec![]) });
        let mut vcpu = Vcpu::new(driver, 1, 0);
        vcpu.sync_pre_loadvm();
        assert!(vcpu.dirty);
        vcpu.sync_state();
        assert!(vcpu.dirty, "sync_state must not pull when dirty is already set");
    }

    fn vcpu_driver_clone(vcpu: &Vcpu<StubDriver>) -> Arc<StubDriver> {
        vcpu.driver.clone()
    }
}
