//! Transport to the NoirVisor CVM control device.
//!
//! The [`CvmDriver`] trait is the thin boundary between this crate's
//! vCPU/memory logic and the actual host kernel driver. Every method is one
//! `ioctl()` round-trip: a request struct goes in, a status code and
//! (sometimes) a response payload come out. The trait exists so the run
//! loop, synchronizer, and memory tracker can be exercised against a fake
//! driver in tests without opening a real device.
//!
//! The concrete implementation lives in [`ioctl`]; the control device and
//! its wire layout are both Linux/x86_64-specific.

mod ioctl;

pub use ioctl::{IoctlDriver, DEFAULT_DEVICE_PATH};

use thiserror::Error;

use crate::protocol::{AddrMapInfo, EventInjection, ExitContext, NoirStatus, RegisterType, VmHandle};

/// Errors surfaced by the driver transport.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ioctl failed for {op}: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} returned status {status:#x}")]
    Status { op: &'static str, status: NoirStatus },

    #[error("register buffer too small for {reg:?}: need {need} bytes, have {have}")]
    BufferTooSmall {
        reg: RegisterType,
        need: usize,
        have: usize,
    },
}

impl DriverError {
    pub(crate) fn check_status(op: &'static str, status: NoirStatus) -> Result<(), Self> {
        if crate::protocol::status::is_success(status) {
            Ok(())
        } else {
            Err(Self::Status { op, status })
        }
    }
}

/// Information the driver needs to attempt in-kernel instruction emulation
/// for a decoded MMIO access (`try_emulate`).
#[derive(Debug, Clone, Copy)]
pub struct EmulationInfo {
    pub gpa: u64,
    pub instruction_bytes: [u8; 15],
    pub fetched_bytes: u8,
}

/// Operations exposed by the NoirVisor CVM device.
///
/// Implementations must honor the retry contract documented on
/// [`CvmDriver::run_vcpu`]: callers should never observe `SchedulerExit`.
pub trait CvmDriver {
    fn create_vm(&self) -> Result<VmHandle, DriverError>;
    fn delete_vm(&self, vm: VmHandle) -> Result<(), DriverError>;

    fn create_vcpu(&self, vm: VmHandle, vpid: u32) -> Result<(), DriverError>;
    fn delete_vcpu(&self, vm: VmHandle, vpid: u32) -> Result<(), DriverError>;

    fn set_mapping(&self, vm: VmHandle, map: &AddrMapInfo) -> Result<(), DriverError>;

    fn inject_event(
        &self,
        vm: VmHandle,
        vpid: u32,
        event: &EventInjection,
    ) -> Result<(), DriverError>;

    /// Read `reg` into `buf`. `buf` must be sized for the widest register
    /// this crate transfers (`FxState`, 512 bytes); callers use a
    /// stack-allocated buffer, never a heap `Vec`, to keep this call
    /// allocation-free.
    fn view_register(
        &self,
        vm: VmHandle,
        vpid: u32,
        reg: RegisterType,
        buf: &mut [u8],
    ) -> Result<usize, DriverError>;

    fn edit_register(
        &self,
        vm: VmHandle,
        vpid: u32,
        reg: RegisterType,
        buf: &[u8],
    ) -> Result<(), DriverError>;

    /// Run the vCPU until the next exit. Implementations transparently
    /// re-issue the call when the driver reports `SchedulerExit` so callers
    /// never have to special-case a scheduler yield.
    fn run_vcpu(&self, vm: VmHandle, vpid: u32) -> Result<ExitContext, DriverError>;

    /// Cancel a blocked `run_vcpu` on another thread.
    fn rescind_vcpu(&self, vm: VmHandle, vpid: u32) -> Result<(), DriverError>;

    /// Ask the host to decode and complete a faulting MMIO access.
    ///
    /// `buf` carries the operand: pre-filled by the caller from host
    /// physical memory on a read, to be filled by the host on return for a
    /// write. This crate threads a buffer alongside `emu_info`, the same
    /// shape `view_register`/`edit_register` already use, because
    /// `try_emulate` has no other channel to move the operand value.
    fn try_emulate(
        &self,
        vm: VmHandle,
        vpid: u32,
        info: &EmulationInfo,
        buf: &mut [u8],
    ) -> Result<NoirStatus, DriverError>;
}
