//! Crate-wide error aggregation.
//!
//! Each of [`crate::driver`], [`crate::memory`], and [`crate::vcpu`] owns its
//! own `thiserror` enum; this type is only what a caller sitting above all
//! three needs to match on.

use thiserror::Error;

use crate::accel::AccelError;
use crate::driver::DriverError;
use crate::memory::MemoryError;
use crate::vcpu::VcpuError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("driver transport error: {0}")]
    Driver(#[from] DriverError),

    #[error("memory map error: {0}")]
    Memory(#[from] MemoryError),

    #[error("vcpu error: {0}")]
    Vcpu(#[from] VcpuError),

    #[error("accelerator lifecycle error: {0}")]
    Accel(#[from] AccelError),
}
