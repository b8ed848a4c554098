//! Accelerator backend that plugs a VMM's vCPU loop into the NoirVisor CVM
//! hypervisor driver.
//!
//! The driver transport ([`driver`]) and wire types ([`protocol`]) are
//! portable; everything built on top of them ([`memory`], [`registers`],
//! [`vcpu`], [`accel`]) assumes a single-process, single-VM embedding, the
//! shape the demo binary under `src/bin` exercises end to end.

pub mod accel;
pub mod collab;
pub mod devices;
pub mod driver;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod registers;
pub mod vcpu;

pub use error::Error;
