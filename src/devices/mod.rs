//! Demo device models used by the probe binary and by tests that exercise
//! the I/O and MMIO exit handlers. An embedding VMM supplies its own devices
//! through the [`crate::collab`] traits instead of these.

mod mmio;
mod serial;

pub use mmio::{LockedMmioBus, MmioBus, MmioDevice};
pub use serial::Serial;

/// I/O port range for COM1 serial port.
pub const SERIAL_COM1_BASE: u16 = 0x3f8;
pub const SERIAL_COM1_END: u16 = 0x3ff;
