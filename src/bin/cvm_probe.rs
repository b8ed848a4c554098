//! Demo binary: opens the NoirVisor CVM control device, maps a block of
//! guest RAM, optionally loads a flat image at guest-physical address 0,
//! and runs one or more vCPUs until they halt or the device signals
//! shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use noircv_accel::accel::Accelerator;
use noircv_accel::collab::InterruptController;
use noircv_accel::devices::{LockedMmioBus, MmioBus, Serial};
use noircv_accel::driver::{IoctlDriver, DEFAULT_DEVICE_PATH};
use noircv_accel::memory::GuestMemory;

#[derive(Parser, Debug)]
#[command(name = "cvm-probe", about = "Drive a NoirVisor CVM guest for testing")]
struct Args {
    /// Path to the NoirVisor CVM control device.
    #[arg(long, default_value = DEFAULT_DEVICE_PATH)]
    device: String,

    /// Guest RAM size in mebibytes.
    #[arg(long, default_value_t = 128)]
    memory_mb: u64,

    /// Number of vCPUs to create.
    #[arg(long, default_value_t = 1)]
    vcpus: u32,

    /// Flat binary loaded at guest-physical address 0, if given.
    #[arg(long)]
    boot_image: Option<PathBuf>,

    /// How long to let the guest run before tearing everything down.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let driver = IoctlDriver::open(&args.device)?;
    let accel = Arc::new(Accelerator::init("noircv", driver)?);

    let memory = GuestMemory::new(args.memory_mb * 1024 * 1024)?;
    if let Some(path) = &args.boot_image {
        let image = std::fs::read(path)?;
        memory.write(0, &image)?;
        eprintln!("[noircv] loaded {} bytes at gpa 0 from {}", image.len(), path.display());
    }
    let (host_va, size) = memory.as_raw_parts();
    accel.register_memory_region(0, size, host_va, false);
    std::mem::forget(memory); // host mapping must outlive the accelerator

    for index in 0..args.vcpus {
        accel.spawn_vcpu(index, move || (NoIrq, Serial::new(), LockedMmioBus::new(MmioBus::new())))?;
    }

    std::thread::sleep(Duration::from_secs(args.seconds));

    for index in 0..args.vcpus {
        accel.unplug_vcpu(index);
    }

    Ok(())
}
