//! Linux ioctl transport for the NoirVisor CVM device.
//!
//! Command codes are consecutive integers starting at an accelerator
//! assigned base. Each wrapper below is a single `ioctl(2)` call generated
//! by `nix::ioctl_readwrite!`, the same shape the KVM-backed predecessor of
//! this module used for `/dev/kvm`.

use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::os::unix::io::AsRawFd;

use nix::{ioctl_readwrite, Error as NixError};

use crate::driver::{CvmDriver, DriverError, EmulationInfo};
use crate::protocol::{
    AddrMapInfo, EventInjection, ExitContext, ExitPayload, InterceptCode,
    IoContext, IoDirection, MemoryAccessContext, NoirStatus, RegisterType, SegReg, VmHandle,
    VpState,
};

const NOIRCV_IOCTL_MAGIC: u8 = b'n';

/// Widest register payload this crate transfers: the 512-byte FXSAVE image.
const MAX_REGISTER_BYTES: usize = 512;

#[repr(C)]
struct CreateVmRequest {
    status: NoirStatus,
    vm: VmHandle,
}

#[repr(C)]
struct VmOnlyRequest {
    status: NoirStatus,
    vm: VmHandle,
}

#[repr(C)]
struct VcpuRequest {
    status: NoirStatus,
    vm: VmHandle,
    vpid: u32,
}

#[repr(C)]
struct SetMappingRequest {
    status: NoirStatus,
    vm: VmHandle,
    map: AddrMapInfo,
}

#[repr(C)]
struct InjectEventRequest {
    status: NoirStatus,
    vm: VmHandle,
    vpid: u32,
    vector: u8,
    event_type: u8,
    error_code_valid: u8,
    priority: u8,
    error_code: u32,
}

#[repr(C)]
struct RegisterRequest {
    status: NoirStatus,
    vm: VmHandle,
    vpid: u32,
    reg_type: u32,
    len: u32,
    buffer: [u8; MAX_REGISTER_BYTES],
}

#[repr(C)]
struct RunVcpuRequest {
    status: NoirStatus,
    vm: VmHandle,
    vpid: u32,
    exit: RawExitContext,
}

/// Widest operand this crate moves through `try_emulate`: an 8-byte GPR-sized
/// MMIO access.
const MAX_EMULATE_BYTES: usize = 8;

#[repr(C)]
struct TryEmulateRequest {
    status: NoirStatus,
    vm: VmHandle,
    vpid: u32,
    gpa: u64,
    fetched_bytes: u8,
    instruction_bytes: [u8; 15],
    len: u32,
    buffer: [u8; MAX_EMULATE_BYTES],
}

/// Flattened wire form of [`ExitContext`]: ioctl request/response structs
/// must be `#[repr(C)]` with plain fields, so the tagged-union translation
/// this crate otherwise does with [`ExitPayload`] happens at the edge here.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawExitContext {
    intercept_code: u32,
    payload: RawExitPayload,
    cs_selector: u16,
    cs_attributes: u16,
    cs_limit: u32,
    cs_base: u64,
    rip: u64,
    rflags: u64,
    next_rip: u64,
    vp_state: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawExitPayload {
    io_direction: u8,
    io_string: u8,
    io_repeat: u8,
    io_operand_size: u8,
    io_address_width: u8,
    io_port: u16,
    io_rax: u64,
    io_rcx: u64,
    io_rsi: u64,
    io_rdi: u64,
    io_segment: SegReg,
    mem_access: u8,
    mem_fetched_bytes: u8,
    mem_instruction_bytes: [u8; 15],
    mem_gpa: u64,
    mem_gva: u64,
    mem_operand_size: u16,
    mem_decoded: u8,
}

impl Default for RawExitContext {
    fn default() -> Self {
        Self {
            intercept_code: 0,
            payload: RawExitPayload {
                io_direction: 0,
                io_string: 0,
                io_repeat: 0,
                io_operand_size: 0,
                io_address_width: 0,
                io_port: 0,
                io_rax: 0,
                io_rcx: 0,
                io_rsi: 0,
                io_rdi: 0,
                io_segment: SegReg::default(),
                mem_access: 0,
                mem_fetched_bytes: 0,
                mem_instruction_bytes: [0; 15],
                mem_gpa: 0,
                mem_gva: 0,
                mem_operand_size: 0,
                mem_decoded: 0,
            },
            cs_selector: 0,
            cs_attributes: 0,
            cs_limit: 0,
            cs_base: 0,
            rip: 0,
            rflags: 0,
            next_rip: 0,
            vp_state: 0,
        }
    }
}

fn decode_exit(raw: &RawExitContext) -> ExitContext {
    let intercept_code = InterceptCode::from_raw(raw.intercept_code).unwrap_or(InterceptCode::InvalidState);

    let payload = match intercept_code {
        InterceptCode::IoInstruction => ExitPayload::Io(IoContext {
            direction: if raw.payload.io_direction == 0 {
                IoDirection::In
            } else {
                IoDirection::Out
            },
            string: raw.payload.io_string != 0,
            repeat: raw.payload.io_repeat != 0,
            operand_size: raw.payload.io_operand_size,
            address_width: raw.payload.io_address_width,
            port: raw.payload.io_port,
            rax: raw.payload.io_rax,
            rcx: raw.payload.io_rcx,
            rsi: raw.payload.io_rsi,
            rdi: raw.payload.io_rdi,
            segment: raw.payload.io_segment,
        }),
        InterceptCode::MemoryAccess => ExitPayload::MemoryAccess(MemoryAccessContext {
            read: raw.payload.mem_access & 0x1 != 0,
            write: raw.payload.mem_access & 0x2 != 0,
            execute: raw.payload.mem_access & 0x4 != 0,
            user: raw.payload.mem_access & 0x8 != 0,
            fetched_bytes: raw.payload.mem_fetched_bytes,
            instruction_bytes: raw.payload.mem_instruction_bytes,
            gpa: raw.payload.mem_gpa,
            gva: raw.payload.mem_gva,
            operand_size: raw.payload.mem_operand_size,
            decoded: raw.payload.mem_decoded != 0,
        }),
        _ => ExitPayload::None,
    };

    let vp = raw.vp_state;
    ExitContext {
        intercept_code,
        payload,
        cs: SegReg {
            selector: raw.cs_selector,
            attributes: raw.cs_attributes,
            limit: raw.cs_limit,
            base: raw.cs_base,
        },
        rip: raw.rip,
        rflags: raw.rflags,
        next_rip: raw.next_rip,
        vp_state: VpState {
            cpl: (vp & 0x3) as u8,
            protected_mode: vp & (1 << 2) != 0,
            long_mode: vp & (1 << 3) != 0,
            interrupt_shadow: vp & (1 << 4) != 0,
            instruction_length: ((vp >> 5) & 0xf) as u8,
            interrupt_pending: vp & (1 << 9) != 0,
            paging_enabled: vp & (1 << 10) != 0,
            pae_enabled: vp & (1 << 11) != 0,
        },
    }
}

ioctl_readwrite!(ioctl_create_vm, NOIRCV_IOCTL_MAGIC, 1, CreateVmRequest);
ioctl_readwrite!(ioctl_delete_vm, NOIRCV_IOCTL_MAGIC, 2, VmOnlyRequest);
ioctl_readwrite!(ioctl_create_vcpu, NOIRCV_IOCTL_MAGIC, 3, VcpuRequest);
ioctl_readwrite!(ioctl_delete_vcpu, NOIRCV_IOCTL_MAGIC, 4, VcpuRequest);
ioctl_readwrite!(ioctl_set_mapping, NOIRCV_IOCTL_MAGIC, 5, SetMappingRequest);
ioctl_readwrite!(ioctl_inject_event, NOIRCV_IOCTL_MAGIC, 6, InjectEventRequest);
ioctl_readwrite!(ioctl_view_register, NOIRCV_IOCTL_MAGIC, 7, RegisterRequest);
ioctl_readwrite!(ioctl_edit_register, NOIRCV_IOCTL_MAGIC, 8, RegisterRequest);
ioctl_readwrite!(ioctl_run_vcpu, NOIRCV_IOCTL_MAGIC, 9, RunVcpuRequest);
ioctl_readwrite!(ioctl_rescind_vcpu, NOIRCV_IOCTL_MAGIC, 10, VcpuRequest);
ioctl_readwrite!(ioctl_try_emulate, NOIRCV_IOCTL_MAGIC, 11, TryEmulateRequest);

/// Default device path for the NoirVisor CVM control device.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/noirvisor";

/// Ioctl-backed [`CvmDriver`] implementation.
pub struct IoctlDriver {
    device: File,
}

fn to_driver_error(op: &'static str, e: NixError) -> DriverError {
    DriverError::Ioctl {
        op,
        source: std::io::Error::from(e),
    }
}

impl IoctlDriver {
    pub fn open(path: &str) -> Result<Self, DriverError> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DriverError::Open {
                path: path.to_string(),
                source,
            })?;
        eprintln!("[noircv] opened control device {path}");
        Ok(Self { device })
    }
}

impl CvmDriver for IoctlDriver {
    fn create_vm(&self) -> Result<VmHandle, DriverError> {
        let mut req = CreateVmRequest { status: 0, vm: 0 };
        unsafe { ioctl_create_vm(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("create_vm", e))?;
        DriverError::check_status("create_vm", req.status)?;
        Ok(req.vm)
    }

    fn delete_vm(&self, vm: VmHandle) -> Result<(), DriverError> {
        let mut req = VmOnlyRequest { status: 0, vm };
        unsafe { ioctl_delete_vm(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("delete_vm", e))?;
        DriverError::check_status("delete_vm", req.status)
    }

    fn create_vcpu(&self, vm: VmHandle, vpid: u32) -> Result<(), DriverError> {
        let mut req = VcpuRequest { status: 0, vm, vpid };
        unsafe { ioctl_create_vcpu(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("create_vcpu", e))?;
        DriverError::check_status("create_vcpu", req.status)
    }

    fn delete_vcpu(&self, vm: VmHandle, vpid: u32) -> Result<(), DriverError> {
        let mut req = VcpuRequest { status: 0, vm, vpid };
        unsafe { ioctl_delete_vcpu(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("delete_vcpu", e))?;
        DriverError::check_status("delete_vcpu", req.status)
    }

    fn set_mapping(&self, vm: VmHandle, map: &AddrMapInfo) -> Result<(), DriverError> {
        let mut req = SetMappingRequest {
            status: 0,
            vm,
            map: *map,
        };
        unsafe { ioctl_set_mapping(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("set_mapping", e))?;
        DriverError::check_status("set_mapping", req.status)
    }

    fn inject_event(
        &self,
        vm: VmHandle,
        vpid: u32,
        event: &EventInjection,
    ) -> Result<(), DriverError> {
        let mut req = InjectEventRequest {
            status: 0,
            vm,
            vpid,
            vector: event.vector,
            event_type: event.event_type as u8,
            error_code_valid: event.error_code_valid as u8,
            priority: event.priority,
            error_code: event.error_code,
        };
        unsafe { ioctl_inject_event(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("inject_event", e))?;
        DriverError::check_status("inject_event", req.status)
    }

    fn view_register(
        &self,
        vm: VmHandle,
        vpid: u32,
        reg: RegisterType,
        buf: &mut [u8],
    ) -> Result<usize, DriverError> {
        let mut req = RegisterRequest {
            status: 0,
            vm,
            vpid,
            reg_type: reg as u32,
            len: 0,
            buffer: [0u8; MAX_REGISTER_BYTES],
        };
        unsafe { ioctl_view_register(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("view_register", e))?;
        DriverError::check_status("view_register", req.status)?;
        let len = req.len as usize;
        if len > buf.len() {
            return Err(DriverError::BufferTooSmall {
                reg,
                need: len,
                have: buf.len(),
            });
        }
        buf[..len].copy_from_slice(&req.buffer[..len]);
        Ok(len)
    }

    fn edit_register(
        &self,
        vm: VmHandle,
        vpid: u32,
        reg: RegisterType,
        buf: &[u8],
    ) -> Result<(), DriverError> {
        debug_assert!(buf.len() <= MAX_REGISTER_BYTES);
        let mut req = RegisterRequest {
            status: 0,
            vm,
            vpid,
            reg_type: reg as u32,
            len: buf.len() as u32,
            buffer: [0u8; MAX_REGISTER_BYTES],
        };
        req.buffer[..buf.len()].copy_from_slice(buf);
        unsafe { ioctl_edit_register(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("edit_register", e))?;
        DriverError::check_status("edit_register", req.status)
    }

    fn run_vcpu(&self, vm: VmHandle, vpid: u32) -> Result<ExitContext, DriverError> {
        loop {
            let mut req = RunVcpuRequest {
                status: 0,
                vm,
                vpid,
                exit: RawExitContext::default(),
            };
            unsafe { ioctl_run_vcpu(self.device.as_raw_fd(), &mut req) }
                .map_err(|e| to_driver_error("run_vcpu", e))?;
            DriverError::check_status("run_vcpu", req.status)?;

            let exit = decode_exit(&req.exit);
            // The driver scheduler occasionally yields the vCPU back to us
            // with no real exit to report; retry transparently so callers
            // never observe a scheduler yield as an exit.
            if exit.intercept_code == InterceptCode::SchedulerExit {
                continue;
            }
            return Ok(exit);
        }
    }

    fn rescind_vcpu(&self, vm: VmHandle, vpid: u32) -> Result<(), DriverError> {
        let mut req = VcpuRequest { status: 0, vm, vpid };
        unsafe { ioctl_rescind_vcpu(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("rescind_vcpu", e))?;
        DriverError::check_status("rescind_vcpu", req.status)
    }

    fn try_emulate(
        &self,
        vm: VmHandle,
        vpid: u32,
        info: &EmulationInfo,
        buf: &mut [u8],
    ) -> Result<NoirStatus, DriverError> {
        debug_assert!(buf.len() <= MAX_EMULATE_BYTES);
        let mut req = TryEmulateRequest {
            status: 0,
            vm,
            vpid,
            gpa: info.gpa,
            fetched_bytes: info.fetched_bytes,
            instruction_bytes: info.instruction_bytes,
            len: buf.len() as u32,
            buffer: [0u8; MAX_EMULATE_BYTES],
        };
        req.buffer[..buf.len()].copy_from_slice(buf);
        unsafe { ioctl_try_emulate(self.device.as_raw_fd(), &mut req) }
            .map_err(|e| to_driver_error("try_emulate", e))?;
        buf.copy_from_slice(&req.buffer[..buf.len()]);
        Ok(req.status)
    }
}

const _: () = assert!(size_of::<RegisterRequest>() >= MAX_REGISTER_BYTES);
