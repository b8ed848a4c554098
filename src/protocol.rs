//! Wire types for the NoirVisor CVM driver protocol.
//!
//! Every struct in this module mirrors a fixed layout exchanged with the
//! driver over `ioctl()`. Field order and width must not change: the driver
//! reads and writes these bytes directly, there is no schema negotiation.
//!
//! # Status codes
//!
//! The driver reports success or failure as a 32-bit code. `0` is success,
//! everything else is a failure except the `0x4300_xxxx` emulation-hint
//! family, which callers are expected to recognize and act on rather than
//! treat as fatal.
//!
//! # Exit context
//!
//! [`ExitContext`] is a tagged union on the wire (`intercept_code` plus a C
//! union of payload structs). We represent the union as the [`ExitPayload`]
//! enum instead: the intercept code and the active payload variant can never
//! disagree, which a raw union doesn't give you for free.

/// Driver status codes.
///
/// Only `SUCCESS` and the `EMU_*` family are meaningful to ordinary control
/// flow; everything else starting at `0xC000_0000` is a failure family and
/// is surfaced to callers as [`crate::error::Error::Driver`].
pub mod status {
    pub type NoirStatus = u32;

    pub const SUCCESS: NoirStatus = 0;
    pub const UNSUCCESSFUL: NoirStatus = 0xC000_0000;
    pub const INSUFFICIENT_RESOURCES: NoirStatus = 0xC000_0001;
    pub const NOT_IMPLEMENTED: NoirStatus = 0xC000_0002;
    pub const UNKNOWN_PROCESSOR: NoirStatus = 0xC000_0003;
    pub const INVALID_PARAMETER: NoirStatus = 0xC000_0004;
    pub const HYPERVISION_ABSENT: NoirStatus = 0xC000_0005;
    pub const VCPU_ALREADY_CREATED: NoirStatus = 0xC000_0006;
    pub const BUFFER_TOO_SMALL: NoirStatus = 0xC000_0007;
    pub const VCPU_NOT_EXIST: NoirStatus = 0xC000_0008;

    /// The host decoded the faulting instruction but it touched two distinct
    /// memory operands; the caller must complete the emulation itself.
    pub const EMU_DUAL_MEMORY_OPERANDS: NoirStatus = 0x4300_0000;
    /// The host could not decode the faulting instruction at all.
    pub const EMU_UNKNOWN_INSTRUCTION: NoirStatus = 0x4300_0001;

    pub fn is_success(code: NoirStatus) -> bool {
        code == SUCCESS
    }

    pub fn is_emulation_hint(code: NoirStatus) -> bool {
        code == EMU_DUAL_MEMORY_OPERANDS || code == EMU_UNKNOWN_INSTRUCTION
    }
}

pub use status::NoirStatus;

/// Opaque VM handle returned by `create_vm`.
pub type VmHandle = u64;

/// Register categories addressable through `view_register`/`edit_register`.
///
/// `Lbr` and `Tsc` have no counterpart in the minimal driver header; they are
/// carried here because the full-sync level (§4.D) needs to pull TSC, and a
/// debug build benefits from being able to view the last-branch MSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegisterType {
    Gpr = 0,
    Flags = 1,
    Ip = 2,
    Cr = 3,
    Cr2 = 4,
    Dr = 5,
    Dr67 = 6,
    Sr = 7,
    Fg = 8,
    Dt = 9,
    Lt = 10,
    SyscallMsr = 11,
    SysenterMsr = 12,
    Cr8 = 13,
    Fx = 14,
    Xsave = 15,
    Xcr0 = 16,
    Efer = 17,
    Pat = 18,
    Lbr = 19,
    Tsc = 20,
}

/// Exit reasons reported by `run_vcpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InterceptCode {
    InvalidState = 0,
    ShutdownCondition = 1,
    MemoryAccess = 2,
    /// Resume from system-management mode. SMM is not modeled by this
    /// accelerator (§1 Non-goals); an `Rsm` exit falls through to the run
    /// loop's generic unhandled-intercept path.
    Rsm = 3,
    HltInstruction = 4,
    IoInstruction = 5,
    CpuidInstruction = 6,
    RdmsrInstruction = 7,
    WrmsrInstruction = 8,
    CrAccess = 9,
    DrAccess = 10,
    Hypercall = 11,
    Exception = 12,
    Rescission = 13,
    InterruptWindow = 14,
    SchedulerExit = 0x8000_0000,
    SchedulerPause = 0x8000_0001,
}

impl InterceptCode {
    /// Decode a raw wire value. Unrecognized codes are treated as invalid
    /// state rather than panicking the translation layer itself; the run
    /// loop is what decides whether an unknown exit is fatal.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::InvalidState,
            1 => Self::ShutdownCondition,
            2 => Self::MemoryAccess,
            3 => Self::Rsm,
            4 => Self::HltInstruction,
            5 => Self::IoInstruction,
            6 => Self::CpuidInstruction,
            7 => Self::RdmsrInstruction,
            8 => Self::WrmsrInstruction,
            9 => Self::CrAccess,
            10 => Self::DrAccess,
            11 => Self::Hypercall,
            12 => Self::Exception,
            13 => Self::Rescission,
            14 => Self::InterruptWindow,
            0x8000_0000 => Self::SchedulerExit,
            0x8000_0001 => Self::SchedulerPause,
            _ => return None,
        })
    }
}

/// General-purpose register file.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct GprState {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct CrState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
}

/// A single segment register as the driver reports it: selector, packed
/// access-rights byte pair, limit, base. Round-tripping this through the
/// VMM's own cached segment form (a 16-bit attributes word embedded in a
/// larger flags field) must be loss-free; see `registers::seg_v2q`/`seg_q2v`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SegReg {
    pub selector: u16,
    pub attributes: u16,
    pub limit: u32,
    pub base: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct SrState {
    pub es: SegReg,
    pub cs: SegReg,
    pub ss: SegReg,
    pub ds: SegReg,
}

/// Guest-physical page memory type, as stored in `AddrMapInfo::attributes`.
pub mod memtype {
    pub const UC: u32 = 0;
    pub const WC: u32 = 1;
    pub const WT: u32 = 4;
    pub const WP: u32 = 5;
    pub const WB: u32 = 6;
    pub const UCM: u32 = 7;
}

/// Mapping descriptor for `set_mapping`. `attributes` is a packed bitfield;
/// use [`AddrMapInfo::pack_attributes`] rather than hand-assembling it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct AddrMapInfo {
    pub gpa: u64,
    pub hva: u64,
    pub number_of_pages: u32,
    pub attributes: u32,
}

impl AddrMapInfo {
    /// Pack `{present, write, execute, user, caching, page_size}` into the
    /// wire attributes word. `page_size` is `0` for 4 KiB pages, matching
    /// every caller in this crate (the driver does not expose large-page
    /// mappings through this interface).
    #[allow(clippy::too_many_arguments)]
    pub fn pack_attributes(
        present: bool,
        write: bool,
        execute: bool,
        user: bool,
        caching: u32,
        page_size: u32,
    ) -> u32 {
        (present as u32)
            | (write as u32) << 1
            | (execute as u32) << 2
            | (user as u32) << 3
            | (caching & 0x7) << 4
            | (page_size & 0x3) << 7
    }
}

/// vCPU-level tunables set through `edit_register(Fg, ...)` style calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VcpuOptionType {
    GuestVpOptions = 0,
    ExceptionBitmap = 1,
    SchedulingPriority = 2,
}

/// The 512-byte FXSAVE-format image exchanged for `RegisterType::Fx`.
///
/// The tag word on the wire is the logical inverse of the VMM's per-register
/// "valid" tag convention: wire bit `i` is `1` when the VMM considers
/// register `i` *empty*. [`crate::registers`] is responsible for the
/// inversion; this struct only carries the bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct FxState {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u8,
    pub reserved0: u8,
    pub fop: u16,
    pub fpu_ip: u32,
    pub fpu_cs: u16,
    pub reserved1: u16,
    pub fpu_dp: u32,
    pub fpu_ds: u16,
    pub reserved2: u16,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    /// ST(0..7), each stored in a 16-byte slot (10 bytes of data, 6 padding).
    pub st_mm: [[u8; 16]; 8],
    /// XMM0..15, 16 bytes each.
    pub xmm: [[u8; 16]; 16],
    pub reserved3: [u64; 6],
    pub available: [u64; 6],
}

impl Default for FxState {
    fn default() -> Self {
        Self {
            fcw: 0x37f,
            fsw: 0,
            ftw: 0,
            reserved0: 0,
            fop: 0,
            fpu_ip: 0,
            fpu_cs: 0,
            reserved1: 0,
            fpu_dp: 0,
            fpu_ds: 0,
            reserved2: 0,
            mxcsr: 0x1f80,
            mxcsr_mask: 0,
            st_mm: [[0; 16]; 8],
            xmm: [[0; 16]; 16],
            reserved3: [0; 6],
            available: [0; 6],
        }
    }
}

/// Payload for a `CrAccess` exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrAccessContext {
    pub cr_num: u8,
    pub gpr_num: u8,
    pub mov: bool,
    pub write: bool,
}

/// Payload for a `DrAccess` exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrAccessContext {
    pub dr_num: u8,
    pub gpr_num: u8,
    pub write: bool,
}

/// Payload for an `Exception` exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionContext {
    pub vector: u8,
    pub error_code_valid: bool,
    pub error_code: u32,
    pub page_fault_address: u64,
    pub fetched_bytes: u8,
    pub instruction_bytes: [u8; 15],
}

/// Direction of an `IoInstruction` access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// Payload for an `IoInstruction` exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoContext {
    pub direction: IoDirection,
    pub string: bool,
    pub repeat: bool,
    /// Operand size in bytes: 1, 2, or 4.
    pub operand_size: u8,
    /// Effective address width in bytes for string operations: 2, 4, or 8.
    pub address_width: u8,
    pub port: u16,
    pub rax: u64,
    pub rcx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub segment: SegReg,
}

/// Payload for `RdmsrInstruction`/`WrmsrInstruction` exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MsrContext {
    pub eax: u32,
    pub edx: u32,
    pub ecx: u32,
}

/// Payload for a `MemoryAccess` (MMIO) exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccessContext {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
    pub fetched_bytes: u8,
    pub instruction_bytes: [u8; 15],
    pub gpa: u64,
    pub gva: u64,
    pub operand_size: u16,
    pub decoded: bool,
}

/// Payload for a `CpuidInstruction` exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidContext {
    pub eax: u32,
    pub ecx: u32,
}

/// The union payload of an exit context, discriminated by `InterceptCode`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitPayload {
    None,
    CrAccess(CrAccessContext),
    DrAccess(DrAccessContext),
    Exception(ExceptionContext),
    Io(IoContext),
    Msr(MsrContext),
    MemoryAccess(MemoryAccessContext),
    Cpuid(CpuidContext),
}

/// `vp_state` bitfield of [`ExitContext`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VpState {
    pub cpl: u8,
    pub protected_mode: bool,
    pub long_mode: bool,
    pub interrupt_shadow: bool,
    pub instruction_length: u8,
    pub interrupt_pending: bool,
    pub paging_enabled: bool,
    pub pae_enabled: bool,
}

/// Full exit report handed back by `run_vcpu`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitContext {
    pub intercept_code: InterceptCode,
    pub payload: ExitPayload,
    pub cs: SegReg,
    pub rip: u64,
    pub rflags: u64,
    pub next_rip: u64,
    pub vp_state: VpState,
}

/// Interrupt/exception vector types for `inject_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    ExternalInterrupt = 0,
    Nmi = 2,
    HardwareException = 3,
    SoftwareException = 6,
}

/// Packed injection request. `priority` only matters for external
/// interrupts sourced from a PIC with priority rotation; other event types
/// leave it `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInjection {
    pub vector: u8,
    pub event_type: EventType,
    pub error_code_valid: bool,
    pub priority: u8,
    pub error_code: u32,
}
