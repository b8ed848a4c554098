//! Register synchronization between the VMM's architectural CPU state and
//! the hypervisor's view/edit register protocol.
//!
//! This module owns translation, not storage: [`CpuState`] is the plain
//! struct an embedding VMM would otherwise keep on its own CPU object, and
//! [`RegisterSync`] moves bytes between it and the driver. The run loop
//! (`crate::vcpu`) owns the `dirty` flag and decides *when* to call
//! [`RegisterSync::push`]/[`RegisterSync::pull`]; this module only knows
//! *how*.
//!
//! # Sync levels
//!
//! Three push levels exist because not every register needs pushing on
//! every run: `Runtime` covers the common case, `Reset` is the same set
//! used after a CPU reset, and `Full` adds the TSC on top of `Runtime` for
//! `synchronize_post_init`.

use std::sync::Arc;

use thiserror::Error;

use crate::driver::{CvmDriver, DriverError};
use crate::protocol::{
    CrState, FxState, GprState, RegisterType, SegReg, SrState, VmHandle,
};

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Push level for [`RegisterSync::push`]. `Reset` and `Runtime` transfer the
/// identical register set; they're kept as distinct variants because they
/// fire from different call sites and a future driver revision could give
/// them different semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLevel {
    Runtime,
    Reset,
    Full,
}

/// A descriptor-table register: base address plus limit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DtableReg {
    pub base: u64,
    pub limit: u16,
}

/// The VMM's cached view of a segment register. `flags` embeds the same
/// 16-bit access-rights encoding the driver uses for [`SegReg::attributes`]
/// in its low 16 bits, leaving the high bits for VMM-local bookkeeping the
/// driver doesn't need to see.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CachedSegment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub flags: u32,
}

/// Translate the driver's wire segment into the VMM's cached form.
pub fn seg_v2q(wire: SegReg) -> CachedSegment {
    CachedSegment {
        selector: wire.selector,
        base: wire.base,
        limit: wire.limit,
        flags: wire.attributes as u32,
    }
}

/// Translate the VMM's cached segment back into the driver's wire form.
pub fn seg_q2v(cached: CachedSegment) -> SegReg {
    SegReg {
        selector: cached.selector,
        attributes: (cached.flags & 0xffff) as u16,
        limit: cached.limit,
        base: cached.base,
    }
}

/// Architectural x86 CPU state as this crate ferries it to/from the driver.
/// An embedding VMM typically keeps the authoritative copy on its own CPU
/// object; this struct is a stand-in used by tests and the demo binary.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CpuState {
    pub gpr: GprState,
    pub rflags: u64,
    pub rip: u64,
    pub cr: CrState,
    pub cr2: u64,
    pub dr: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,
    pub sr: SrState,
    pub fs: CachedSegment,
    pub gs: CachedSegment,
    pub kernel_gs_base: u64,
    pub tr: CachedSegment,
    pub ldtr: CachedSegment,
    pub gdtr: DtableReg,
    pub idtr: DtableReg,
    pub fx: FxState,
    /// Per-register "this ST(i) holds a live value" tag, in the VMM's own
    /// (non-inverted) convention.
    pub fx_tag_valid: [bool; 8],
    pub efer: u64,
    pub pat: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub xcr0: u64,
    pub tsc: u64,
}

/// Pack the VMM's per-register FX tag into the wire's inverted tag byte.
fn pack_fx_tag(valid: &[bool; 8]) -> u8 {
    let mut tag = 0u8;
    for (i, &v) in valid.iter().enumerate() {
        if !v {
            tag |= 1 << i;
        }
    }
    tag
}

/// Unpack the wire's inverted tag byte into the VMM's per-register tag.
fn unpack_fx_tag(wire_tag: u8) -> [bool; 8] {
    let mut valid = [false; 8];
    for (i, slot) in valid.iter_mut().enumerate() {
        *slot = wire_tag & (1 << i) == 0;
    }
    valid
}

fn to_wire_fx(state: &CpuState) -> FxState {
    let mut fx = state.fx;
    fx.ftw = pack_fx_tag(&state.fx_tag_valid);
    fx
}

fn from_wire_fx(wire: &FxState) -> (FxState, [bool; 8]) {
    (*wire, unpack_fx_tag(wire.ftw))
}

const MAX_REGISTER_BYTES: usize = 512;

/// Moves register bytes between a [`CpuState`] and the driver for one vCPU.
pub struct RegisterSync<D: CvmDriver> {
    driver: Arc<D>,
    vm: VmHandle,
    vpid: u32,
}

impl<D: CvmDriver> RegisterSync<D> {
    pub fn new(driver: Arc<D>, vm: VmHandle, vpid: u32) -> Self {
        Self { driver, vm, vpid }
    }

    fn view<T: Copy>(&self, reg: RegisterType, decode: impl FnOnce(&[u8]) -> T) -> Result<T, RegisterError> {
        let mut buf = [0u8; MAX_REGISTER_BYTES];
        let len = self.driver.view_register(self.vm, self.vpid, reg, &mut buf)?;
        Ok(decode(&buf[..len]))
    }

    fn edit(&self, reg: RegisterType, bytes: &[u8]) -> Result<(), RegisterError> {
        self.driver.edit_register(self.vm, self.vpid, reg, bytes)?;
        Ok(())
    }

    /// Push only RIP. Used by the run loop to advance past a retired
    /// HLT/IO instruction immediately, rather than waiting for the next
    /// full dirty-state push.
    pub fn edit_ip(&self, rip: u64) -> Result<(), RegisterError> {
        self.edit(RegisterType::Ip, &rip.to_le_bytes())
    }

    /// Push the whole GPR file. Used by the non-string port-IN handler to
    /// post an updated RAX without waiting for a full dirty-state push;
    /// the driver's GPR register type has no narrower granularity, so the
    /// whole struct goes over even though only RAX changed.
    pub fn push_gpr(&self, gpr: &GprState) -> Result<(), RegisterError> {
        self.edit(RegisterType::Gpr, as_bytes(gpr))
    }

    /// Pull every register the driver exposes into `state`. Also refreshes
    /// TSC when `refresh_tsc` is set (the caller invalidates its cached TSC
    /// on every transition to the running state).
    pub fn pull(&self, state: &mut CpuState, refresh_tsc: bool) -> Result<(), RegisterError> {
        macro_rules! log_and_ignore {
            ($r:expr) => {
                if let Err(e) = $r {
                    eprintln!("[noircv regs] pull failed for vcpu {}: {e}", self.vpid);
                }
            };
        }

        log_and_ignore!(self.pull_gpr(state));
        log_and_ignore!(self.pull_flags_ip(state));
        log_and_ignore!(self.pull_cr(state));
        log_and_ignore!(self.pull_dr(state));
        log_and_ignore!(self.pull_segments(state));
        log_and_ignore!(self.pull_fx(state));
        log_and_ignore!(self.pull_msrs(state));

        if refresh_tsc {
            log_and_ignore!(self.pull_tsc(state));
        }
        Ok(())
    }

    fn pull_gpr(&self, state: &mut CpuState) -> Result<(), RegisterError> {
        state.gpr = self.view(RegisterType::Gpr, |b| {
            let mut gpr = GprState::default();
            // SAFETY: the driver's GPR view is exactly size_of::<GprState>() bytes.
            if b.len() >= std::mem::size_of::<GprState>() {
                unsafe { std::ptr::copy_nonoverlapping(b.as_ptr(), &mut gpr as *mut _ as *mut u8, b.len().min(std::mem::size_of::<GprState>())) };
            }
            gpr
        })?;
        Ok(())
    }

    fn pull_flags_ip(&self, state: &mut CpuState) -> Result<(), RegisterError> {
        state.rflags = self.view(RegisterType::Flags, |b| read_u64(b))?;
        state.rip = self.view(RegisterType::Ip, |b| read_u64(b))?;
        Ok(())
    }

    fn pull_cr(&self, state: &mut CpuState) -> Result<(), RegisterError> {
        state.cr = self.view(RegisterType::Cr, |b| {
            let mut cr = CrState::default();
            if b.len() >= 24 {
                cr.cr0 = read_u64(&b[0..8]);
                cr.cr3 = read_u64(&b[8..16]);
                cr.cr4 = read_u64(&b[16..24]);
            }
            cr
        })?;
        state.cr2 = self.view(RegisterType::Cr2, |b| read_u64(b))?;
        state.xcr0 = self.view(RegisterType::Xcr0, |b| read_u64(b))?;
        Ok(())
    }

    fn pull_dr(&self, state: &mut CpuState) -> Result<(), RegisterError> {
        state.dr = self.view(RegisterType::Dr, |b| {
            let mut dr = [0u64; 4];
            for (i, slot) in dr.iter_mut().enumerate() {
                if b.len() >= (i + 1) * 8 {
                    *slot = read_u64(&b[i * 8..i * 8 + 8]);
                }
            }
            dr
        })?;
        let (dr6, dr7) = self.view(RegisterType::Dr67, |b| {
            if b.len() >= 16 {
                (read_u64(&b[0..8]), read_u64(&b[8..16]))
            } else {
                (0, 0)
            }
        })?;
        state.dr6 = dr6;
        state.dr7 = dr7;
        Ok(())
    }

    fn pull_segments(&self, state: &mut CpuState) -> Result<(), RegisterError> {
        state.sr = self.view(RegisterType::Sr, |b| {
            let mut sr = SrState::default();
            if b.len() >= std::mem::size_of::<SrState>() {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        b.as_ptr(),
                        &mut sr as *mut _ as *mut u8,
                        std::mem::size_of::<SrState>(),
                    )
                };
            }
            sr
        })?;

        let (fs, gs, kernel_gs_base) = self.view(RegisterType::Fg, |b| {
            let seg_size = std::mem::size_of::<SegReg>();
            let fs = decode_seg(&b[0..seg_size.min(b.len())]);
            let gs = if b.len() >= 2 * seg_size {
                decode_seg(&b[seg_size..2 * seg_size])
            } else {
                SegReg::default()
            };
            let kernel_gs_base = if b.len() >= 2 * seg_size + 8 {
                read_u64(&b[2 * seg_size..2 * seg_size + 8])
            } else {
                0
            };
            (fs, gs, kernel_gs_base)
        })?;
        state.fs = seg_v2q(fs);
        state.gs = seg_v2q(gs);
        state.kernel_gs_base = kernel_gs_base;

        let (tr, ldtr) = self.view(RegisterType::Lt, |b| {
            let seg_size = std::mem::size_of::<SegReg>();
            let tr = decode_seg(&b[0..seg_size.min(b.len())]);
            let ldtr = if b.len() >= 2 * seg_size {
                decode_seg(&b[seg_size..2 * seg_size])
            } else {
                SegReg::default()
            };
            (tr, ldtr)
        })?;
        state.tr = seg_v2q(tr);
        state.ldtr = seg_v2q(ldtr);

        let (gdtr, idtr) = self.view(RegisterType::Dt, |b| {
            if b.len() >= 20 {
                let gdtr = DtableReg {
                    base: read_u64(&b[0..8]),
                    limit: u16::from_le_bytes([b[8], b[9]]),
                };
                let idtr = DtableReg {
                    base: read_u64(&b[10..18]),
                    limit: u16::from_le_bytes([b[18], b[19]]),
                };
                (gdtr, idtr)
            } else {
                (DtableReg::default(), DtableReg::default())
            }
        })?;
        state.gdtr = gdtr;
        state.idtr = idtr;
        Ok(())
    }

    fn pull_fx(&self, state: &mut CpuState) -> Result<(), RegisterError> {
        let raw: FxState = self.view(RegisterType::Fx, |b| {
            let mut fx = FxState::default();
            let size = std::mem::size_of::<FxState>().min(b.len());
            unsafe { std::ptr::copy_nonoverlapping(b.as_ptr(), &mut fx as *mut _ as *mut u8, size) };
            fx
        })?;
        let (fx, tags) = from_wire_fx(&raw);
        state.fx = fx;
        state.fx_tag_valid = tags;
        Ok(())
    }

    fn pull_msrs(&self, state: &mut CpuState) -> Result<(), RegisterError> {
        state.efer = self.view(RegisterType::Efer, |b| read_u64(b))?;
        state.pat = self.view(RegisterType::Pat, |b| read_u64(b))?;
        let sysenter = self.view(RegisterType::SysenterMsr, |b| {
            if b.len() >= 24 {
                (read_u64(&b[0..8]), read_u64(&b[8..16]), read_u64(&b[16..24]))
            } else {
                (0, 0, 0)
            }
        })?;
        state.sysenter_cs = sysenter.0;
        state.sysenter_esp = sysenter.1;
        state.sysenter_eip = sysenter.2;

        let syscall = self.view(RegisterType::SyscallMsr, |b| {
            if b.len() >= 32 {
                (
                    read_u64(&b[0..8]),
                    read_u64(&b[8..16]),
                    read_u64(&b[16..24]),
                    read_u64(&b[24..32]),
                )
            } else {
                (0, 0, 0, 0)
            }
        })?;
        (state.star, state.lstar, state.cstar, state.sfmask) = syscall;
        Ok(())
    }

    fn pull_tsc(&self, state: &mut CpuState) -> Result<(), RegisterError> {
        state.tsc = self.view(RegisterType::Tsc, |b| read_u64(b))?;
        Ok(())
    }

    /// Push `state` to the driver at the given level. `Full` additionally
    /// pushes TSC; `Runtime` and `Reset` push the same register set.
    pub fn push(&self, state: &CpuState, level: SyncLevel) -> Result<(), RegisterError> {
        macro_rules! log_and_ignore {
            ($r:expr) => {
                if let Err(e) = $r {
                    eprintln!("[noircv regs] push failed for vcpu {}: {e}", self.vpid);
                }
            };
        }

        log_and_ignore!(self.edit(RegisterType::Gpr, as_bytes(&state.gpr)));
        log_and_ignore!(self.edit(RegisterType::Flags, &state.rflags.to_le_bytes()));
        log_and_ignore!(self.edit(RegisterType::Ip, &state.rip.to_le_bytes()));

        let mut cr_bytes = [0u8; 24];
        cr_bytes[0..8].copy_from_slice(&state.cr.cr0.to_le_bytes());
        cr_bytes[8..16].copy_from_slice(&state.cr.cr3.to_le_bytes());
        cr_bytes[16..24].copy_from_slice(&state.cr.cr4.to_le_bytes());
        log_and_ignore!(self.edit(RegisterType::Cr, &cr_bytes));
        log_and_ignore!(self.edit(RegisterType::Cr2, &state.cr2.to_le_bytes()));
        log_and_ignore!(self.edit(RegisterType::Xcr0, &state.xcr0.to_le_bytes()));

        let mut dr_bytes = [0u8; 32];
        for (i, v) in state.dr.iter().enumerate() {
            dr_bytes[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        log_and_ignore!(self.edit(RegisterType::Dr, &dr_bytes));
        let mut dr67 = [0u8; 16];
        dr67[0..8].copy_from_slice(&state.dr6.to_le_bytes());
        dr67[8..16].copy_from_slice(&state.dr7.to_le_bytes());
        log_and_ignore!(self.edit(RegisterType::Dr67, &dr67));

        log_and_ignore!(self.edit(RegisterType::Sr, as_bytes(&state.sr)));

        let mut fg = [0u8; 40];
        encode_seg(seg_q2v(state.fs), &mut fg[0..16]);
        encode_seg(seg_q2v(state.gs), &mut fg[16..32]);
        fg[32..40].copy_from_slice(&state.kernel_gs_base.to_le_bytes());
        log_and_ignore!(self.edit(RegisterType::Fg, &fg));

        let mut lt = [0u8; 32];
        encode_seg(seg_q2v(state.tr), &mut lt[0..16]);
        encode_seg(seg_q2v(state.ldtr), &mut lt[16..32]);
        log_and_ignore!(self.edit(RegisterType::Lt, &lt));

        let mut dt = [0u8; 20];
        dt[0..8].copy_from_slice(&state.gdtr.base.to_le_bytes());
        dt[8..10].copy_from_slice(&state.gdtr.limit.to_le_bytes());
        dt[10..18].copy_from_slice(&state.idtr.base.to_le_bytes());
        dt[18..20].copy_from_slice(&state.idtr.limit.to_le_bytes());
        log_and_ignore!(self.edit(RegisterType::Dt, &dt));

        let fx = to_wire_fx(state);
        log_and_ignore!(self.edit(RegisterType::Fx, as_bytes(&fx)));

        log_and_ignore!(self.edit(RegisterType::Efer, &state.efer.to_le_bytes()));
        log_and_ignore!(self.edit(RegisterType::Pat, &state.pat.to_le_bytes()));

        let mut sysenter = [0u8; 24];
        sysenter[0..8].copy_from_slice(&state.sysenter_cs.to_le_bytes());
        sysenter[8..16].copy_from_slice(&state.sysenter_esp.to_le_bytes());
        sysenter[16..24].copy_from_slice(&state.sysenter_eip.to_le_bytes());
        log_and_ignore!(self.edit(RegisterType::SysenterMsr, &sysenter));

        let mut syscall = [0u8; 32];
        syscall[0..8].copy_from_slice(&state.star.to_le_bytes());
        syscall[8..16].copy_from_slice(&state.lstar.to_le_bytes());
        syscall[16..24].copy_from_slice(&state.cstar.to_le_bytes());
        syscall[24..32].copy_from_slice(&state.sfmask.to_le_bytes());
        log_and_ignore!(self.edit(RegisterType::SyscallMsr, &syscall));

        if level == SyncLevel::Full {
            log_and_ignore!(self.edit(RegisterType::Tsc, &state.tsc.to_le_bytes()));
        }
        Ok(())
    }
}

fn read_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = b.len().min(8);
    buf[..len].copy_from_slice(&b[..len]);
    u64::from_le_bytes(buf)
}

fn decode_seg(b: &[u8]) -> SegReg {
    if b.len() < 16 {
        return SegReg::default();
    }
    SegReg {
        selector: u16::from_le_bytes([b[0], b[1]]),
        attributes: u16::from_le_bytes([b[2], b[3]]),
        limit: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
        base: read_u64(&b[8..16]),
    }
}

fn encode_seg(seg: SegReg, out: &mut [u8]) {
    out[0..2].copy_from_slice(&seg.selector.to_le_bytes());
    out[2..4].copy_from_slice(&seg.attributes.to_le_bytes());
    out[4..8].copy_from_slice(&seg.limit.to_le_bytes());
    out[8..16].copy_from_slice(&seg.base.to_le_bytes());
}

fn as_bytes<T: Copy>(v: &T) -> &[u8] {
    // SAFETY: all callers pass `#[repr(C)]` plain-old-data structs from
    // `crate::protocol`.
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_round_trips_through_cached_form() {
        let wire = SegReg {
            selector: 0x10,
            attributes: 0xc09b,
            limit: 0xffff_ffff,
            base: 0,
        };
        assert_eq!(seg_q2v(seg_v2q(wire)), wire);
    }

    #[test]
    fn fx_tag_round_trips() {
        let valid = [true, false, true, true, false, false, true, false];
        let wire = pack_fx_tag(&valid);
        assert_eq!(unpack_fx_tag(wire), valid);
    }

    #[test]
    fn fx_tag_all_valid_packs_to_zero() {
        assert_eq!(pack_fx_tag(&[true; 8]), 0);
    }

    #[test]
    fn fx_tag_all_empty_packs_to_all_ones() {
        assert_eq!(pack_fx_tag(&[false; 8]), 0xff);
    }

    #[test]
    fn seg_encode_decode_round_trip() {
        let seg = SegReg {
            selector: 0x33,
            attributes: 0xa09b,
            limit: 0x1234,
            base: 0xdead_beef_0000,
        };
        let mut buf = [0u8; 16];
        encode_seg(seg, &mut buf);
        assert_eq!(decode_seg(&buf), seg);
    }
}
