//! Single-instruction x86-64 emitters.
//!
//! Each function writes exactly one instruction (two for the composite
//! push/pop forms) into the token stream. No state is tracked here; the
//! callers have already arranged register liveness. Destinations are
//! always written at 64-bit width so narrower loads zero- or sign-extend
//! as named.

use crate::regs::Reg;
use crate::token::TokenOut;

fn hw(reg: Reg) -> u8 {
    reg.hw().expect("general-purpose register")
}

/// REX with W=1 plus R from `reg` and B from `rm`.
fn rex_w(reg: u8, rm: u8) -> u8 {
    0x48 | ((reg >> 3) << 2) | (rm >> 3)
}

/// REX without W, only when an extension bit is needed.
fn rex_opt(reg: u8, rm: u8) -> Option<u8> {
    let b = 0x40 | ((reg >> 3) << 2) | (rm >> 3);
    if b != 0x40 {
        Some(b)
    } else {
        None
    }
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// ModR/M + SIB + displacement for an `off(%rsp)` operand.
fn rsp_mem(out: &mut TokenOut, reg: u8, off: i32) {
    if off == 0 {
        out.byte(modrm(0b00, reg, 0b100));
        out.byte(0x24);
    } else if (-128..=127).contains(&off) {
        out.byte(modrm(0b01, reg, 0b100));
        out.byte(0x24);
        out.int8(off as i64);
    } else {
        out.byte(modrm(0b10, reg, 0b100));
        out.byte(0x24);
        out.int32(off as i64);
    }
}

/// `mov %src,%dst` (64-bit).
pub fn emit_mov_r64_r64(out: &mut TokenOut, src: Reg, dst: Reg) {
    let (s, d) = (hw(src), hw(dst));
    out.byte(rex_w(s, d));
    out.byte(0x89);
    out.byte(modrm(0b11, s, d));
}

/// `mov %src32,%dst32` — zero-extends into the full destination.
pub fn emit_mov_r32_r64(out: &mut TokenOut, src: Reg, dst: Reg) {
    let (s, d) = (hw(src), hw(dst));
    if let Some(rex) = rex_opt(s, d) {
        out.byte(rex);
    }
    out.byte(0x89);
    out.byte(modrm(0b11, s, d));
}

/// `movzwq %src16,%dst` — zero-extends.
pub fn emit_mov_r16_r64(out: &mut TokenOut, src: Reg, dst: Reg) {
    let (s, d) = (hw(src), hw(dst));
    out.byte(rex_w(d, s));
    out.byte(0x0f);
    out.byte(0xb7);
    out.byte(modrm(0b11, d, s));
}

/// `movzbq %src8,%dst` — zero-extends. `high` selects the legacy
/// `%ah`-style encoding, which cannot coexist with a REX prefix; when the
/// destination needs one anyway, go through a 16-bit load plus shift.
pub fn emit_mov_r8_r64(out: &mut TokenOut, src: Reg, high: bool, dst: Reg) {
    let (s, d) = (hw(src), hw(dst));
    if !high {
        out.byte(rex_w(d, s));
        out.byte(0x0f);
        out.byte(0xb6);
        out.byte(modrm(0b11, d, s));
        return;
    }
    if d < 8 {
        // movzbl %ah,%dst32
        out.byte(0x0f);
        out.byte(0xb6);
        out.byte(modrm(0b11, d, s + 4));
    } else {
        // movzwl %src16,%dst32; shr $8,%dst32
        out.byte(0x44);
        out.byte(0x0f);
        out.byte(0xb7);
        out.byte(modrm(0b11, d, s));
        out.byte(0x41);
        out.byte(0xc1);
        out.byte(modrm(0b11, 5, d));
        out.byte(8);
    }
}

/// `mov off(%rsp),%dst` (64-bit).
pub fn emit_mov_stack_r64(out: &mut TokenOut, off: i32, dst: Reg) {
    let d = hw(dst);
    out.byte(rex_w(d, 0));
    out.byte(0x8b);
    rsp_mem(out, d, off);
}

/// `mov off(%rsp),%dst32` — zero-extends.
pub fn emit_mov_stack32_r64(out: &mut TokenOut, off: i32, dst: Reg) {
    let d = hw(dst);
    if let Some(rex) = rex_opt(d, 0) {
        out.byte(rex);
    }
    out.byte(0x8b);
    rsp_mem(out, d, off);
}

/// `movzwq off(%rsp),%dst`.
pub fn emit_mov_stack16_r64(out: &mut TokenOut, off: i32, dst: Reg) {
    let d = hw(dst);
    out.byte(rex_w(d, 0));
    out.byte(0x0f);
    out.byte(0xb7);
    rsp_mem(out, d, off);
}

/// `movzbq off(%rsp),%dst`.
pub fn emit_mov_stack8_r64(out: &mut TokenOut, off: i32, dst: Reg) {
    let d = hw(dst);
    out.byte(rex_w(d, 0));
    out.byte(0x0f);
    out.byte(0xb6);
    rsp_mem(out, d, off);
}

/// `mov %src,off(%rsp)` (64-bit).
pub fn emit_mov_r64_stack(out: &mut TokenOut, src: Reg, off: i32) {
    let s = hw(src);
    out.byte(rex_w(s, 0));
    out.byte(0x89);
    rsp_mem(out, s, off);
}

/// `lea off(%rsp),%dst`.
pub fn emit_lea_stack_r64(out: &mut TokenOut, off: i32, dst: Reg) {
    let d = hw(dst);
    out.byte(rex_w(d, 0));
    out.byte(0x8d);
    rsp_mem(out, d, off);
}

fn pcrel_prefix(out: &mut TokenOut, opcode: u8, dst: Reg) {
    let d = hw(dst);
    out.byte(rex_w(d, 0));
    out.byte(opcode);
    out.byte(modrm(0b00, d, 0b101));
}

/// `lea label(%rip),%dst`.
pub fn emit_lea_pcrel_label(out: &mut TokenOut, label: &str, dst: Reg) {
    pcrel_prefix(out, 0x8d, dst);
    out.rel32_label(label);
}

/// `lea target(%rip),%dst` for an absolute link-time target.
pub fn emit_lea_pcrel_abs(out: &mut TokenOut, target: i64, dst: Reg) {
    pcrel_prefix(out, 0x8d, dst);
    out.rel32_abs(target);
}

/// `mov target(%rip),%dst` — dereferencing load, used for GOT entries.
pub fn emit_mov_pcrel_r64(out: &mut TokenOut, target: i64, dst: Reg) {
    pcrel_prefix(out, 0x8b, dst);
    out.rel32_abs(target);
}

/// `movq $imm32,%dst` — sign-extends.
pub fn emit_sext_i32_r64(out: &mut TokenOut, v: i32, dst: Reg) {
    let d = hw(dst);
    out.byte(rex_w(0, d));
    out.byte(0xc7);
    out.byte(modrm(0b11, 0, d));
    out.int32(v as i64);
}

/// `mov $imm32,%dst32` — zero-extends.
pub fn emit_zext_u32_r64(out: &mut TokenOut, v: u32, dst: Reg) {
    let d = hw(dst);
    if let Some(rex) = rex_opt(0, d) {
        out.byte(rex);
    }
    out.byte(0xb8 + (d & 7));
    out.int32(v as i32 as i64);
}

/// `movabs $imm64,%dst`.
pub fn emit_mov_i64_r64(out: &mut TokenOut, v: i64, dst: Reg) {
    let d = hw(dst);
    out.byte(rex_w(0, d));
    out.byte(0xb8 + (d & 7));
    out.int64(v);
}

/// Load an arbitrary integer with the shortest of the three immediate
/// forms.
pub fn emit_load_value(out: &mut TokenOut, v: i64, dst: Reg) {
    if (i32::MIN as i64..=i32::MAX as i64).contains(&v) {
        emit_sext_i32_r64(out, v as i32, dst);
    } else if (0..=u32::MAX as i64).contains(&v) {
        emit_zext_u32_r64(out, v as u32, dst);
    } else {
        emit_mov_i64_r64(out, v, dst);
    }
}

/// Push a register's *original* value. `%rip` and `%rsp` cannot be pushed
/// directly: their values are synthesised into `scratch` first. The flags
/// go through `seto; lahf`, parking `%rax` in `scratch` when its live
/// value must survive.
///
/// Returns `(pushed, scratch_clobbered)`.
pub fn emit_push_reg(
    out: &mut TokenOut,
    rsp_offset: i32,
    before: bool,
    reg: Reg,
    scratch: Option<Reg>,
) -> (bool, bool) {
    match reg.canonical() {
        Reg::Rip => {
            let Some(scr) = scratch else {
                return (false, false);
            };
            let label = if before { ".Linstruction" } else { ".Lcontinue" };
            emit_lea_pcrel_label(out, label, scr);
            push_gpr(out, scr);
            (true, true)
        }
        Reg::Rsp => {
            let Some(scr) = scratch else {
                return (false, false);
            };
            emit_lea_stack_r64(out, rsp_offset, scr);
            push_gpr(out, scr);
            (true, true)
        }
        Reg::Rflags => {
            let Some(scr) = scratch else {
                return (false, false);
            };
            if scr != Reg::Rax {
                emit_mov_r64_r64(out, Reg::Rax, scr);
            }
            // seto %al; lahf
            out.bytes(&[0x0f, 0x90, 0xc0, 0x9f]);
            push_gpr(out, Reg::Rax);
            if scr != Reg::Rax {
                emit_mov_r64_r64(out, scr, Reg::Rax);
            }
            (true, true)
        }
        Reg::Fs | Reg::Gs => (false, false),
        r => {
            push_gpr(out, r);
            (true, false)
        }
    }
}

fn push_gpr(out: &mut TokenOut, reg: Reg) {
    let r = hw(reg);
    if r >= 8 {
        out.byte(0x41);
    }
    out.byte(0x50 + (r & 7));
}

fn pop_gpr(out: &mut TokenOut, reg: Reg) {
    let r = hw(reg);
    if r >= 8 {
        out.byte(0x41);
    }
    out.byte(0x58 + (r & 7));
}

/// Pop a saved slot back into its register. Restoring the flags clobbers
/// `%rax` (`pop %rax; add $0x7f,%al; sahf`), so a live `%rax` is parked in
/// `scratch` around it; a live `%rax` itself is kept by dropping its slot
/// instead of popping it.
///
/// Returns true when `scratch` was clobbered.
pub fn emit_pop_reg(
    out: &mut TokenOut,
    preserve_rax: bool,
    reg: Reg,
    scratch: Option<Reg>,
) -> bool {
    match reg.canonical() {
        Reg::Rflags => {
            let park = preserve_rax && scratch.is_some();
            if park {
                emit_mov_r64_r64(out, Reg::Rax, scratch.unwrap());
            }
            pop_gpr(out, Reg::Rax);
            // add $0x7f,%al; sahf
            out.bytes(&[0x04, 0x7f, 0x9e]);
            if park {
                emit_mov_r64_r64(out, scratch.unwrap(), Reg::Rax);
            }
            park
        }
        Reg::Rax if preserve_rax => {
            // lea 8(%rsp),%rsp
            out.byte(0x48);
            out.byte(0x8d);
            rsp_mem(out, 4, 8);
            false
        }
        Reg::Rip => {
            // %rip cannot be popped; its slot is simply dropped.
            out.byte(0x48);
            out.byte(0x8d);
            rsp_mem(out, 4, 8);
            false
        }
        r => {
            pop_gpr(out, r);
            false
        }
    }
}
