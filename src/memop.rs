//! Memory-operand loading and transient register displacement.
//!
//! Loading a memory operand's value (or effective address) must run with
//! the operand's base and index registers holding their *program-original*
//! values, which the emission may have displaced. The temporary save /
//! restore / undo trio below moves live values out of the way — into a
//! scratch register when one is free, otherwise into a red-zone slot below
//! the current `%rsp` — for exactly the duration of one load.

use log::warn;

use crate::callinfo::CallInfo;
use crate::encode::{
    emit_mov_r64_r64, emit_mov_r64_stack, emit_mov_stack_r64, emit_push_reg, emit_sext_i32_r64,
};
use crate::insn::{Instr, MemRef};
use crate::regs::Reg;
use crate::token::TokenOut;

/// Where a displaced live value went, so it can be put back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spill {
    /// Nothing was displaced.
    None,
    Reg(Reg),
    /// Red-zone slot; the offset is `8 * n` bytes below the current
    /// `%rsp` (n is negative).
    Slot(i32),
}

/// Unconditionally relocate `reg`'s live value. The slot counter is shared
/// across one load sequence; slots release in LIFO order when the sequence
/// unwinds.
pub fn send_temporary_mov_reg(
    out: &mut TokenOut,
    info: &mut CallInfo,
    reg: Reg,
    exclude: &[Reg],
    slot: &mut i32,
) -> Spill {
    match info.get_scratch(exclude) {
        Some(scratch) => {
            emit_mov_r64_r64(out, reg, scratch);
            info.clobber(scratch);
            Spill::Reg(scratch)
        }
        None => {
            *slot -= 1;
            emit_mov_r64_stack(out, reg, 8 * *slot);
            Spill::Slot(*slot)
        }
    }
}

/// Free `reg` for another purpose. A no-op when the register is already
/// clobbered: its original is either saved or not wanted.
pub fn send_temporary_save_reg(
    out: &mut TokenOut,
    info: &mut CallInfo,
    reg: Reg,
    exclude: &[Reg],
    slot: &mut i32,
) -> Spill {
    if info.is_clobbered(reg) {
        return Spill::None;
    }
    send_temporary_mov_reg(out, info, reg, exclude, slot)
}

/// Bring `reg`'s program-original value back into `reg`, displacing the
/// live value first when later emission still reads it.
pub fn send_temporary_restore_reg(
    out: &mut TokenOut,
    info: &mut CallInfo,
    reg: Reg,
    exclude: &[Reg],
    slot: &mut i32,
) -> Spill {
    if !info.is_clobbered(reg) {
        return Spill::None;
    }
    if !info.is_used(reg) {
        emit_mov_stack_r64(out, info.get_offset(reg), reg);
        info.restore(reg);
        return Spill::None;
    }
    let spill = send_temporary_mov_reg(out, info, reg, exclude, slot);
    emit_mov_stack_r64(out, info.get_offset(reg), reg);
    spill
}

/// Inverse of [`send_temporary_mov_reg`].
pub fn send_undo_temporary_mov_reg(out: &mut TokenOut, reg: Reg, spill: Spill) {
    match spill {
        Spill::None => {}
        Spill::Reg(scratch) => emit_mov_r64_r64(out, scratch, reg),
        Spill::Slot(n) => emit_mov_stack_r64(out, 8 * n, reg),
    }
}

/// Ensure `reg`'s original value is in the saved-state block, pushing it
/// if necessary. Returns false when the register cannot be pushed.
pub fn send_save_reg_to_stack(out: &mut TokenOut, info: &mut CallInfo, reg: Reg) -> bool {
    if info.is_saved(reg) {
        return true;
    }
    let scratch = if info.is_clobbered(Reg::Rax) {
        Some(Reg::Rax)
    } else {
        info.get_scratch(&[])
    };
    let (pushed, used_scratch) = emit_push_reg(out, info.rsp_offset, info.before, reg, scratch);
    if pushed {
        info.push(reg);
        if used_scratch {
            info.clobber(scratch.expect("push used a scratch"));
        }
    }
    pushed
}

fn is_rsp(reg: Option<Reg>) -> bool {
    matches!(reg, Some(r) if r.canonical() == Reg::Rsp)
}

fn is_rip(reg: Option<Reg>) -> bool {
    matches!(reg, Some(r) if r.canonical() == Reg::Rip)
}

/// Synthesise one `mov` (or `lea`) that materialises a memory operand into
/// `dst`, compensating the displacement for the trampoline's stack shift
/// and restoring any displaced base/index register around the access.
///
/// On any unencodable input, warns, loads zero and returns false.
pub fn send_load_mem_op(
    out: &mut TokenOut,
    info: &mut CallInfo,
    instr: &Instr,
    size: u8,
    mem: &MemRef,
    lea: bool,
    dst: Reg,
) -> bool {
    if lea && mem.seg.is_some() {
        // lea computes the address as if every segment base were zero;
        // %fs/%gs may not be.
        warn!(
            "{instr}: failed to load effective address into {dst}: segment register {} \
             cannot be used with lea",
            mem.seg.unwrap()
        );
        emit_sext_i32_r64(out, 0, dst);
        return false;
    }

    let seg_prefix: Option<u8> = match mem.seg {
        Some(Reg::Fs) => Some(0x64),
        Some(Reg::Gs) => Some(0x65),
        _ => None,
    };
    let addr32 = mem.base.is_some_and(|r| r.is_addr32()) || mem.index.is_some_and(|r| r.is_addr32());

    let b = u8::from(!is_rip(mem.base) && mem.base.is_some_and(|r| r.is_ext()));
    let x = u8::from(mem.index.is_some_and(|r| r.is_ext())) << 1;
    let r = u8::from(dst.is_ext()) << 2;
    let rex = 0x48 | r | x | b;

    let mut disp = mem.disp as i64;
    if is_rsp(mem.base) {
        disp += info.rsp_offset as i64;
    }

    let reg_field = dst.hw().expect("gpr destination") & 7;
    let mut sib: Option<u8> = None;
    let rel32: bool;
    let modrm: u8;
    enum DispWidth {
        None,
        D8,
        D32,
    }
    let disp_width: DispWidth;

    if is_rip(mem.base) {
        modrm = (reg_field << 3) | 0b101;
        disp += instr.address + instr.size() as i64;
        disp_width = DispWidth::D32;
        rel32 = true;
    } else {
        rel32 = false;
        let base_hw = mem.base.map(|r| r.hw().expect("gpr base"));
        let index_hw = mem.index.map(|r| r.hw().expect("gpr index"));
        let need_sib =
            mem.index.is_some() || mem.base.is_none() || matches!(base_hw, Some(4) | Some(12));
        let rm = if need_sib {
            debug_assert!(index_hw != Some(4), "%rsp cannot be an index register");
            let ss: u8 = match mem.scale {
                2 => 0b01,
                4 => 0b10,
                8 => 0b11,
                _ => 0b00,
            };
            let base_bits = base_hw.map_or(0b101, |h| h & 7);
            let index_bits = index_hw.map_or(0b100, |h| h & 7);
            sib = Some((ss << 6) | (index_bits << 3) | base_bits);
            0b100
        } else {
            base_hw.unwrap() & 7
        };

        if mem.base.is_none() {
            disp_width = DispWidth::D32;
            modrm = (reg_field << 3) | rm;
        } else if disp == 0 && !matches!(base_hw, Some(5) | Some(13)) {
            disp_width = DispWidth::None;
            modrm = (reg_field << 3) | rm;
        } else if (-128..=127).contains(&disp) {
            disp_width = DispWidth::D8;
            modrm = 0x40 | (reg_field << 3) | rm;
        } else {
            disp_width = DispWidth::D32;
            modrm = 0x80 | (reg_field << 3) | rm;
        }
    }

    if !(i32::MIN as i64..=i32::MAX as i64).contains(&disp) {
        warn!(
            "{instr}: failed to load memory operand into {dst}: adjusted displacement \
             {disp:#x} does not fit in 32 bits"
        );
        emit_sext_i32_r64(out, 0, dst);
        return false;
    }

    let opcode: &[u8] = if lea {
        &[0x8d]
    } else {
        match size {
            8 => &[0x8b],
            4 => &[0x63],
            2 => &[0x0f, 0xbf],
            1 => &[0x0f, 0xbe],
            _ => {
                warn!(
                    "{instr}: failed to load memory operand into {dst}: unsupported \
                     operand size {size}"
                );
                emit_sext_i32_r64(out, 0, dst);
                return false;
            }
        }
    };

    // Restore displaced base/index originals for the duration of the load.
    let mut exclude = vec![dst];
    if let Some(base) = mem.base {
        exclude.push(base.canonical());
    }
    if let Some(index) = mem.index {
        exclude.push(index.canonical());
    }
    let mut slot = 0;
    let mut spill_base = Spill::None;
    let mut spill_index = Spill::None;
    if let Some(base) = mem.base {
        if base.canonical() != Reg::Rip {
            spill_base = send_temporary_restore_reg(out, info, base, &exclude, &mut slot);
        }
    }
    if let Some(index) = mem.index {
        if Some(index.canonical()) != mem.base.map(Reg::canonical) {
            spill_index = send_temporary_restore_reg(out, info, index, &exclude, &mut slot);
        }
    }

    if let Some(p) = seg_prefix {
        out.byte(p);
    }
    if addr32 {
        out.byte(0x67);
    }
    out.byte(rex);
    out.bytes(opcode);
    out.byte(modrm);
    if let Some(sib) = sib {
        out.byte(sib);
    }
    if rel32 {
        out.rel32_abs(disp);
    } else {
        match disp_width {
            DispWidth::None => {}
            DispWidth::D8 => out.int8(disp),
            DispWidth::D32 => out.int32(disp),
        }
    }

    if let Some(index) = mem.index {
        send_undo_temporary_mov_reg(out, index.canonical(), spill_index);
    }
    if let Some(base) = mem.base {
        if base.canonical() != Reg::Rip {
            send_undo_temporary_mov_reg(out, base.canonical(), spill_base);
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::Mnemonic;

    fn instr_at(address: i64, len: usize) -> Instr {
        Instr {
            address,
            offset: address,
            bytes: vec![0x90; len],
            text: "test".into(),
            mnemonic: Mnemonic::Other,
            ops: Vec::new(),
        }
    }

    fn fresh(out_cap: usize) -> (TokenOut, CallInfo) {
        let out = TokenOut::with_capacity(out_cap);
        let info = CallInfo::new(false, false, false, 0, true);
        (out, info)
    }

    #[test]
    fn rsp_base_gets_stack_compensation() {
        // mov 0x10(%rsp,%rbx,2),%rdi with the stack shifted by 0x20
        // becomes mov 0x30(%rsp,%rbx,2),%rdi = 48 8b 7c 5c 30.
        let (mut out, mut info) = fresh(1 << 12);
        info.rsp_offset = 0x20;
        let mem = MemRef {
            seg: None,
            base: Some(Reg::Rsp),
            index: Some(Reg::Rbx),
            scale: 2,
            disp: 0x10,
        };
        let ok = send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 8, &mem, false, Reg::Rdi);
        assert!(ok);
        assert_eq!(out.take_fragment().unwrap(), "72,139,124,92,{\"int8\":48},");
    }

    #[test]
    fn scale_four_sets_ss_bits() {
        let (mut out, mut info) = fresh(1 << 12);
        let mem = MemRef {
            seg: None,
            base: Some(Reg::Rax),
            index: Some(Reg::Rbx),
            scale: 4,
            disp: 0,
        };
        // mov (%rax,%rbx,4),%rdi = 48 8b 3c 98
        assert!(send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 8, &mem, false, Reg::Rdi));
        assert_eq!(out.take_fragment().unwrap(), "72,139,60,152,");
    }

    #[test]
    fn rip_relative_folds_instruction_end() {
        let (mut out, mut info) = fresh(1 << 12);
        let mem = MemRef {
            seg: None,
            base: Some(Reg::Rip),
            index: None,
            scale: 1,
            disp: 8,
        };
        // mov 8(%rip),%rsi at 0x1000, len 7: target = 0x1000 + 7 + 8
        assert!(send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 7), 8, &mem, false, Reg::Rsi));
        assert_eq!(out.take_fragment().unwrap(), "72,139,53,{\"rel32\":4111},");
    }

    #[test]
    fn rbp_and_r13_force_disp8() {
        let (mut out, mut info) = fresh(1 << 12);
        let mem = MemRef {
            seg: None,
            base: Some(Reg::R13),
            index: None,
            scale: 1,
            disp: 0,
        };
        // mov 0x0(%r13),%rdi = 49 8b 7d 00
        assert!(send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 8, &mem, false, Reg::Rdi));
        assert_eq!(out.take_fragment().unwrap(), "73,139,125,{\"int8\":0},");
    }

    #[test]
    fn r12_base_needs_sib() {
        let (mut out, mut info) = fresh(1 << 12);
        let mem = MemRef {
            seg: None,
            base: Some(Reg::R12),
            index: None,
            scale: 1,
            disp: 0,
        };
        // mov (%r12),%rdi = 49 8b 3c 24
        assert!(send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 8, &mem, false, Reg::Rdi));
        assert_eq!(out.take_fragment().unwrap(), "73,139,60,36,");
    }

    #[test]
    fn absolute_address_uses_disp32() {
        let (mut out, mut info) = fresh(1 << 12);
        let mem = MemRef {
            seg: Some(Reg::Fs),
            base: None,
            index: None,
            scale: 1,
            disp: 0x10,
        };
        // movslq %fs:0x10,%rdi = 64 48 63 3c 25 10000000
        assert!(send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 4, &mem, false, Reg::Rdi));
        assert_eq!(
            out.take_fragment().unwrap(),
            "100,72,99,60,37,{\"int32\":16},"
        );
    }

    #[test]
    fn addr32_base_gets_67_prefix() {
        let (mut out, mut info) = fresh(1 << 12);
        let mem = MemRef {
            seg: None,
            base: Some(Reg::Eax),
            index: None,
            scale: 1,
            disp: 4,
        };
        // movswq 0x4(%eax),%r8 = 67 4c 0f bf 40 04
        assert!(send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 2, &mem, false, Reg::R8));
        assert_eq!(
            out.take_fragment().unwrap(),
            "103,76,15,191,64,{\"int8\":4},"
        );
    }

    #[test]
    fn lea_with_segment_fails_safely() {
        let (mut out, mut info) = fresh(1 << 12);
        let mem = MemRef {
            seg: Some(Reg::Gs),
            base: Some(Reg::Rax),
            index: None,
            scale: 1,
            disp: 0,
        };
        assert!(!send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 8, &mem, true, Reg::Rdi));
        // movq $0,%rdi
        assert_eq!(out.take_fragment().unwrap(), "72,199,199,{\"int32\":0},");
    }

    #[test]
    fn overflowing_adjusted_displacement_fails_safely() {
        let (mut out, mut info) = fresh(1 << 12);
        info.rsp_offset = 0x4000;
        let mem = MemRef {
            seg: None,
            base: Some(Reg::Rsp),
            index: None,
            scale: 1,
            disp: i32::MAX,
        };
        assert!(!send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 8, &mem, false, Reg::Rdi));
        assert_eq!(out.take_fragment().unwrap(), "72,199,199,{\"int32\":0},");
    }

    #[test]
    fn clobbered_base_is_restored_around_the_load() {
        // rdi is planned-saved; loading an argument into it displaces the
        // program's value. A later operand based on rdi must read the
        // original.
        let mut out = TokenOut::with_capacity(1 << 12);
        let mut info = CallInfo::new(false, false, false, 2, true);
        info.clobber(Reg::Rdi);
        info.use_reg(Reg::Rdi);
        let rdi_off = info.get_offset(Reg::Rdi);
        let mem = MemRef {
            seg: None,
            base: Some(Reg::Rdi),
            index: None,
            scale: 1,
            disp: 0,
        };
        assert!(send_load_mem_op(&mut out, &mut info, &instr_at(0x1000, 4), 8, &mem, false, Reg::Rsi));
        let mut expect = TokenOut::with_capacity(1 << 12);
        // park live rdi in rax, reload the original, load, unpark
        emit_mov_r64_r64(&mut expect, Reg::Rdi, Reg::Rax);
        emit_mov_stack_r64(&mut expect, rdi_off, Reg::Rdi);
        expect.bytes(&[0x48, 0x8b, 0x37]); // mov (%rdi),%rsi
        emit_mov_r64_r64(&mut expect, Reg::Rax, Reg::Rdi);
        assert_eq!(
            out.take_fragment().unwrap(),
            expect.take_fragment().unwrap()
        );
        assert!(info.is_clobbered(Reg::Rax));
    }

    #[test]
    fn temporary_mov_spills_to_red_zone_when_regs_run_out() {
        let mut out = TokenOut::with_capacity(1 << 12);
        let mut info = CallInfo::new(false, false, false, 0, true);
        for reg in crate::regs::SCRATCH_ORDER {
            info.use_reg(reg);
        }
        let mut slot = 0;
        let spill = send_temporary_mov_reg(&mut out, &mut info, Reg::Rbx, &[], &mut slot);
        assert_eq!(spill, Spill::Slot(-1));
        // mov %rbx,-0x8(%rsp)
        assert_eq!(
            out.take_fragment().unwrap(),
            "72,137,92,36,{\"int8\":-8},"
        );
        send_undo_temporary_mov_reg(&mut out, Reg::Rbx, spill);
        // mov -0x8(%rsp),%rbx
        assert_eq!(
            out.take_fragment().unwrap(),
            "72,139,92,36,{\"int8\":-8},"
        );
    }

    #[test]
    fn save_reg_is_idempotent() {
        let mut out = TokenOut::with_capacity(1 << 12);
        let mut info = CallInfo::new(false, false, false, 0, true);
        assert!(send_save_reg_to_stack(&mut out, &mut info, Reg::Rbx));
        assert_eq!(out.take_fragment().unwrap(), "83,"); // push %rbx
        assert!(send_save_reg_to_stack(&mut out, &mut info, Reg::Rbx));
        assert_eq!(out.take_fragment().unwrap(), "");
    }
}
