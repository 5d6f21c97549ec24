//! Argument materialisation.
//!
//! Translates one abstract argument into the primitive loads that put its
//! value into the right calling-convention register, and computes the type
//! the callee will see. Local failures follow one rule: warn, load zero,
//! report `NULL_PTR`. Only conditions the caller cannot patch around
//! (argument-register exhaustion, value-lookup failures) are fatal.

use log::warn;

use crate::action::{ArgKind, Argument, CallAction, CallConv, Field};
use crate::callinfo::CallInfo;
use crate::encode::{
    emit_lea_pcrel_abs, emit_lea_pcrel_label, emit_lea_stack_r64, emit_load_value,
    emit_mov_pcrel_r64, emit_mov_r16_r64, emit_mov_r32_r64, emit_mov_r64_r64, emit_mov_r8_r64,
    emit_mov_stack16_r64, emit_mov_stack32_r64, emit_mov_stack8_r64, emit_mov_stack_r64,
    emit_sext_i32_r64,
};
use crate::host::{HostElf, ObjectAddr, ValueLookup};
use crate::insn::{Access, Instr, Mnemonic, Op, OpKind};
use crate::memop::{
    send_load_mem_op, send_save_reg_to_stack, send_temporary_restore_reg,
    send_temporary_save_reg, send_undo_temporary_mov_reg,
};
use crate::regs::{arg_reg, Reg};
use crate::token::TokenOut;
use crate::ty::Ty;
use crate::BuildError;

/// Emit a zero into `dst` after a warning; the argument reads as a null
/// pointer from then on.
fn load_zero(out: &mut TokenOut, dst: Reg) -> Ty {
    emit_sext_i32_r64(out, 0, dst);
    Ty::NULL_PTR
}

// ─── Operand selection ──────────────────────────────────────────────────────

/// Which operands an operand-indexed argument kind counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSel {
    Any,
    Src,
    Dst,
    Imm,
    Reg,
    Mem,
}

impl OpSel {
    pub fn name(self) -> &'static str {
        match self {
            OpSel::Any => "op",
            OpSel::Src => "src",
            OpSel::Dst => "dst",
            OpSel::Imm => "imm",
            OpSel::Reg => "reg",
            OpSel::Mem => "mem",
        }
    }
}

/// The `idx`-th operand counted under the selector, or `None` when the
/// index runs off the end.
pub fn get_operand(instr: &Instr, idx: usize, sel: OpSel) -> Option<&Op> {
    instr
        .ops
        .iter()
        .filter(|op| match sel {
            OpSel::Any => true,
            OpSel::Src => op.access.contains(Access::READ),
            OpSel::Dst => op.access.contains(Access::WRITE),
            OpSel::Imm => op.is_imm(),
            OpSel::Reg => op.is_reg(),
            OpSel::Mem => op.is_mem(),
        })
        .nth(idx)
}

// ─── Operand typing ─────────────────────────────────────────────────────────

/// The type an operand (or operand field) presents to the callee.
pub fn operand_type(op: Option<&Op>, ptr: bool, field: Field) -> Ty {
    let Some(op) = op else {
        return Ty::NULL_PTR;
    };
    match field {
        Field::Access | Field::Type => return Ty::INT8,
        Field::Size => return Ty::INT64,
        Field::Disp => {
            return if op.is_mem() { Ty::INT32 } else { Ty::NULL_PTR };
        }
        Field::Base | Field::Index => {
            let t = match op.kind {
                OpKind::Mem(m) => {
                    let reg = if field == Field::Base { m.base } else { m.index };
                    reg.map_or(Ty::NULL_PTR, Reg::ty)
                }
                _ => Ty::NULL_PTR,
            };
            return if ptr && t != Ty::NULL_PTR { t | Ty::PTR } else { t };
        }
        Field::Scale => {
            return if op.is_mem() { Ty::INT8 } else { Ty::NULL_PTR };
        }
        Field::None => {}
    }

    let mut t = match op.kind {
        OpKind::Reg(r) => {
            let t = r.ty();
            // A pointer to a 32-bit register reads the full 64-bit slot.
            if ptr && t == Ty::INT32 {
                Ty::INT64
            } else {
                t
            }
        }
        OpKind::Mem(_) => {
            let t = Ty::of_size(op.size as usize);
            if t == Ty::NONE {
                if ptr {
                    Ty::INT8
                } else {
                    Ty::NULL_PTR
                }
            } else {
                t
            }
        }
        OpKind::Imm(_) => {
            let t = Ty::of_size(op.size as usize);
            let t = if t == Ty::NONE {
                if ptr {
                    Ty::INT8
                } else {
                    Ty::NULL_PTR
                }
            } else {
                t
            };
            if ptr {
                t | Ty::CONST
            } else {
                t
            }
        }
    };
    if ptr && t != Ty::NULL_PTR {
        t |= Ty::PTR;
    }
    t
}

// ─── Register loads ─────────────────────────────────────────────────────────

/// Load a register's program-original value into `dst`, reading from the
/// saved slot when the live value has been displaced.
fn send_load_reg_value(out: &mut TokenOut, info: &CallInfo, reg: Reg, dst: Reg) {
    if info.is_clobbered(reg) {
        let off = info.get_offset(reg);
        match reg.size() {
            4 => emit_mov_stack32_r64(out, off, dst),
            2 => emit_mov_stack16_r64(out, off, dst),
            1 => emit_mov_stack8_r64(out, off + i32::from(reg.is_high()), dst),
            _ => emit_mov_stack_r64(out, off, dst),
        }
    } else {
        match reg.size() {
            4 => emit_mov_r32_r64(out, reg, dst),
            2 => emit_mov_r16_r64(out, reg, dst),
            1 => emit_mov_r8_r64(out, reg, reg.is_high(), dst),
            _ => emit_mov_r64_r64(out, reg, dst),
        }
    }
}

/// Load a register argument by value or by reference.
fn send_load_reg_arg(
    out: &mut TokenOut,
    info: &mut CallInfo,
    instr: &Instr,
    reg: Reg,
    ptr: bool,
    dst: Reg,
) -> bool {
    if ptr {
        if !send_save_reg_to_stack(out, info, reg) {
            warn!("{instr}: failed to save {reg} for pass-by-reference");
            load_zero(out, dst);
            return false;
        }
        emit_lea_stack_r64(out, info.get_offset(reg) + i32::from(reg.is_high()), dst);
        true
    } else {
        if reg.hw().is_none() {
            warn!("{instr}: failed to move {reg} into {dst}: not a general-purpose register");
            load_zero(out, dst);
            return false;
        }
        send_load_reg_value(out, info, reg, dst);
        true
    }
}

// ─── Operand loads ──────────────────────────────────────────────────────────

/// Load an operand, or one of its fields, into `dst`. `argno` names the
/// data-section label a pass-by-pointer immediate refers to.
fn send_load_operand(
    out: &mut TokenOut,
    info: &mut CallInfo,
    instr: &Instr,
    op: &Op,
    ptr: bool,
    field: Field,
    dst: Reg,
    argno: usize,
) -> bool {
    if field != Field::None {
        if matches!(field, Field::Disp | Field::Base | Field::Index | Field::Scale) && !op.is_mem()
        {
            warn!(
                "{instr}: failed to load {} into {dst}: not a memory operand",
                field.name()
            );
            load_zero(out, dst);
            return false;
        }
        match field {
            Field::Disp => {
                let OpKind::Mem(m) = op.kind else { unreachable!() };
                emit_load_value(out, m.disp as i64, dst);
                true
            }
            Field::Base | Field::Index => {
                let OpKind::Mem(m) = op.kind else { unreachable!() };
                let reg = if field == Field::Base { m.base } else { m.index };
                let Some(reg) = reg else {
                    warn!(
                        "{instr}: failed to load {} into {dst}: operand has no {} register",
                        field.name(),
                        field.name()
                    );
                    load_zero(out, dst);
                    return false;
                };
                send_load_reg_arg(out, info, instr, reg, ptr, dst)
            }
            Field::Scale => {
                let OpKind::Mem(m) = op.kind else { unreachable!() };
                emit_load_value(out, m.scale as i64, dst);
                true
            }
            Field::Size => {
                emit_load_value(out, op.size as i64, dst);
                true
            }
            Field::Type => {
                let v = match op.kind {
                    OpKind::Imm(_) => 0x1,
                    OpKind::Reg(_) => 0x2,
                    OpKind::Mem(_) => 0x3,
                };
                emit_load_value(out, v, dst);
                true
            }
            Field::Access => {
                // PROT_READ for immediates; otherwise the access mask with
                // a marker bit so the result is never zero.
                let v = if op.is_imm() {
                    0x1
                } else {
                    (op.access.raw() | 0x80) as i64
                };
                emit_load_value(out, v, dst);
                true
            }
            Field::None => unreachable!(),
        }
    } else {
        match op.kind {
            OpKind::Reg(reg) => send_load_reg_arg(out, info, instr, reg, ptr, dst),
            OpKind::Mem(m) => send_load_mem_op(out, info, instr, op.size, &m, ptr, dst),
            OpKind::Imm(v) => {
                if ptr {
                    emit_lea_pcrel_label(out, &format!(".Limmediate_{argno}"), dst);
                } else {
                    emit_load_value(out, v, dst);
                }
                true
            }
        }
    }
}

// ─── Branch targets ─────────────────────────────────────────────────────────

/// Load the jump/call/return destination into `dst`; zero when the
/// instruction does not transfer control.
pub fn send_load_target(out: &mut TokenOut, info: &mut CallInfo, instr: &Instr, dst: Reg) {
    match instr.mnemonic {
        Mnemonic::Ret => {
            // The return address sits at the original stack top.
            emit_mov_stack_r64(out, info.rsp_offset, dst);
            return;
        }
        Mnemonic::Call | Mnemonic::Jmp | Mnemonic::Jcxz | Mnemonic::Jecxz | Mnemonic::Jrcxz => {}
        m if m.jcc_opcode().is_some() => {}
        _ => {
            emit_sext_i32_r64(out, 0, dst);
            return;
        }
    }
    if instr.ops.len() != 1 {
        emit_sext_i32_r64(out, 0, dst);
        return;
    }
    let op = instr.ops[0];
    match op.kind {
        OpKind::Reg(reg) => {
            if info.is_clobbered(reg) {
                emit_mov_stack_r64(out, info.get_offset(reg), dst);
            } else if reg.hw().is_some() {
                emit_mov_r64_r64(out, reg, dst);
            } else {
                emit_sext_i32_r64(out, 0, dst);
            }
        }
        OpKind::Mem(m) => {
            // Indirect branch: refashion it into a load of the target.
            let _ = send_load_mem_op(out, info, instr, op.size, &m, false, dst);
        }
        OpKind::Imm(v) => {
            emit_lea_pcrel_abs(out, instr.end() + v, dst);
        }
    }
}

/// Load the address of the next instruction the CPU will execute. For a
/// conditional branch this is a small inline island that re-tests the
/// branch condition.
pub fn send_load_next(out: &mut TokenOut, info: &mut CallInfo, instr: &Instr, dst: Reg) {
    let regname = dst.name();
    let taken = format!(".Ltaken{regname}");
    let next = format!(".Lnext{regname}");

    let opcode = match instr.mnemonic {
        Mnemonic::Ret | Mnemonic::Call | Mnemonic::Jmp => {
            send_load_target(out, info, instr, dst);
            return;
        }
        Mnemonic::Jecxz | Mnemonic::Jrcxz => {
            // The 0xe3 opcode tests %rcx (or %ecx), so the original value
            // must sit in the register while the island runs.
            let exclude = [dst];
            let mut slot = 0;
            let spill =
                send_temporary_restore_reg(out, info, Reg::Rcx, &exclude, &mut slot);
            if instr.mnemonic == Mnemonic::Jecxz {
                out.byte(0x67);
            }
            out.byte(0xe3);
            out.rel8_label(&taken);
            emit_lea_pcrel_label(out, ".Lcontinue", dst);
            out.byte(0xeb);
            out.rel8_label(&next);
            out.label(&taken);
            send_load_target(out, info, instr, dst);
            out.label(&next);
            send_undo_temporary_mov_reg(out, Reg::Rcx, spill);
            return;
        }
        m => match m.jcc_opcode() {
            Some(op) => op,
            None => {
                emit_lea_pcrel_label(out, ".Lcontinue", dst);
                return;
            }
        },
    };

    // jcc .Ltaken; lea .Lcontinue(%rip),dst; jmp .Lnext;
    // .Ltaken: <load target>; .Lnext:
    out.byte(opcode);
    out.rel8_label(&taken);
    emit_lea_pcrel_label(out, ".Lcontinue", dst);
    out.byte(0xeb);
    out.rel8_label(&next);
    out.label(&taken);
    send_load_target(out, info, instr, dst);
    out.label(&next);
}

// ─── The materialiser ───────────────────────────────────────────────────────

/// Load one argument into its calling-convention register and report the
/// type the callee sees.
#[allow(clippy::too_many_arguments)]
pub fn send_load_argument(
    out: &mut TokenOut,
    info: &mut CallInfo,
    host: &dyn HostElf,
    values: &dyn ValueLookup,
    action: &CallAction<'_>,
    arg: &Argument,
    instr: &Instr,
    id: i64,
    argno: usize,
) -> Result<Ty, BuildError> {
    let Some(dst) = arg_reg(argno) else {
        return Err(BuildError::TooManyArgs { count: argno + 1 });
    };
    send_save_reg_to_stack(out, info, dst);

    let mut t = Ty::INT64;
    match &arg.kind {
        ArgKind::User { file, row } => {
            let value = values
                .lookup(instr, file, *row)
                .map_err(BuildError::Lookup)?;
            emit_load_value(out, value, dst);
        }
        ArgKind::Integer(v) => emit_load_value(out, *v, dst),
        ArgKind::Random => emit_load_value(out, rand::random::<i32>() as i64, dst),
        ArgKind::Offset => emit_load_value(out, instr.offset, dst),
        ArgKind::Addr => {
            emit_lea_pcrel_label(out, ".Linstruction", dst);
            t = Ty::CONST | Ty::VOID | Ty::PTR;
        }
        ArgKind::StaticAddr => {
            emit_load_value(out, instr.address, dst);
            t = Ty::CONST | Ty::VOID | Ty::PTR;
        }
        ArgKind::Base => {
            // lea of absolute zero: the linker turns this into the load-time
            // image base under PIC.
            emit_lea_pcrel_abs(out, 0, dst);
            t = Ty::CONST | Ty::VOID | Ty::PTR;
        }
        ArgKind::Trampoline => {
            emit_lea_pcrel_label(out, ".Ltrampoline", dst);
            t = Ty::CONST | Ty::VOID | Ty::PTR;
        }
        ArgKind::Id => emit_load_value(out, id, dst),
        ArgKind::Next => {
            match action.conv {
                CallConv::After => {
                    // Reaching an after-call means any branch was not
                    // taken; the next instruction is the continuation.
                    emit_lea_pcrel_label(out, ".Lcontinue", dst);
                }
                _ => send_load_next(out, info, instr, dst),
            }
            t = Ty::CONST | Ty::VOID | Ty::PTR;
        }
        ArgKind::Asm => {
            emit_lea_pcrel_label(out, ".LasmStr", dst);
            t = Ty::CONST | Ty::INT8 | Ty::PTR;
        }
        ArgKind::AsmSize => emit_load_value(out, instr.text.len() as i64 + 1, dst),
        ArgKind::AsmLen => emit_load_value(out, instr.text.len() as i64, dst),
        ArgKind::Bytes => {
            emit_lea_pcrel_label(out, ".Lbytes", dst);
            t = Ty::CONST | Ty::INT8 | Ty::PTR;
        }
        ArgKind::BytesSize => emit_load_value(out, instr.size() as i64, dst),
        ArgKind::Target => {
            send_load_target(out, info, instr, dst);
            t = Ty::CONST | Ty::VOID | Ty::PTR;
        }
        ArgKind::Register(reg) if !arg.ptr => match reg.canonical() {
            Reg::Rip if *reg == Reg::Rip => {
                let label = match action.conv {
                    CallConv::After => ".Lcontinue",
                    _ => ".Linstruction",
                };
                emit_lea_pcrel_label(out, label, dst);
                t = Ty::CONST | Ty::VOID | Ty::PTR;
            }
            Reg::Rsp => {
                emit_lea_stack_r64(out, info.rsp_offset, dst);
                match reg {
                    Reg::Spl => {
                        emit_mov_r8_r64(out, dst, false, dst);
                        t = Ty::INT8;
                    }
                    Reg::Sp => {
                        emit_mov_r16_r64(out, dst, dst);
                        t = Ty::INT16;
                    }
                    Reg::Esp => {
                        emit_mov_r32_r64(out, dst, dst);
                        t = Ty::INT32;
                    }
                    _ => t = Ty::INT64,
                }
            }
            Reg::Rflags => {
                if info.is_saved(Reg::Rflags) {
                    emit_mov_stack16_r64(out, info.get_offset(Reg::Rflags), dst);
                } else {
                    // Synthesise the lahf word without disturbing %rax.
                    let exclude = [Reg::Rax, dst];
                    let mut slot = 0;
                    let spill =
                        send_temporary_save_reg(out, info, Reg::Rax, &exclude, &mut slot);
                    out.bytes(&[0x0f, 0x90, 0xc0, 0x9f]); // seto %al; lahf
                    emit_mov_r16_r64(out, Reg::Rax, dst);
                    send_undo_temporary_mov_reg(out, Reg::Rax, spill);
                }
                t = Ty::INT16;
            }
            _ => {
                if !send_load_reg_arg(out, info, instr, *reg, false, dst) {
                    t = Ty::NULL_PTR;
                } else {
                    t = reg.ty();
                }
            }
        },
        ArgKind::Register(reg) => {
            // Pass by reference: hand out the saved slot's address.
            if !send_load_reg_arg(out, info, instr, *reg, true, dst) {
                t = Ty::NULL_PTR;
            } else {
                t = match reg.size() {
                    8 | 4 => Ty::INT64,
                    2 => Ty::INT16,
                    _ => Ty::INT8,
                } | Ty::PTR;
            }
        }
        ArgKind::State => {
            // The flags slot is the base of the whole saved-register block.
            emit_lea_stack_r64(out, info.get_offset(Reg::Rflags), dst);
            t = Ty::VOID | Ty::PTR;
        }
        ArgKind::Symbol(name) => {
            t = Ty::CONST | Ty::VOID | Ty::PTR;
            match host.object_address(name) {
                ObjectAddr::Missing => {
                    warn!(
                        "{instr}: failed to load object \"{name}\" into {dst}: symbol is \
                         undefined in \"{}\"",
                        host.filename()
                    );
                    t = load_zero(out, dst);
                }
                ObjectAddr::NeedsGot => match host.got_entry(name) {
                    Some(got) if (i32::MIN as i64..=i32::MAX as i64).contains(&got) => {
                        emit_mov_pcrel_r64(out, got, dst);
                    }
                    _ => {
                        warn!(
                            "{instr}: failed to load object \"{name}\" into {dst}: GOT \
                             entry is unreachable"
                        );
                        t = load_zero(out, dst);
                    }
                },
                ObjectAddr::Addr(addr)
                    if (i32::MIN as i64..=i32::MAX as i64).contains(&addr) =>
                {
                    emit_lea_pcrel_abs(out, addr, dst);
                }
                ObjectAddr::Addr(_) => {
                    warn!(
                        "{instr}: failed to load object \"{name}\" into {dst}: object is \
                         outside the 32-bit range"
                    );
                    t = load_zero(out, dst);
                }
            }
        }
        ArgKind::Memory { size, mem } => {
            t = Ty::of_size(*size as usize);
            if t == Ty::NONE {
                t = Ty::INT8;
            }
            if arg.ptr {
                t |= Ty::PTR;
            }
            if !send_load_mem_op(out, info, instr, *size, mem, arg.ptr, dst) {
                t = Ty::NULL_PTR;
            }
        }
        ArgKind::Op(idx)
        | ArgKind::Src(idx)
        | ArgKind::Dst(idx)
        | ArgKind::Imm(idx)
        | ArgKind::RegOp(idx)
        | ArgKind::MemOp(idx) => {
            let sel = match arg.kind {
                ArgKind::Src(_) => OpSel::Src,
                ArgKind::Dst(_) => OpSel::Dst,
                ArgKind::Imm(_) => OpSel::Imm,
                ArgKind::RegOp(_) => OpSel::Reg,
                ArgKind::MemOp(_) => OpSel::Mem,
                _ => OpSel::Any,
            };
            let op = get_operand(instr, *idx, sel);
            t = operand_type(op, arg.ptr, arg.field);
            match op {
                None => {
                    warn!(
                        "{instr}: failed to load {}[{idx}]: index is out of range",
                        sel.name()
                    );
                    t = load_zero(out, dst);
                }
                Some(op) => {
                    let op = *op;
                    let mut dangerous = false;
                    if !arg.ptr && arg.field == Field::None && op.is_mem() {
                        // A memory operand read by value is only safe when
                        // the instruction itself would have accessed it.
                        if action.conv == CallConv::After {
                            warn!(
                                "{instr}: failed to load memory operand into {dst}: the \
                                 operand may be invalid after the instruction"
                            );
                            t = load_zero(out, dst);
                            dangerous = true;
                        } else if matches!(instr.mnemonic, Mnemonic::Lea | Mnemonic::Nop)
                            || op.access.is_empty()
                        {
                            warn!(
                                "{instr}: failed to load memory operand into {dst}: the \
                                 operand is never accessed by a {} instruction",
                                instr.mnemonic
                            );
                            t = load_zero(out, dst);
                            dangerous = true;
                        }
                    }
                    if !dangerous
                        && !send_load_operand(out, info, instr, &op, arg.ptr, arg.field, dst, argno)
                    {
                        t = Ty::NULL_PTR;
                    }
                }
            }
        }
    }

    info.clobber(dst);
    info.use_reg(dst);
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{LookupError, NoValues};
    use crate::insn::MemRef;
    use crate::ty::TypeSig;

    struct StubElf {
        objects: Vec<(&'static str, ObjectAddr)>,
        got: Vec<(&'static str, i64)>,
    }

    impl StubElf {
        fn empty() -> StubElf {
            StubElf {
                objects: Vec::new(),
                got: Vec::new(),
            }
        }
    }

    impl HostElf for StubElf {
        fn filename(&self) -> &str {
            "stub.elf"
        }

        fn object_address(&self, name: &str) -> ObjectAddr {
            self.objects
                .iter()
                .find(|(n, _)| *n == name)
                .map_or(ObjectAddr::Missing, |(_, a)| *a)
        }

        fn got_entry(&self, name: &str) -> Option<i64> {
            self.got.iter().find(|(n, _)| *n == name).map(|(_, a)| *a)
        }

        fn lookup_symbol(&self, _name: &str, _sig: TypeSig) -> Option<i64> {
            None
        }
    }

    fn call_action(elf: &StubElf, conv: CallConv) -> CallAction<'_> {
        CallAction {
            elf,
            symbol: "probe".into(),
            conv,
            clean: false,
            args: Vec::new(),
        }
    }

    fn instr(mnemonic: Mnemonic, address: i64, len: usize, ops: Vec<Op>) -> Instr {
        Instr {
            address,
            offset: address,
            bytes: vec![0x90; len],
            text: "test insn".into(),
            mnemonic,
            ops,
        }
    }

    fn load(
        action: &CallAction<'_>,
        instr: &Instr,
        arg: Argument,
        num_args: usize,
    ) -> (String, Ty, CallInfo) {
        let mut out = TokenOut::with_capacity(1 << 14);
        let mut info = CallInfo::new(action.clean, false, false, num_args, action.conv.is_before());
        let t = send_load_argument(
            &mut out, &mut info, action.elf, &NoValues, action, &arg, instr, 7, 0,
        )
        .unwrap();
        (out.take_fragment().unwrap(), t, info)
    }

    #[test]
    fn immediate_operand_by_value() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(
            Mnemonic::Other,
            0x1000,
            5,
            vec![Op {
                size: 4,
                access: Access::READ,
                kind: OpKind::Imm(0x7fff_ffff),
            }],
        );
        let (frag, t, _) = load(&action, &i, Argument::new(ArgKind::Imm(0)), 1);
        // movq $0x7fffffff,%rdi
        assert_eq!(frag, "72,199,199,{\"int32\":2147483647},");
        assert_eq!(t, Ty::INT32);
    }

    #[test]
    fn conditional_branch_next_island() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::ConditionalJump);
        let i = instr(
            Mnemonic::Jne,
            0x1000,
            2,
            vec![Op {
                size: 8,
                access: Access::READ,
                kind: OpKind::Imm(20),
            }],
        );
        let (frag, t, _) = load(&action, &i, Argument::new(ArgKind::Next), 1);
        assert_eq!(
            frag,
            "117,{\"rel8\":\".Ltakenrdi\"},\
             72,141,61,{\"rel32\":\".Lcontinue\"},\
             235,{\"rel8\":\".Lnextrdi\"},\
             \".Ltakenrdi\",\
             72,141,61,{\"rel32\":4118},\
             \".Lnextrdi\","
        );
        assert_eq!(t, Ty::CONST | Ty::VOID | Ty::PTR);
    }

    #[test]
    fn next_after_call_is_the_continuation() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::After);
        let i = instr(Mnemonic::Jne, 0x1000, 2, Vec::new());
        let (frag, _, _) = load(&action, &i, Argument::new(ArgKind::Next), 1);
        assert_eq!(frag, "72,141,61,{\"rel32\":\".Lcontinue\"},");
    }

    #[test]
    fn eflags_without_state_synthesises_lahf() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(Mnemonic::Other, 0x1000, 3, Vec::new());
        let (frag, t, _) = load(&action, &i, Argument::new(ArgKind::Register(Reg::Rflags)), 1);
        // rax parked in r11; seto %al; lahf; movzwq %ax,%rdi; rax unparked
        assert_eq!(
            frag,
            "73,137,195,15,144,192,159,72,15,183,248,76,137,216,"
        );
        assert_eq!(t, Ty::INT16);
    }

    #[test]
    fn register_by_pointer_hands_out_the_slot() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(Mnemonic::Other, 0x1000, 3, Vec::new());
        let (frag, t, info) = load(&action, &i, Argument::by_ptr(ArgKind::Register(Reg::Rbx)), 1);
        // push %rbx; lea (%rsp),%rdi — the fresh slot is the stack top
        assert_eq!(frag, "83,72,141,60,36,");
        assert_eq!(t, Ty::INT64 | Ty::PTR);
        assert!(info.is_saved(Reg::Rbx));
    }

    #[test]
    fn after_call_memory_value_fails_safely() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::After);
        let i = instr(
            Mnemonic::Other,
            0x1000,
            4,
            vec![Op {
                size: 4,
                access: Access::READ,
                kind: OpKind::Mem(MemRef {
                    seg: None,
                    base: Some(Reg::Rax),
                    index: None,
                    scale: 1,
                    disp: 0,
                }),
            }],
        );
        let (frag, t, _) = load(&action, &i, Argument::new(ArgKind::MemOp(0)), 1);
        assert_eq!(frag, "72,199,199,{\"int32\":0},");
        assert_eq!(t, Ty::NULL_PTR);
    }

    #[test]
    fn lea_memory_operand_is_never_accessed() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(
            Mnemonic::Lea,
            0x1000,
            4,
            vec![Op {
                size: 8,
                access: Access::NONE,
                kind: OpKind::Mem(MemRef {
                    seg: None,
                    base: Some(Reg::Rax),
                    index: None,
                    scale: 1,
                    disp: 8,
                }),
            }],
        );
        let (_, t, _) = load(&action, &i, Argument::new(ArgKind::MemOp(0)), 1);
        assert_eq!(t, Ty::NULL_PTR);
        // By reference the effective address is still fine.
        let (frag, t, _) = load(&action, &i, Argument::by_ptr(ArgKind::MemOp(0)), 1);
        assert_eq!(frag, "72,141,120,{\"int8\":8},");
        assert_eq!(t, Ty::INT64 | Ty::PTR);
    }

    #[test]
    fn operand_index_out_of_range() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(Mnemonic::Other, 0x1000, 3, Vec::new());
        let (frag, t, _) = load(&action, &i, Argument::new(ArgKind::Src(2)), 1);
        assert_eq!(frag, "72,199,199,{\"int32\":0},");
        assert_eq!(t, Ty::NULL_PTR);
    }

    #[test]
    fn src_selector_counts_read_operands() {
        let read = Op {
            size: 8,
            access: Access::READ,
            kind: OpKind::Reg(Reg::Rbx),
        };
        let write = Op {
            size: 8,
            access: Access::WRITE,
            kind: OpKind::Reg(Reg::Rcx),
        };
        let i = instr(Mnemonic::Other, 0x1000, 3, vec![write, read]);
        assert_eq!(get_operand(&i, 0, OpSel::Src), Some(&read));
        assert_eq!(get_operand(&i, 0, OpSel::Dst), Some(&write));
        assert_eq!(get_operand(&i, 1, OpSel::Src), None);
        assert_eq!(get_operand(&i, 1, OpSel::Any), Some(&read));
    }

    #[test]
    fn displacement_field_is_a_literal() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(
            Mnemonic::Other,
            0x1000,
            4,
            vec![Op {
                size: 8,
                access: Access::READ,
                kind: OpKind::Mem(MemRef {
                    seg: None,
                    base: Some(Reg::Rbp),
                    index: None,
                    scale: 1,
                    disp: -24,
                }),
            }],
        );
        let arg = Argument {
            field: Field::Disp,
            ..Argument::new(ArgKind::MemOp(0))
        };
        let (frag, t, _) = load(&action, &i, arg, 1);
        assert_eq!(frag, "72,199,199,{\"int32\":-24},");
        assert_eq!(t, Ty::INT32);
    }

    #[test]
    fn symbol_through_the_got() {
        let elf = StubElf {
            objects: vec![("errno_location", ObjectAddr::NeedsGot)],
            got: vec![("errno_location", 0x3f20)],
        };
        let action = call_action(&elf, CallConv::Before);
        let i = instr(Mnemonic::Other, 0x1000, 3, Vec::new());
        let (frag, t, _) = load(
            &action,
            &i,
            Argument::new(ArgKind::Symbol("errno_location".into())),
            1,
        );
        // mov 0x3f20(%rip),%rdi
        assert_eq!(frag, "72,139,61,{\"rel32\":16160},");
        assert_eq!(t, Ty::CONST | Ty::VOID | Ty::PTR);
    }

    #[test]
    fn missing_symbol_is_null() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(Mnemonic::Other, 0x1000, 3, Vec::new());
        let (frag, t, _) = load(
            &action,
            &i,
            Argument::new(ArgKind::Symbol("missing".into())),
            1,
        );
        assert_eq!(frag, "72,199,199,{\"int32\":0},");
        assert_eq!(t, Ty::NULL_PTR);
    }

    #[test]
    fn ret_target_reads_the_original_stack_top() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(Mnemonic::Ret, 0x1000, 1, Vec::new());
        let (frag, _, info) = load(&action, &i, Argument::new(ArgKind::Target), 1);
        let mut expect = TokenOut::with_capacity(256);
        emit_mov_stack_r64(&mut expect, info.rsp_offset, Reg::Rdi);
        assert_eq!(frag, expect.take_fragment().unwrap());
    }

    #[test]
    fn too_many_arguments_is_fatal() {
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(Mnemonic::Other, 0x1000, 3, Vec::new());
        let mut out = TokenOut::with_capacity(1 << 12);
        let mut info = CallInfo::new(false, false, false, 8, true);
        let err = send_load_argument(
            &mut out,
            &mut info,
            &elf,
            &NoValues,
            &action,
            &Argument::new(ArgKind::Integer(1)),
            &i,
            0,
            8,
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::TooManyArgs { count: 9 }));
    }

    #[test]
    fn user_lookup_failure_is_fatal() {
        struct Failing;
        impl ValueLookup for Failing {
            fn lookup(&self, _: &Instr, file: &str, _: i64) -> Result<i64, LookupError> {
                Err(LookupError(format!("ambiguous match in \"{file}.csv\"")))
            }
        }
        let elf = StubElf::empty();
        let action = call_action(&elf, CallConv::Before);
        let i = instr(Mnemonic::Other, 0x1000, 3, Vec::new());
        let mut out = TokenOut::with_capacity(1 << 12);
        let mut info = CallInfo::new(false, false, false, 1, true);
        let err = send_load_argument(
            &mut out,
            &mut info,
            &elf,
            &Failing,
            &action,
            &Argument::new(ArgKind::User {
                file: "weights".into(),
                row: 2,
            }),
            &i,
            0,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::Lookup(_)));
    }
}
