//! Top-level metadata assembly.
//!
//! Drives the argument materialiser across a whole action and packages the
//! result as named fragments the trampoline linker splices into its
//! template: `loadArgs`, `function`, `restoreState`, `restoreRSP` and
//! `data` for calls, `asmStr`/`asmStrLen` for prints.

use crate::action::{Action, ArgKind, Argument, CallAction, CallConv};
use crate::args::{get_operand, send_load_argument, OpSel};
use crate::callinfo::{CallInfo, RED_ZONE_SKIP};
use crate::encode::{emit_mov_stack_r64, emit_pop_reg, emit_push_reg};
use crate::host::ValueLookup;
use crate::insn::{Instr, OpKind};
use crate::regs::{arg_reg, Reg, CALLEE_SAVED, NUM_REG_ARGS};
use crate::token::TokenOut;
use crate::ty::{symbol_string, TypeSig};
use crate::{BuildError, HostElf};

/// One named fragment of emitted code or data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub name: &'static str,
    pub data: String,
}

/// Everything the trampoline linker needs for one action at one
/// instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub fragments: Vec<Fragment>,
}

impl Metadata {
    fn push(&mut self, name: &'static str, data: String) {
        self.fragments.push(Fragment { name, data });
    }

    /// Fragment contents by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fragments
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.data.as_str())
    }
}

/// Build the metadata for one `(instruction, action)` pair. Pass-through
/// action kinds produce `None`. `cap` bounds the emission buffer; running
/// out is fatal for this emission.
pub fn build_metadata(
    host: &dyn HostElf,
    values: &dyn ValueLookup,
    action: &Action<'_>,
    instr: &Instr,
    id: i64,
    cap: usize,
) -> Result<Option<Metadata>, BuildError> {
    let call = match action {
        Action::Exit | Action::Passthru | Action::Plugin | Action::Trap => return Ok(None),
        Action::Print => {
            let mut out = TokenOut::with_capacity(cap);
            let mut md = Metadata::default();
            out.quoted(&instr.text, true);
            md.push("asmStr", out.take_fragment()?);
            out.int32_bare(instr.text.len() as i64 + 1);
            md.push("asmStrLen", out.take_fragment()?);
            return Ok(Some(md));
        }
        Action::Call(call) => call,
    };

    let mut out = TokenOut::with_capacity(cap);
    let mut md = Metadata::default();

    let state = call.args.iter().any(|a| a.kind == ArgKind::State);
    let conditional = call.conv.is_conditional();
    let before = call.conv.is_before();
    let mut info = CallInfo::new(call.clean, state, conditional, call.args.len(), before);

    // Load every argument, accumulating the call signature.
    let mut sig = TypeSig::EMPTY;
    for (argno, arg) in call.args.iter().enumerate() {
        let t = send_load_argument(&mut out, &mut info, host, values, call, arg, instr, id, argno)?;
        sig = sig.with(t, argno);
    }

    // Arguments past the ABI registers go onto the stack, last first.
    let mut rsp_args_offset: i32 = 0;
    for argno in (0..call.args.len()).rev() {
        if argno >= NUM_REG_ARGS {
            let reg = arg_reg(argno).expect("staged argument register");
            emit_push_reg(&mut out, info.rsp_offset, before, reg, None);
            rsp_args_offset += 8;
        }
    }

    // A minimal call must hand the callee intact callee-save registers.
    if !call.clean {
        for reg in CALLEE_SAVED {
            if info.is_clobbered(reg) {
                emit_mov_stack_r64(&mut out, rsp_args_offset + info.get_offset(reg), reg);
                info.restore(reg);
            }
        }
    }
    md.push("loadArgs", out.take_fragment()?);

    // Resolve and reference the instrumentation function; the linker
    // prepends the call opcode itself.
    let addr = call.elf.lookup_symbol(&call.symbol, sig);
    match addr {
        Some(addr) if (0..=i32::MAX as i64).contains(&addr) => out.rel32_bare(addr),
        _ => {
            return Err(BuildError::Symbol {
                symbol: symbol_string(&call.symbol, sig),
                binary: call.elf.filename().to_string(),
            });
        }
    }
    md.push("function", out.take_fragment()?);
    info.call(conditional);

    // Epilogue: drop stack arguments, then restore in LIFO order.
    if rsp_args_offset != 0 {
        // lea rsp_args_offset(%rsp),%rsp
        out.bytes(&[0x48, 0x8d, 0xa4, 0x24]);
        out.int32(rsp_args_offset as i64);
    }
    let mut pop_rsp = false;
    while let Some(reg) = info.pop() {
        if reg == Reg::Rsp {
            // Restoring %rsp changes where every later slot lives, so it
            // is always popped last, from the restoreRSP fragment.
            pop_rsp = true;
            continue;
        }
        let preserve_rax = info.is_used(Reg::Rax);
        let scratch = if preserve_rax {
            info.get_scratch_after_call(&[])
        } else {
            None
        };
        if emit_pop_reg(&mut out, preserve_rax, reg, scratch) {
            info.clobber(scratch.expect("pop used a scratch"));
        }
    }
    md.push("restoreState", out.take_fragment()?);

    if pop_rsp {
        emit_pop_reg(&mut out, false, Reg::Rsp, None);
    } else {
        // lea RED_ZONE_SKIP(%rsp),%rsp
        out.bytes(&[0x48, 0x8d, 0xa4, 0x24]);
        out.int32(RED_ZONE_SKIP as i64);
    }
    md.push("restoreRSP", out.take_fragment()?);

    // Argument data sections.
    for (argno, arg) in call.args.iter().enumerate() {
        send_argument_data(&mut out, arg, instr, argno);
    }
    md.push("data", out.take_fragment()?);

    Ok(Some(md))
}

/// Emit the labelled data blob an argument's load refers to, if it needs
/// one.
fn send_argument_data(out: &mut TokenOut, arg: &Argument, instr: &Instr, argno: usize) {
    match &arg.kind {
        ArgKind::Asm => {
            if arg.duplicate {
                return;
            }
            out.label(".LasmStr");
            out.string(&instr.text);
        }
        ArgKind::Bytes => {
            if arg.duplicate {
                return;
            }
            out.label(".Lbytes");
            out.bytes(&instr.bytes);
        }
        ArgKind::Op(idx)
        | ArgKind::Src(idx)
        | ArgKind::Dst(idx)
        | ArgKind::Imm(idx)
        | ArgKind::RegOp(idx)
        | ArgKind::MemOp(idx) => {
            if !arg.ptr {
                return;
            }
            let sel = match arg.kind {
                ArgKind::Src(_) => OpSel::Src,
                ArgKind::Dst(_) => OpSel::Dst,
                ArgKind::Imm(_) => OpSel::Imm,
                ArgKind::RegOp(_) => OpSel::Reg,
                ArgKind::MemOp(_) => OpSel::Mem,
                _ => OpSel::Any,
            };
            let Some(op) = get_operand(instr, *idx, sel) else {
                return;
            };
            if let OpKind::Imm(v) = op.kind {
                out.label(&format!(".Limmediate_{argno}"));
                match op.size {
                    1 => out.int8(v),
                    2 => out.int16(v),
                    4 => out.int32(v),
                    _ => out.int64(v),
                }
            }
        }
        _ => {}
    }
}
