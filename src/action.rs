//! User-declared instrumentation actions.
//!
//! The match/config frontend decides *which* instructions receive an
//! action; this model describes *what* the action does. Only `Print` and
//! `Call` produce metadata; the pass-through variants exist so callers can
//! hand every action through the same entry point.

use crate::host::HostElf;
use crate::insn::MemRef;
use crate::regs::Reg;

/// Calling discipline of a `Call` action relative to the instrumented
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    Before,
    After,
    /// Call before; the callee's return value decides whether the
    /// instruction executes.
    Conditional,
    /// Call before; the callee's return value decides whether a jump is
    /// taken.
    ConditionalJump,
}

impl CallConv {
    pub fn is_before(self) -> bool {
        !matches!(self, CallConv::After)
    }

    pub fn is_conditional(self) -> bool {
        matches!(self, CallConv::Conditional | CallConv::ConditionalJump)
    }
}

/// Sub-component selector for operand arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Field {
    #[default]
    None,
    Base,
    Index,
    Scale,
    Disp,
    Size,
    Type,
    Access,
}

impl Field {
    /// Selector name as it appears in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Field::None => "value",
            Field::Base => "base",
            Field::Index => "index",
            Field::Scale => "scale",
            Field::Disp => "displacement",
            Field::Size => "size",
            Field::Type => "type",
            Field::Access => "access",
        }
    }
}

/// One value to load before calling the instrumentation function.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    /// Row lookup against a user-supplied CSV through the match engine.
    User { file: String, row: i64 },
    Integer(i64),
    Random,
    /// File offset of the instrumented instruction.
    Offset,
    /// Runtime address of the instrumented instruction.
    Addr,
    /// Link-time address of the instrumented instruction.
    StaticAddr,
    /// Runtime image base of the rewritten binary.
    Base,
    /// Runtime address of the trampoline entry.
    Trampoline,
    /// Caller-supplied action identifier.
    Id,
    /// Address of the next instruction the CPU will execute.
    Next,
    /// Disassembly text of the instruction.
    Asm,
    AsmSize,
    AsmLen,
    /// Raw bytes of the instruction.
    Bytes,
    BytesSize,
    /// Jump/call/return destination.
    Target,
    Register(Reg),
    /// Pointer to the whole saved-register block.
    State,
    /// Address of a named object in the rewritten binary.
    Symbol(String),
    /// A literal memory operand spelled out by the user.
    Memory { size: u8, mem: MemRef },
    /// The `value`-th operand, any type.
    Op(usize),
    /// The `value`-th read operand.
    Src(usize),
    /// The `value`-th written operand.
    Dst(usize),
    /// The `value`-th immediate operand.
    Imm(usize),
    /// The `value`-th register operand.
    RegOp(usize),
    /// The `value`-th memory operand.
    MemOp(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub kind: ArgKind,
    /// Pass by reference instead of by value.
    pub ptr: bool,
    pub field: Field,
    /// The same data blob is emitted by an earlier argument; skip the data
    /// section for this one.
    pub duplicate: bool,
}

impl Argument {
    pub fn new(kind: ArgKind) -> Argument {
        Argument {
            kind,
            ptr: false,
            field: Field::None,
            duplicate: false,
        }
    }

    pub fn by_ptr(kind: ArgKind) -> Argument {
        Argument {
            ptr: true,
            ..Argument::new(kind)
        }
    }
}

/// A call action: invoke `symbol` from the instrumentation binary `elf`
/// with `args`, under the given discipline.
pub struct CallAction<'e> {
    pub elf: &'e dyn HostElf,
    pub symbol: String,
    pub conv: CallConv,
    /// Save the full caller-save set rather than only what gets clobbered.
    pub clean: bool,
    pub args: Vec<Argument>,
}

/// A user-declared transformation. Variants other than `Print` and `Call`
/// produce no metadata.
pub enum Action<'e> {
    Print,
    Call(CallAction<'e>),
    Passthru,
    Exit,
    Trap,
    Plugin,
}
