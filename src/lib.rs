//! Instrumentation code generator for an x86-64 ELF binary rewriter.
//!
//! Given one decoded instruction and one user-declared action ("call
//! function F with these arguments around this instruction"), `graft`
//! synthesises the trampoline fragments that load the requested values
//! into calling-convention registers while keeping the original program
//! state recoverable: register bookkeeping, stack compensation, transient
//! save/restore, and the byte-exact ModR/M/SIB/REX encodings that entails.
//!
//! Emission is not raw machine code but a token stream (decimal bytes plus
//! small JSON escapes for relocations and labels) that the external
//! trampoline linker resolves and splices into the patched binary. ELF
//! parsing, disassembly, matching and patching all live outside this
//! crate; see [`host`] for the collaborator traits.
//!
//! The entry point is [`build_metadata`].

pub mod action;
pub mod args;
pub mod callinfo;
pub mod encode;
pub mod host;
pub mod insn;
pub mod memop;
pub mod meta;
pub mod regs;
pub mod token;
pub mod ty;

use std::fmt;

pub use action::{Action, ArgKind, Argument, CallAction, CallConv, Field};
pub use host::{HostElf, LookupError, ObjectAddr, ValueLookup};
pub use insn::{Access, Instr, MemRef, Mnemonic, Op, OpKind};
pub use meta::{build_metadata, Fragment, Metadata};
pub use regs::Reg;
pub use ty::{Ty, TypeSig};

/// A reasonable emission-buffer bound for one action.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1 << 16;

/// Fatal emission failures. Everything local (unencodable operands,
/// missing symbols for argument sources, out-of-range indices) degrades to
/// a warning plus a null argument instead; these are the conditions the
/// caller must not patch over.
#[derive(Debug)]
pub enum BuildError {
    /// The output buffer filled up mid-emission.
    Stream { cap: usize },
    /// More arguments than the calling convention can stage.
    TooManyArgs { count: usize },
    /// The call target did not resolve to a reachable address.
    Symbol { symbol: String, binary: String },
    /// The match engine could not produce a value for a `User` argument.
    Lookup(LookupError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Stream { cap } => {
                write!(f, "metadata stream overflowed its {cap}-byte buffer")
            }
            BuildError::TooManyArgs { count } => {
                write!(
                    f,
                    "call instrumentation with {count} arguments exceeds the maximum of 8"
                )
            }
            BuildError::Symbol { symbol, binary } => {
                write!(
                    f,
                    "no symbol matching \"{symbol}\" found in binary \"{binary}\""
                )
            }
            BuildError::Lookup(e) => write!(f, "value lookup failed: {e}"),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::Lookup(e) => Some(e),
            _ => None,
        }
    }
}
