//! External collaborator interfaces.
//!
//! The generator consumes already-parsed ELF images and an already-built
//! match engine; both live outside this crate. These traits are the whole
//! surface the core needs from them.

use std::fmt;

use crate::insn::Instr;
use crate::ty::TypeSig;

/// Where a named object lives in an ELF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAddr {
    /// Defined locally at this (link-time) address.
    Addr(i64),
    /// Defined elsewhere; reachable only through the GOT.
    NeedsGot,
    Missing,
}

/// A parsed ELF image: the rewritten binary for `SYMBOL` arguments, or the
/// instrumentation library a call action targets.
pub trait HostElf {
    fn filename(&self) -> &str;

    /// Address of a named data object.
    fn object_address(&self, name: &str) -> ObjectAddr;

    /// Address of the object's GOT slot, if it has one.
    fn got_entry(&self, name: &str) -> Option<i64>;

    /// Address of the function symbol best matching `name` under the given
    /// argument signature, or `None` when nothing matches.
    fn lookup_symbol(&self, name: &str, sig: TypeSig) -> Option<i64>;
}

/// Failure reported by the match engine for a CSV value lookup. Always
/// fatal to the emission.
#[derive(Debug, Clone)]
pub struct LookupError(pub String);

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for LookupError {}

/// The match engine's value side: resolve a `User` argument to the integer
/// stored in the row matching the current instruction.
pub trait ValueLookup {
    fn lookup(&self, instr: &Instr, file: &str, row: i64) -> Result<i64, LookupError>;
}

/// Lookup source for actions with no `User` arguments.
pub struct NoValues;

impl ValueLookup for NoValues {
    fn lookup(&self, _instr: &Instr, file: &str, _row: i64) -> Result<i64, LookupError> {
        Err(LookupError(format!(
            "no value source configured for file \"{file}.csv\""
        )))
    }
}
