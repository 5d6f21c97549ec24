//! x86-64 register model.
//!
//! Every general-purpose register is represented at each of its widths,
//! plus the instruction pointer, the flags register and the two segment
//! registers that can carry a non-zero base (`%fs`/`%gs`). Bookkeeping
//! (CallInfo) works on canonical 64-bit forms; encoders work on hardware
//! numbers.

use std::fmt;

use crate::ty::Ty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Al,
    Ah,
    Ax,
    Eax,
    Rax,
    Cl,
    Ch,
    Cx,
    Ecx,
    Rcx,
    Dl,
    Dh,
    Dx,
    Edx,
    Rdx,
    Bl,
    Bh,
    Bx,
    Ebx,
    Rbx,
    Spl,
    Sp,
    Esp,
    Rsp,
    Bpl,
    Bp,
    Ebp,
    Rbp,
    Sil,
    Si,
    Esi,
    Rsi,
    Dil,
    Di,
    Edi,
    Rdi,
    R8b,
    R8w,
    R8d,
    R8,
    R9b,
    R9w,
    R9d,
    R9,
    R10b,
    R10w,
    R10d,
    R10,
    R11b,
    R11w,
    R11d,
    R11,
    R12b,
    R12w,
    R12d,
    R12,
    R13b,
    R13w,
    R13d,
    R13,
    R14b,
    R14w,
    R14d,
    R14,
    R15b,
    R15w,
    R15d,
    R15,
    Eip,
    Rip,
    Rflags,
    Fs,
    Gs,
}

/// System V AMD64 argument registers, in argument order. The first six are
/// the ABI registers proper; arguments 6 and 7 are staged in `%r10`/`%r11`
/// and pushed onto the stack before the call.
pub const ARG_REGS: [Reg; 8] = [
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rdx,
    Reg::Rcx,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// Number of arguments the ABI passes in registers.
pub const NUM_REG_ARGS: usize = 6;

pub const CALLER_SAVED: [Reg; 9] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

pub const CALLEE_SAVED: [Reg; 6] = [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Scratch allocation order. Registers unlikely to be argument slots come
/// first so loaded arguments survive as long as possible.
pub const SCRATCH_ORDER: [Reg; 9] = [
    Reg::Rax,
    Reg::R11,
    Reg::R10,
    Reg::R9,
    Reg::R8,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
];

/// The register that carries argument `argno`, or `None` past the maximum.
pub fn arg_reg(argno: usize) -> Option<Reg> {
    ARG_REGS.get(argno).copied()
}

impl Reg {
    /// The canonical 64-bit form (`%eax` -> `%rax`, `%ah` -> `%rax`, ...).
    /// Non-GPRs map to themselves, except `%eip` -> `%rip`.
    pub fn canonical(self) -> Reg {
        use Reg::*;
        match self {
            Al | Ah | Ax | Eax | Rax => Rax,
            Cl | Ch | Cx | Ecx | Rcx => Rcx,
            Dl | Dh | Dx | Edx | Rdx => Rdx,
            Bl | Bh | Bx | Ebx | Rbx => Rbx,
            Spl | Sp | Esp | Rsp => Rsp,
            Bpl | Bp | Ebp | Rbp => Rbp,
            Sil | Si | Esi | Rsi => Rsi,
            Dil | Di | Edi | Rdi => Rdi,
            R8b | R8w | R8d | R8 => R8,
            R9b | R9w | R9d | R9 => R9,
            R10b | R10w | R10d | R10 => R10,
            R11b | R11w | R11d | R11 => R11,
            R12b | R12w | R12d | R12 => R12,
            R13b | R13w | R13d | R13 => R13,
            R14b | R14w | R14d | R14 => R14,
            R15b | R15w | R15d | R15 => R15,
            Eip | Rip => Rip,
            Rflags => Rflags,
            Fs => Fs,
            Gs => Gs,
        }
    }

    /// Width in bytes.
    pub fn size(self) -> usize {
        use Reg::*;
        match self {
            Al | Ah | Cl | Ch | Dl | Dh | Bl | Bh | Spl | Bpl | Sil | Dil | R8b | R9b | R10b
            | R11b | R12b | R13b | R14b | R15b => 1,
            Ax | Cx | Dx | Bx | Sp | Bp | Si | Di | R8w | R9w | R10w | R11w | R12w | R13w | R14w
            | R15w | Fs | Gs | Rflags => 2,
            Eax | Ecx | Edx | Ebx | Esp | Ebp | Esi | Edi | R8d | R9d | R10d | R11d | R12d
            | R13d | R14d | R15d | Eip => 4,
            _ => 8,
        }
    }

    /// True for the legacy high-byte registers `%ah`/`%ch`/`%dh`/`%bh`.
    pub fn is_high(self) -> bool {
        matches!(self, Reg::Ah | Reg::Ch | Reg::Dh | Reg::Bh)
    }

    /// Hardware register number 0..=15 of the canonical form, or `None`
    /// for `%rip`, `%rflags` and segment registers.
    pub fn hw(self) -> Option<u8> {
        use Reg::*;
        let n = match self.canonical() {
            Rax => 0,
            Rcx => 1,
            Rdx => 2,
            Rbx => 3,
            Rsp => 4,
            Rbp => 5,
            Rsi => 6,
            Rdi => 7,
            R8 => 8,
            R9 => 9,
            R10 => 10,
            R11 => 11,
            R12 => 12,
            R13 => 13,
            R14 => 14,
            R15 => 15,
            _ => return None,
        };
        Some(n)
    }

    /// True when the canonical form is one of `%r8`..`%r15` (needs a REX
    /// extension bit wherever it is encoded).
    pub fn is_ext(self) -> bool {
        matches!(self.hw(), Some(n) if n >= 8)
    }

    /// True for 32-bit forms (including `%eip`); a memory operand using one
    /// as base or index needs the 0x67 address-size prefix.
    pub fn is_addr32(self) -> bool {
        self.size() == 4
    }

    /// Bit position in CallInfo's saved/clobbered/used masks, or `None`
    /// for segment registers.
    pub fn slot_index(self) -> Option<u8> {
        use Reg::*;
        let n = match self.canonical() {
            Rdi => 0,
            Rsi => 1,
            Rdx => 2,
            Rcx => 3,
            R8 => 4,
            R9 => 5,
            R10 => 6,
            R11 => 7,
            Rax => 8,
            Rbx => 9,
            Rbp => 10,
            R12 => 11,
            R13 => 12,
            R14 => 13,
            R15 => 14,
            Rflags => 15,
            Rsp => 16,
            Rip => 17,
            Fs | Gs => return None,
            _ => unreachable!(),
        };
        Some(n)
    }

    /// ABI categorisation: true if a called function may clobber this
    /// register. The flags register counts as caller-save.
    pub fn is_caller_save(self) -> bool {
        CALLER_SAVED.contains(&self.canonical()) || self.canonical() == Reg::Rflags
    }

    /// The value type a read of this register produces.
    pub fn ty(self) -> Ty {
        match self {
            Reg::Rflags => Ty::INT16,
            Reg::Fs | Reg::Gs => Ty::INT16,
            r => match r.size() {
                1 => Ty::INT8,
                2 => Ty::INT16,
                4 => Ty::INT32,
                _ => Ty::INT64,
            },
        }
    }

    /// AT&T-style name without the `%` sigil.
    pub fn name(self) -> &'static str {
        use Reg::*;
        match self {
            Al => "al",
            Ah => "ah",
            Ax => "ax",
            Eax => "eax",
            Rax => "rax",
            Cl => "cl",
            Ch => "ch",
            Cx => "cx",
            Ecx => "ecx",
            Rcx => "rcx",
            Dl => "dl",
            Dh => "dh",
            Dx => "dx",
            Edx => "edx",
            Rdx => "rdx",
            Bl => "bl",
            Bh => "bh",
            Bx => "bx",
            Ebx => "ebx",
            Rbx => "rbx",
            Spl => "spl",
            Sp => "sp",
            Esp => "esp",
            Rsp => "rsp",
            Bpl => "bpl",
            Bp => "bp",
            Ebp => "ebp",
            Rbp => "rbp",
            Sil => "sil",
            Si => "si",
            Esi => "esi",
            Rsi => "rsi",
            Dil => "dil",
            Di => "di",
            Edi => "edi",
            Rdi => "rdi",
            R8b => "r8b",
            R8w => "r8w",
            R8d => "r8d",
            R8 => "r8",
            R9b => "r9b",
            R9w => "r9w",
            R9d => "r9d",
            R9 => "r9",
            R10b => "r10b",
            R10w => "r10w",
            R10d => "r10d",
            R10 => "r10",
            R11b => "r11b",
            R11w => "r11w",
            R11d => "r11d",
            R11 => "r11",
            R12b => "r12b",
            R12w => "r12w",
            R12d => "r12d",
            R12 => "r12",
            R13b => "r13b",
            R13w => "r13w",
            R13d => "r13d",
            R13 => "r13",
            R14b => "r14b",
            R14w => "r14w",
            R14d => "r14d",
            R14 => "r14",
            R15b => "r15b",
            R15w => "r15w",
            R15d => "r15d",
            R15 => "r15",
            Eip => "eip",
            Rip => "rip",
            Rflags => "rflags",
            Fs => "fs",
            Gs => "gs",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_widths() {
        assert_eq!(Reg::Ah.canonical(), Reg::Rax);
        assert_eq!(Reg::R13d.canonical(), Reg::R13);
        assert_eq!(Reg::Eip.canonical(), Reg::Rip);
        assert_eq!(Reg::Spl.size(), 1);
        assert_eq!(Reg::R11w.size(), 2);
        assert_eq!(Reg::Esi.size(), 4);
        assert_eq!(Reg::R9.size(), 8);
    }

    #[test]
    fn hardware_numbers() {
        assert_eq!(Reg::Rax.hw(), Some(0));
        assert_eq!(Reg::Rsp.hw(), Some(4));
        assert_eq!(Reg::Dil.hw(), Some(7));
        assert_eq!(Reg::R12d.hw(), Some(12));
        assert_eq!(Reg::Rip.hw(), None);
        assert!(Reg::R8b.is_ext());
        assert!(!Reg::Rbp.is_ext());
    }

    #[test]
    fn abi_sets() {
        assert!(Reg::R11.is_caller_save());
        assert!(Reg::Rflags.is_caller_save());
        assert!(!Reg::R12.is_caller_save());
        assert_eq!(arg_reg(0), Some(Reg::Rdi));
        assert_eq!(arg_reg(6), Some(Reg::R10));
        assert_eq!(arg_reg(8), None);
    }

    #[test]
    fn slot_indices_are_distinct() {
        let mut seen = 0u32;
        for r in CALLER_SAVED
            .iter()
            .chain(CALLEE_SAVED.iter())
            .chain([Reg::Rflags, Reg::Rsp, Reg::Rip].iter())
        {
            let idx = r.slot_index().unwrap();
            assert_eq!(seen & (1 << idx), 0, "duplicate slot for {r}");
            seen |= 1 << idx;
        }
        assert_eq!(seen, 0x3ffff);
    }
}
