//! Per-emission register bookkeeping.
//!
//! One `CallInfo` lives for exactly one action emission. It knows, at every
//! point of the emission, where each register's program-original value is
//! (still live, or in a saved slot), which registers hold values of ours,
//! and how far `%rsp` has moved from trampoline entry.
//!
//! The saved-state block is planned at construction: the trampoline
//! prologue (emitted by the external linker) skips the red zone and pushes
//! the planned slots before any of our fragments run. Registers saved
//! lazily during argument emission append below the planned block.

use crate::regs::{arg_reg, Reg, CALLER_SAVED, SCRATCH_ORDER};

/// Distance the trampoline prologue drops `%rsp` before pushing anything,
/// so the saved-state block never overlaps the program's red zone.
pub const RED_ZONE_SKIP: i32 = 0x4000;

pub struct CallInfo {
    /// Signed delta between trampoline-entry `%rsp` and the current
    /// runtime `%rsp`. Every push recorded here moves it by 8.
    pub rsp_offset: i32,
    /// True when the call runs before the instrumented instruction.
    pub before: bool,
    saved: u32,
    clobbered: u32,
    used: u32,
    pushed: Vec<Reg>,
}

/// Push order of a full-state save. Memory order from the block base is
/// the reverse: flags lowest, then r15 down to rax, with the original
/// `%rsp` on top.
const STATE_PLAN: [Reg; 17] = [
    Reg::Rsp,
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rflags,
];

impl CallInfo {
    pub fn new(clean: bool, state: bool, conditional: bool, num_args: usize, before: bool) -> CallInfo {
        let mut info = CallInfo {
            rsp_offset: RED_ZONE_SKIP,
            before,
            saved: 0,
            clobbered: 0,
            used: 0,
            pushed: Vec::new(),
        };
        if state {
            for reg in STATE_PLAN {
                info.push(reg);
            }
        } else if clean {
            for reg in [
                Reg::Rax,
                Reg::Rcx,
                Reg::Rdx,
                Reg::Rsi,
                Reg::Rdi,
                Reg::R8,
                Reg::R9,
                Reg::R10,
                Reg::R11,
                Reg::Rflags,
            ] {
                info.push(reg);
            }
        } else {
            if conditional {
                info.push(Reg::Rax);
            }
            for argno in 0..num_args {
                if let Some(reg) = arg_reg(argno) {
                    if !info.is_saved(reg) {
                        info.push(reg);
                    }
                }
            }
        }
        info
    }

    fn bit(reg: Reg) -> u32 {
        match reg.slot_index() {
            Some(idx) => 1 << idx,
            None => 0,
        }
    }

    /// The 8-byte slot at [`get_offset`](Self::get_offset) holds this
    /// register's program-original value.
    pub fn is_saved(&self, reg: Reg) -> bool {
        self.saved & Self::bit(reg) != 0
    }

    /// The register's live value is no longer the program's.
    pub fn is_clobbered(&self, reg: Reg) -> bool {
        self.clobbered & Self::bit(reg) != 0
    }

    /// The register holds a value later emission reads; scratch allocation
    /// must not hand it out.
    pub fn is_used(&self, reg: Reg) -> bool {
        self.used & Self::bit(reg) != 0
    }

    pub fn is_caller_save(&self, reg: Reg) -> bool {
        reg.is_caller_save()
    }

    pub fn clobber(&mut self, reg: Reg) {
        self.clobbered |= Self::bit(reg);
    }

    pub fn use_reg(&mut self, reg: Reg) {
        self.used |= Self::bit(reg);
    }

    /// The register holds its program-original value again.
    pub fn restore(&mut self, reg: Reg) {
        self.clobbered &= !Self::bit(reg);
        self.used |= Self::bit(reg);
    }

    /// Record a push of `reg`'s original value onto the saved-state stack.
    pub fn push(&mut self, reg: Reg) {
        let reg = reg.canonical();
        debug_assert!(!self.is_saved(reg), "{reg} already saved");
        self.saved |= Self::bit(reg);
        self.pushed.push(reg);
        self.rsp_offset += 8;
    }

    /// Next register to restore, in LIFO order. The epilogue driver pops
    /// `%rsp` last itself.
    pub fn pop(&mut self) -> Option<Reg> {
        self.pushed.pop()
    }

    /// Offset of `reg`'s saved slot relative to the current `%rsp`.
    pub fn get_offset(&self, reg: Reg) -> i32 {
        let reg = reg.canonical();
        let pos = self
            .pushed
            .iter()
            .position(|&r| r == reg)
            .expect("offset of unsaved register");
        self.rsp_offset - RED_ZONE_SKIP - 8 * (pos as i32 + 1)
    }

    /// A caller-save register whose current value may be discarded: not
    /// excluded, not holding one of our live values, not displaced. `None`
    /// when every candidate is taken (callers then spill to the red zone).
    pub fn get_scratch(&self, exclude: &[Reg]) -> Option<Reg> {
        let excluded = |r: Reg| exclude.iter().any(|&e| e.canonical() == r);
        SCRATCH_ORDER
            .into_iter()
            .find(|&r| !excluded(r) && !self.is_clobbered(r) && !self.is_used(r))
    }

    /// Scratch for the restore epilogue. After the call every caller-save
    /// register is clobbered, so the strict rule would find nothing; here a
    /// register only needs to hold no *live* value to be expendable.
    pub fn get_scratch_after_call(&self, exclude: &[Reg]) -> Option<Reg> {
        let excluded = |r: Reg| exclude.iter().any(|&e| e.canonical() == r);
        SCRATCH_ORDER
            .into_iter()
            .find(|&r| !excluded(r) && !self.is_used(r))
    }

    /// Account for the called function: every caller-save register must be
    /// assumed clobbered. A conditional call's predicate result stays live
    /// in `%rax`, and its flags remain meaningful to the trampoline.
    pub fn call(&mut self, conditional: bool) {
        for reg in CALLER_SAVED {
            self.clobber(reg);
            self.used &= !Self::bit(reg);
        }
        if conditional {
            self.use_reg(Reg::Rax);
        } else {
            self.clobber(Reg::Rflags);
            self.used &= !Self::bit(Reg::Rflags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_plan_puts_flags_lowest() {
        let info = CallInfo::new(false, true, false, 2, true);
        assert_eq!(info.get_offset(Reg::Rflags), 0);
        assert_eq!(info.get_offset(Reg::R15), 8);
        assert_eq!(info.get_offset(Reg::Rax), 8 * 15);
        assert_eq!(info.get_offset(Reg::Rsp), 8 * 16);
        assert_eq!(info.rsp_offset, RED_ZONE_SKIP + 8 * 17);
    }

    #[test]
    fn minimal_plan_covers_arg_registers() {
        let mut info = CallInfo::new(false, false, false, 2, true);
        assert!(info.is_saved(Reg::Rdi));
        assert!(info.is_saved(Reg::Rsi));
        assert!(!info.is_saved(Reg::Rdx));
        assert!(!info.is_saved(Reg::Rflags));
        // Lazy saves land below the planned block.
        info.push(Reg::Rbx);
        assert_eq!(info.get_offset(Reg::Rbx), 0);
        assert_eq!(info.get_offset(Reg::Rsi), 8);
        assert_eq!(info.get_offset(Reg::Rdi), 16);
    }

    #[test]
    fn offsets_track_later_pushes() {
        let mut info = CallInfo::new(false, false, false, 1, true);
        let before = info.get_offset(Reg::Rdi);
        info.push(Reg::Rbx);
        // rdi's slot address is fixed; the offset grows with the stack.
        assert_eq!(info.get_offset(Reg::Rdi), before + 8);
    }

    #[test]
    fn lifo_drain_ends_with_first_push() {
        let mut info = CallInfo::new(false, false, false, 2, true);
        info.push(Reg::Rbx);
        assert_eq!(info.pop(), Some(Reg::Rbx));
        assert_eq!(info.pop(), Some(Reg::Rsi));
        assert_eq!(info.pop(), Some(Reg::Rdi));
        assert_eq!(info.pop(), None);
    }

    #[test]
    fn scratch_skips_excluded_and_live() {
        let mut info = CallInfo::new(false, false, false, 0, true);
        assert_eq!(info.get_scratch(&[]), Some(Reg::Rax));
        assert_eq!(info.get_scratch(&[Reg::Rax]), Some(Reg::R11));
        info.clobber(Reg::R11);
        assert_eq!(info.get_scratch(&[Reg::Rax]), Some(Reg::R10));
        info.use_reg(Reg::R10);
        assert_eq!(info.get_scratch(&[Reg::Rax]), Some(Reg::R9));
        // Sub-register exclusion works through canonicalisation.
        assert_eq!(info.get_scratch(&[Reg::Rax, Reg::R9d]), Some(Reg::R8));
    }

    #[test]
    fn scratch_exhaustion_returns_none() {
        let mut info = CallInfo::new(false, false, false, 0, true);
        for reg in SCRATCH_ORDER {
            info.use_reg(reg);
        }
        assert_eq!(info.get_scratch(&[]), None);
    }

    #[test]
    fn call_marks_caller_saves() {
        let mut info = CallInfo::new(false, false, false, 1, true);
        info.use_reg(Reg::Rdi);
        info.call(false);
        assert!(info.is_caller_save(Reg::R11));
        assert!(!info.is_caller_save(Reg::Rbx));
        assert!(info.is_clobbered(Reg::R11));
        assert!(info.is_clobbered(Reg::Rflags));
        assert!(!info.is_used(Reg::Rdi));
        assert!(!info.is_clobbered(Reg::Rbx));
    }

    #[test]
    fn conditional_call_keeps_rax_live() {
        let mut info = CallInfo::new(false, false, true, 0, true);
        info.call(true);
        assert!(info.is_used(Reg::Rax));
        assert!(!info.is_clobbered(Reg::Rflags));
    }

    #[test]
    fn epilogue_scratch_ignores_clobbers() {
        let mut info = CallInfo::new(true, false, true, 1, true);
        info.call(true);
        // Everything caller-save is clobbered now, but only %rax is live.
        assert_eq!(info.get_scratch(&[]), None);
        assert_eq!(info.get_scratch_after_call(&[]), Some(Reg::R11));
    }
}
