// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Saved user register state
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, NREGS, SP, FAKE_RETURN_PC
//! DEPENDS_ON: -
//! INVARIANTS: r0 carries syscall results; r1..r3 carry syscall arguments; r7 is the stack pointer

/// General-purpose registers of the user machine.
pub const NREGS: usize = 8;
/// Index of the stack-pointer register.
pub const SP: usize = 7;
/// Return address planted below `main` and thread entry points; returning to it faults.
pub const FAKE_RETURN_PC: u32 = 0xffff_ffff;

/// Registers saved on entry to the kernel and restored on return to user mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: [u32; NREGS],
    pub pc: u32,
}

impl TrapFrame {
    /// Frame for a fresh image: everything zero except `pc` and `sp`.
    pub fn entry(pc: usize, sp: usize) -> Self {
        let mut frame = Self { pc: pc as u32, ..Self::default() };
        frame.regs[SP] = sp as u32;
        frame
    }

    #[inline]
    pub fn sp(&self) -> u32 {
        self.regs[SP]
    }

    /// Syscall argument `n` (0-based) from r1..r3.
    #[inline]
    pub fn arg(&self, n: usize) -> u32 {
        self.regs.get(n + 1).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set_return(&mut self, value: u32) {
        self.regs[0] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_frame_sets_pc_and_sp_only() {
        let frame = TrapFrame::entry(0x40, 0x2000);
        assert_eq!(frame.pc, 0x40);
        assert_eq!(frame.sp(), 0x2000);
        assert_eq!(frame.regs[..SP], [0; SP]);
    }

    #[test]
    fn args_come_from_r1_to_r3() {
        let mut frame = TrapFrame::default();
        frame.regs[1] = 10;
        frame.regs[3] = 30;
        assert_eq!(frame.arg(0), 10);
        assert_eq!(frame.arg(2), 30);
        assert_eq!(frame.arg(7), 0);
    }
}
