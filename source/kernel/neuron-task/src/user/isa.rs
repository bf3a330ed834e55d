// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Word-oriented user instruction set executed by the CPU loop.
//!
//! Every instruction is 8 bytes: `op, a, b, 0, imm (u32 LE)`. Branch and call targets are
//! absolute. `sys imm` traps into the kernel with `pc` already advanced past it.

use crate::mm::{AddressSpaceError, AddressSpaceManager, AsHandle};
use crate::trap::{TrapFrame, NREGS, SP};

pub const INSN_SIZE: usize = 8;

/// Register operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg(u8);

impl Reg {
    pub const R0: Self = Self(0);
    pub const R1: Self = Self(1);
    pub const R2: Self = Self(2);
    pub const R3: Self = Self(3);
    pub const R4: Self = Self(4);
    pub const R5: Self = Self(5);
    pub const R6: Self = Self(6);
    pub const SP: Self = Self(SP as u8);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Nop = 0x00,
    /// `a = imm`
    Li = 0x01,
    /// `a = b`
    Mov = 0x02,
    /// `a += b`
    Add = 0x03,
    /// `a += imm`
    Addi = 0x04,
    /// `a -= b`
    Sub = 0x05,
    /// `a = [b + imm]`
    Ld = 0x06,
    /// `[b + imm] = a`
    St = 0x07,
    /// `a = fetch_add([b + imm], a)`
    Xadd = 0x08,
    Jmp = 0x09,
    /// jump if `a == 0`
    Jz = 0x0a,
    /// jump if `a != 0`
    Jnz = 0x0b,
    /// jump if `a < b` (unsigned)
    Blt = 0x0c,
    /// jump if `a == b`
    Beq = 0x0d,
    Call = 0x0e,
    Ret = 0x0f,
    Push = 0x10,
    Pop = 0x11,
    Sys = 0x12,
}

impl Opcode {
    fn from_u8(raw: u8) -> Option<Self> {
        use Opcode::*;
        const ALL: [Opcode; 19] =
            [Nop, Li, Mov, Add, Addi, Sub, Ld, St, Xadd, Jmp, Jz, Jnz, Blt, Beq, Call, Ret, Push, Pop, Sys];
        ALL.get(raw as usize).copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Insn {
    pub op: Opcode,
    pub a: Reg,
    pub b: Reg,
    pub imm: u32,
}

impl Insn {
    pub fn new(op: Opcode, a: Reg, b: Reg, imm: u32) -> Self {
        Self { op, a, b, imm }
    }

    pub fn encode(&self) -> [u8; INSN_SIZE] {
        let imm = self.imm.to_le_bytes();
        [self.op as u8, self.a.0, self.b.0, 0, imm[0], imm[1], imm[2], imm[3]]
    }

    pub fn decode(bytes: [u8; INSN_SIZE]) -> Option<Self> {
        let op = Opcode::from_u8(bytes[0])?;
        if bytes[1] as usize >= NREGS || bytes[2] as usize >= NREGS || bytes[3] != 0 {
            return None;
        }
        let imm = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Some(Self { op, a: Reg(bytes[1]), b: Reg(bytes[2]), imm })
    }
}

/// Why user execution stopped abnormally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Memory { va: usize },
    IllegalInstruction { pc: u32 },
}

/// Outcome of executing one instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Syscall(u32),
    Fault(Fault),
}

/// User-permission memory access used by the interpreter.
pub trait UserMemory {
    fn fetch_insn(&mut self, va: usize) -> Result<[u8; INSN_SIZE], usize>;
    fn load(&mut self, va: usize) -> Result<u32, usize>;
    fn store(&mut self, va: usize, value: u32) -> Result<(), usize>;
    fn fetch_add(&mut self, va: usize, delta: u32) -> Result<u32, usize>;
}

/// View of one address space through the manager.
pub struct SpaceView<'a> {
    pub spaces: &'a mut AddressSpaceManager,
    pub handle: AsHandle,
}

fn fault_va(err: AddressSpaceError, va: usize) -> usize {
    match err {
        AddressSpaceError::Fault { va } => va,
        _ => va,
    }
}

impl UserMemory for SpaceView<'_> {
    fn fetch_insn(&mut self, va: usize) -> Result<[u8; INSN_SIZE], usize> {
        self.spaces.fetch::<INSN_SIZE>(self.handle, va).map_err(|e| fault_va(e, va))
    }

    fn load(&mut self, va: usize) -> Result<u32, usize> {
        self.spaces.read_u32(self.handle, va).map_err(|e| fault_va(e, va))
    }

    fn store(&mut self, va: usize, value: u32) -> Result<(), usize> {
        self.spaces.write_u32(self.handle, va, value).map_err(|e| fault_va(e, va))
    }

    fn fetch_add(&mut self, va: usize, delta: u32) -> Result<u32, usize> {
        self.spaces.fetch_add_u32(self.handle, va, delta).map_err(|e| fault_va(e, va))
    }
}

/// Executes the instruction at `frame.pc`.
pub fn step(frame: &mut TrapFrame, mem: &mut impl UserMemory) -> Step {
    let pc = frame.pc;
    let bytes = match mem.fetch_insn(pc as usize) {
        Ok(bytes) => bytes,
        Err(va) => return Step::Fault(Fault::Memory { va }),
    };
    let Some(insn) = Insn::decode(bytes) else {
        return Step::Fault(Fault::IllegalInstruction { pc });
    };
    let (a, b) = (insn.a.index(), insn.b.index());
    let addr = frame.regs[b].wrapping_add(insn.imm) as usize;
    let mut next = pc.wrapping_add(INSN_SIZE as u32);
    let r = &mut frame.regs;
    match insn.op {
        Opcode::Nop => {}
        Opcode::Li => r[a] = insn.imm,
        Opcode::Mov => r[a] = r[b],
        Opcode::Add => r[a] = r[a].wrapping_add(r[b]),
        Opcode::Addi => r[a] = r[a].wrapping_add(insn.imm),
        Opcode::Sub => r[a] = r[a].wrapping_sub(r[b]),
        Opcode::Ld => match mem.load(addr) {
            Ok(v) => r[a] = v,
            Err(va) => return Step::Fault(Fault::Memory { va }),
        },
        Opcode::St => {
            if let Err(va) = mem.store(addr, r[a]) {
                return Step::Fault(Fault::Memory { va });
            }
        }
        Opcode::Xadd => match mem.fetch_add(addr, r[a]) {
            Ok(old) => r[a] = old,
            Err(va) => return Step::Fault(Fault::Memory { va }),
        },
        Opcode::Jmp => next = insn.imm,
        Opcode::Jz => {
            if r[a] == 0 {
                next = insn.imm;
            }
        }
        Opcode::Jnz => {
            if r[a] != 0 {
                next = insn.imm;
            }
        }
        Opcode::Blt => {
            if r[a] < r[b] {
                next = insn.imm;
            }
        }
        Opcode::Beq => {
            if r[a] == r[b] {
                next = insn.imm;
            }
        }
        Opcode::Call => {
            let sp = r[SP].wrapping_sub(4);
            if let Err(va) = mem.store(sp as usize, next) {
                return Step::Fault(Fault::Memory { va });
            }
            r[SP] = sp;
            next = insn.imm;
        }
        Opcode::Ret => match mem.load(r[SP] as usize) {
            Ok(ret) => {
                r[SP] = r[SP].wrapping_add(4);
                next = ret;
            }
            Err(va) => return Step::Fault(Fault::Memory { va }),
        },
        Opcode::Push => {
            let sp = r[SP].wrapping_sub(4);
            if let Err(va) = mem.store(sp as usize, r[a]) {
                return Step::Fault(Fault::Memory { va });
            }
            r[SP] = sp;
        }
        Opcode::Pop => match mem.load(r[SP] as usize) {
            Ok(v) => {
                r[a] = v;
                r[SP] = r[SP].wrapping_add(4);
            }
            Err(va) => return Step::Fault(Fault::Memory { va }),
        },
        Opcode::Sys => {
            frame.pc = next;
            return Step::Syscall(insn.imm);
        }
    }
    frame.pc = next;
    Step::Continue
}
