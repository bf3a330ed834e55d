// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Label-resolving assembler producing [`ProgramImage`]s.
//!
//! Text is linked at address 0; data follows at the next page boundary.

extern crate alloc;

use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};

use super::isa::{Insn, Opcode, Reg, INSN_SIZE};
use crate::loader::{ProgramImage, Segment};
use crate::mm::pg_round_up;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    #[error("undefined label `{0}`")]
    UndefinedLabel(String),
    #[error("label `{0}` defined twice")]
    DuplicateLabel(String),
}

#[derive(Clone, Copy)]
enum Place {
    Text(usize),
    Data(usize),
}

#[derive(Default)]
pub struct Asm {
    text: Vec<(Insn, Option<String>)>,
    data: Vec<u8>,
    data_fixups: Vec<(usize, String)>,
    labels: BTreeMap<String, Place>,
    duplicate: Option<String>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    fn define(&mut self, name: &str, place: Place) {
        if self.labels.insert(String::from(name), place).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(String::from(name));
        }
    }

    fn emit(&mut self, op: Opcode, a: Reg, b: Reg, imm: u32) -> &mut Self {
        self.text.push((Insn::new(op, a, b, imm), None));
        self
    }

    fn emit_to(&mut self, op: Opcode, a: Reg, b: Reg, target: &str) -> &mut Self {
        self.text.push((Insn::new(op, a, b, 0), Some(String::from(target))));
        self
    }

    /// Defines a text label at the next instruction.
    pub fn label(&mut self, name: &str) -> &mut Self {
        let at = self.text.len();
        self.define(name, Place::Text(at));
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.emit(Opcode::Nop, Reg::R0, Reg::R0, 0)
    }

    pub fn li(&mut self, rd: Reg, imm: u32) -> &mut Self {
        self.emit(Opcode::Li, rd, Reg::R0, imm)
    }

    /// Loads the address of `label` into `rd`.
    pub fn la(&mut self, rd: Reg, label: &str) -> &mut Self {
        self.emit_to(Opcode::Li, rd, Reg::R0, label)
    }

    pub fn mov(&mut self, rd: Reg, rs: Reg) -> &mut Self {
        self.emit(Opcode::Mov, rd, rs, 0)
    }

    pub fn add(&mut self, rd: Reg, rs: Reg) -> &mut Self {
        self.emit(Opcode::Add, rd, rs, 0)
    }

    pub fn addi(&mut self, rd: Reg, imm: i32) -> &mut Self {
        self.emit(Opcode::Addi, rd, Reg::R0, imm as u32)
    }

    pub fn sub(&mut self, rd: Reg, rs: Reg) -> &mut Self {
        self.emit(Opcode::Sub, rd, rs, 0)
    }

    pub fn ld(&mut self, rd: Reg, base: Reg, off: i32) -> &mut Self {
        self.emit(Opcode::Ld, rd, base, off as u32)
    }

    pub fn st(&mut self, rs: Reg, base: Reg, off: i32) -> &mut Self {
        self.emit(Opcode::St, rs, base, off as u32)
    }

    pub fn xadd(&mut self, rd: Reg, base: Reg, off: i32) -> &mut Self {
        self.emit(Opcode::Xadd, rd, base, off as u32)
    }

    pub fn jmp(&mut self, target: &str) -> &mut Self {
        self.emit_to(Opcode::Jmp, Reg::R0, Reg::R0, target)
    }

    pub fn jz(&mut self, r: Reg, target: &str) -> &mut Self {
        self.emit_to(Opcode::Jz, r, Reg::R0, target)
    }

    pub fn jnz(&mut self, r: Reg, target: &str) -> &mut Self {
        self.emit_to(Opcode::Jnz, r, Reg::R0, target)
    }

    pub fn blt(&mut self, a: Reg, b: Reg, target: &str) -> &mut Self {
        self.emit_to(Opcode::Blt, a, b, target)
    }

    pub fn beq(&mut self, a: Reg, b: Reg, target: &str) -> &mut Self {
        self.emit_to(Opcode::Beq, a, b, target)
    }

    pub fn call(&mut self, target: &str) -> &mut Self {
        self.emit_to(Opcode::Call, Reg::R0, Reg::R0, target)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.emit(Opcode::Ret, Reg::R0, Reg::R0, 0)
    }

    pub fn push(&mut self, r: Reg) -> &mut Self {
        self.emit(Opcode::Push, r, Reg::R0, 0)
    }

    pub fn pop(&mut self, r: Reg) -> &mut Self {
        self.emit(Opcode::Pop, r, Reg::R0, 0)
    }

    pub fn sys(&mut self, number: usize) -> &mut Self {
        self.emit(Opcode::Sys, Reg::R0, Reg::R0, number as u32)
    }

    fn align_data(&mut self) {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
    }

    pub fn data_word(&mut self, label: &str, value: u32) -> &mut Self {
        self.align_data();
        let at = self.data.len();
        self.define(label, Place::Data(at));
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// A word initialised with the address of `target`.
    pub fn data_addr(&mut self, label: &str, target: &str) -> &mut Self {
        self.data_word(label, 0);
        let at = self.data.len() - 4;
        self.data_fixups.push((at, String::from(target)));
        self
    }

    /// An unlabelled address word, for building pointer arrays after `data_addr`.
    pub fn data_addr_next(&mut self, target: &str) -> &mut Self {
        self.align_data();
        let at = self.data.len();
        self.data.extend_from_slice(&[0; 4]);
        self.data_fixups.push((at, String::from(target)));
        self
    }

    /// An unlabelled zero word, e.g. a pointer-array terminator.
    pub fn data_word_next(&mut self, value: u32) -> &mut Self {
        self.align_data();
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// A NUL-terminated string.
    pub fn data_str(&mut self, label: &str, s: &str) -> &mut Self {
        self.align_data();
        let at = self.data.len();
        self.define(label, Place::Data(at));
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self
    }

    /// `bytes` of zero-initialised storage.
    pub fn data_zero(&mut self, label: &str, bytes: usize) -> &mut Self {
        self.align_data();
        let at = self.data.len();
        self.define(label, Place::Data(at));
        self.data.extend(core::iter::repeat(0).take(bytes));
        self
    }

    /// Resolves labels and produces an image entering at `entry`.
    pub fn link(&self, entry: &str) -> Result<ProgramImage, AsmError> {
        if let Some(name) = &self.duplicate {
            return Err(AsmError::DuplicateLabel(name.clone()));
        }
        let text_len = self.text.len() * INSN_SIZE;
        let data_base = pg_round_up(text_len.max(1));
        let resolve = |name: &str| -> Result<u32, AsmError> {
            match self.labels.get(name) {
                Some(Place::Text(i)) => Ok((i * INSN_SIZE) as u32),
                Some(Place::Data(off)) => Ok((data_base + off) as u32),
                None => Err(AsmError::UndefinedLabel(String::from(name))),
            }
        };
        let mut text = Vec::with_capacity(text_len);
        for (insn, target) in &self.text {
            let mut insn = *insn;
            if let Some(name) = target {
                insn.imm = resolve(name)?;
            }
            text.extend_from_slice(&insn.encode());
        }
        let mut data = self.data.clone();
        for (at, name) in &self.data_fixups {
            data[*at..*at + 4].copy_from_slice(&resolve(name)?.to_le_bytes());
        }
        let mut segments = vec![Segment { vaddr: 0, mem_size: text.len(), data: text }];
        if !data.is_empty() {
            segments.push(Segment { vaddr: data_base, mem_size: data.len(), data });
        }
        Ok(ProgramImage { entry: resolve(entry)? as usize, segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_across_text_and_data() {
        let mut asm = Asm::new();
        asm.label("main").la(Reg::R1, "msg").jmp("main");
        asm.data_str("msg", "hi").data_addr("ptr", "msg");
        let image = asm.link("main").unwrap();
        assert_eq!(image.entry, 0);
        assert_eq!(image.segments.len(), 2);
        let data_base = image.segments[1].vaddr;
        assert_eq!(data_base, crate::mm::PAGE_SIZE);
        let la = Insn::decode(image.segments[0].data[..8].try_into().unwrap()).unwrap();
        assert_eq!(la.imm as usize, data_base);
        assert_eq!(&image.segments[1].data[4..8], &(data_base as u32).to_le_bytes());
    }

    #[test]
    fn undefined_and_duplicate_labels_fail() {
        let mut asm = Asm::new();
        asm.label("main").jmp("nowhere");
        assert_eq!(asm.link("main"), Err(AsmError::UndefinedLabel(String::from("nowhere"))));
        let mut asm = Asm::new();
        asm.label("x").nop().label("x");
        assert_eq!(asm.link("x"), Err(AsmError::DuplicateLabel(String::from("x"))));
    }
}
