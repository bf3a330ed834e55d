// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Simulated user mode: instruction set, interpreter, assembler, stock programs
//! OWNERS: @runtime
//! PUBLIC API: isa::{step, Insn, Reg, Opcode}, asm::Asm, programs::init_image
//! DEPENDS_ON: mm::AddressSpaceManager, loader::ProgramImage, trap::TrapFrame

pub mod asm;
pub mod isa;
pub mod programs;
