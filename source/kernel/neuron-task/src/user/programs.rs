// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Stock user programs shipped with the kernel
//! OWNERS: @runtime
//! PUBLIC API: init_image(child_path)

use super::{
    asm::{Asm, AsmError},
    isa::Reg,
};
use crate::{
    loader::ProgramImage,
    syscall::{SYS_EXEC, SYS_EXIT, SYS_FORK, SYS_WAIT},
};

/// Root task: forks once, the child execs `child_path`, the parent reaps forever.
pub fn init_image(child_path: &str) -> Result<ProgramImage, AsmError> {
    let mut asm = Asm::new();
    asm.label("main").sys(SYS_FORK).jz(Reg::R0, "child");
    asm.label("reap").sys(SYS_WAIT).jmp("reap");
    asm.label("child")
        .la(Reg::R1, "path")
        .la(Reg::R2, "argv")
        .sys(SYS_EXEC)
        .sys(SYS_EXIT);
    asm.data_str("path", child_path).data_addr("argv", "path").data_word_next(0);
    asm.link("main")
}
