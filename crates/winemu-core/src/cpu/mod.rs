//! CPU backends.
//!
//! The execution engine drives a [`CpuBackend`] one instruction at a time.
//! [`X64Interpreter`] is the built-in backend; anything else that can retire
//! an instruction against a [`RegisterFile`] and an [`AddressSpace`] plugs in
//! the same way.

mod flags;
mod interp;
mod operand;

use iced_x86::{Formatter, IntelFormatter};

pub use interp::{decode_at, X64Interpreter, MAX_INSTRUCTION_LEN};

use crate::fault::Fault;
use crate::memory::AddressSpace;
use crate::state::RegisterFile;

/// Result of retiring (or failing to retire) one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStep {
    /// The instruction completed and `rip` points at the next one.
    Retired,
    /// A `syscall` completed; `rip` points past it and the kernel must run.
    SyscallTrap,
    /// The instruction faulted. Registers and memory are as they were before it.
    Fault(Fault),
}

/// Executes guest instructions.
pub trait CpuBackend {
    /// Executes the instruction at `regs.rip()`.
    fn step(&mut self, regs: &mut RegisterFile, memory: &mut AddressSpace) -> CpuStep;
}

impl<B: CpuBackend + ?Sized> CpuBackend for &mut B {
    fn step(&mut self, regs: &mut RegisterFile, memory: &mut AddressSpace) -> CpuStep {
        (**self).step(regs, memory)
    }
}

/// Renders the instruction at `rip` in Intel syntax, or `None` when it cannot
/// be fetched or decoded.
#[must_use]
pub fn disassemble(memory: &AddressSpace, rip: u64) -> Option<String> {
    let instr = decode_at(memory, rip).ok()?;
    let mut formatter = IntelFormatter::new();
    let mut text = String::new();
    formatter.format(&instr, &mut text);
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::disassemble;
    use crate::memory::{AddressSpace, Permissions};

    #[test]
    fn disassembles_mapped_code_only() {
        let mut memory = AddressSpace::new();
        memory
            .allocate(Some(0x1_0000), 0x1000, Permissions::READ_EXECUTE)
            .expect("code region");
        memory.load(0x1_0000, &[0x48, 0x31, 0xC0]).expect("xor rax, rax");

        assert_eq!(disassemble(&memory, 0x1_0000).as_deref(), Some("xor rax,rax"));
        assert_eq!(disassemble(&memory, 0x9_0000), None);
    }
}
