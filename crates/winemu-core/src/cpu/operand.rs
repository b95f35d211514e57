//! Operand access for one decoded instruction.

use iced_x86::{Instruction, OpKind, Register};

use crate::cpu::flags::mask;
use crate::fault::{Fault, FaultCode};
use crate::memory::{AddressSpace, MemoryError};
use crate::state::{GeneralRegister, RegisterFile};

/// Which bits of a general-purpose register an iced register names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    /// Low `n` bytes.
    Low(usize),
    /// Bits 8..15 (`AH`, `CH`, `DH`, `BH`).
    High8,
}

fn locate(reg: Register) -> Option<(GeneralRegister, Lane)> {
    let high = match reg {
        Register::AH => Some(GeneralRegister::Rax),
        Register::CH => Some(GeneralRegister::Rcx),
        Register::DH => Some(GeneralRegister::Rdx),
        Register::BH => Some(GeneralRegister::Rbx),
        _ => None,
    };
    if let Some(gpr) = high {
        return Some((gpr, Lane::High8));
    }
    if !reg.is_gpr() {
        return None;
    }
    let full = reg.full_register();
    let index = (full as usize).checked_sub(Register::RAX as usize)?;
    Some((GeneralRegister::from_index(index)?, Lane::Low(reg.size())))
}

/// Reads a GPR view; `None` for non-GPR registers.
pub(crate) fn read_register(regs: &RegisterFile, reg: Register) -> Option<u64> {
    let (gpr, lane) = locate(reg)?;
    let value = regs.gpr(gpr);
    Some(match lane {
        Lane::High8 => (value >> 8) & 0xFF,
        Lane::Low(bytes) => value & mask(bits_of(bytes)),
    })
}

/// Writes a GPR view with x64 merge rules: 8/16-bit writes merge, 32-bit
/// writes zero-extend.
pub(crate) fn write_register(regs: &mut RegisterFile, reg: Register, value: u64) -> Option<()> {
    let (gpr, lane) = locate(reg)?;
    let old = regs.gpr(gpr);
    let new = match lane {
        Lane::High8 => (old & !0xFF00) | ((value & 0xFF) << 8),
        Lane::Low(1) => (old & !0xFF) | (value & 0xFF),
        Lane::Low(2) => (old & !0xFFFF) | (value & 0xFFFF),
        Lane::Low(4) => value & 0xFFFF_FFFF,
        Lane::Low(_) => value,
    };
    regs.set_gpr(gpr, new);
    Some(())
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn bits_of(bytes: usize) -> u32 {
    (bytes * 8) as u32
}

/// Converts an address-space failure into a fault at `rip`.
pub(crate) const fn memory_fault(rip: u64, error: MemoryError) -> Fault {
    error.at(rip)
}

/// Decoded instruction bound to the state it executes against.
pub(crate) struct Context<'a> {
    pub instr: &'a Instruction,
    pub regs: &'a mut RegisterFile,
    pub memory: &'a mut AddressSpace,
    pub rip: u64,
}

impl Context<'_> {
    pub fn unsupported(&self) -> Fault {
        Fault::new(FaultCode::UnsupportedInstruction, self.rip)
    }

    pub fn reg(&self, reg: Register) -> Result<u64, Fault> {
        read_register(self.regs, reg).ok_or_else(|| self.unsupported())
    }

    pub fn set_reg(&mut self, reg: Register, value: u64) -> Result<(), Fault> {
        write_register(self.regs, reg, value).ok_or_else(|| self.unsupported())
    }

    pub fn gpr(&self, reg: GeneralRegister) -> u64 {
        self.regs.gpr(reg)
    }

    /// Width of operand `index` in bits.
    pub fn bits(&self, index: u32) -> Result<u32, Fault> {
        let bytes = match self.instr.op_kind(index) {
            OpKind::Register => self.instr.op_register(index).size(),
            OpKind::Memory => self.instr.memory_size().size(),
            _ => return Err(self.unsupported()),
        };
        match bytes {
            1 | 2 | 4 | 8 => Ok(bits_of(bytes)),
            _ => Err(self.unsupported()),
        }
    }

    /// Linear address of the memory operand, segment base included.
    pub fn address(&self) -> Result<u64, Fault> {
        let offset = self.effective_offset()?;
        let segment = match self.instr.memory_segment() {
            Register::FS => self.regs.fs_base(),
            Register::GS => self.regs.gs_base(),
            _ => 0,
        };
        Ok(segment.wrapping_add(offset))
    }

    /// Offset of the memory operand without segment base (`lea`).
    pub fn effective_offset(&self) -> Result<u64, Fault> {
        let base = self.instr.memory_base();
        let displacement = self.instr.memory_displacement64();
        // RIP-relative displacements are already absolute.
        match base {
            Register::RIP => return Ok(displacement),
            Register::EIP => return Ok(displacement & 0xFFFF_FFFF),
            _ => {}
        }
        let mut address = displacement;
        if base != Register::None {
            address = address.wrapping_add(self.reg(base)?);
        }
        let index = self.instr.memory_index();
        if index != Register::None {
            let scale = u64::from(self.instr.memory_index_scale());
            address = address.wrapping_add(self.reg(index)?.wrapping_mul(scale));
        }
        if base.size() == 4 || index.size() == 4 {
            address &= 0xFFFF_FFFF;
        }
        Ok(address)
    }

    pub fn load(&self, address: u64, bits: u32) -> Result<u64, Fault> {
        let len = (bits / 8) as usize;
        let mut buf = [0u8; 8];
        self.memory
            .read(address, &mut buf[..len])
            .map_err(|error| memory_fault(self.rip, error))?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn store(&mut self, address: u64, bits: u32, value: u64) -> Result<(), Fault> {
        let len = (bits / 8) as usize;
        let bytes = value.to_le_bytes();
        self.memory
            .write(address, &bytes[..len])
            .map_err(|error| memory_fault(self.rip, error))
    }

    /// Value of operand `index`, zero-extended from its own width.
    pub fn read(&self, index: u32) -> Result<u64, Fault> {
        match self.instr.op_kind(index) {
            OpKind::Register => self.reg(self.instr.op_register(index)),
            OpKind::Memory => self.load(self.address()?, self.bits(index)?),
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(self.instr.immediate(index)),
            _ => Err(self.unsupported()),
        }
    }

    /// Writes operand `index` (register or memory).
    pub fn write(&mut self, index: u32, value: u64) -> Result<(), Fault> {
        match self.instr.op_kind(index) {
            OpKind::Register => self.set_reg(self.instr.op_register(index), value),
            OpKind::Memory => {
                let bits = self.bits(index)?;
                let address = self.address()?;
                self.store(address, bits, value & mask(bits))
            }
            _ => Err(self.unsupported()),
        }
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::Register;

    use super::{read_register, write_register};
    use crate::state::{GeneralRegister, RegisterFile};

    #[test]
    fn narrow_writes_merge_and_dword_writes_zero_extend() {
        let mut regs = RegisterFile::default();
        regs.set_gpr(GeneralRegister::Rax, 0x1122_3344_5566_7788);

        write_register(&mut regs, Register::AL, 0xFF).expect("gpr");
        assert_eq!(regs.gpr(GeneralRegister::Rax), 0x1122_3344_5566_77FF);

        write_register(&mut regs, Register::AH, 0xAA).expect("gpr");
        assert_eq!(regs.gpr(GeneralRegister::Rax), 0x1122_3344_5566_AAFF);

        write_register(&mut regs, Register::AX, 0x1234).expect("gpr");
        assert_eq!(regs.gpr(GeneralRegister::Rax), 0x1122_3344_5566_1234);

        write_register(&mut regs, Register::EAX, 0xDEAD_BEEF).expect("gpr");
        assert_eq!(regs.gpr(GeneralRegister::Rax), 0xDEAD_BEEF);
    }

    #[test]
    fn views_read_the_expected_bits() {
        let mut regs = RegisterFile::default();
        regs.set_gpr(GeneralRegister::Rbx, 0x0000_0000_0000_BEEF);
        regs.set_gpr(GeneralRegister::R9, 0xFFFF_FFFF_0000_0001);

        assert_eq!(read_register(&regs, Register::BH), Some(0xBE));
        assert_eq!(read_register(&regs, Register::BL), Some(0xEF));
        assert_eq!(read_register(&regs, Register::R9D), Some(1));
        assert_eq!(read_register(&regs, Register::R9), Some(0xFFFF_FFFF_0000_0001));
        assert_eq!(read_register(&regs, Register::XMM0), None);
    }
}
