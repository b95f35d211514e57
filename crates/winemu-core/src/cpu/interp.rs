//! Integer-subset x64 interpreter.

use iced_x86::{
    Code, Decoder, DecoderError, DecoderOptions, Instruction, Mnemonic, OpKind, Register,
};

use crate::cpu::flags::{self, mask, sign_extend, Condition, ShiftOp};
use crate::cpu::operand::{memory_fault, Context};
use crate::cpu::{CpuBackend, CpuStep};
use crate::fault::{Fault, FaultCode};
use crate::memory::{AddressSpace, MemoryError};
use crate::state::{GeneralRegister, RegisterFile, RFLAGS_CF};

/// Longest legal x64 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

enum Flow {
    Next,
    Jump(u64),
    Syscall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alu {
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    And,
    Or,
    Xor,
    Test,
}

/// Built-in CPU backend: decodes with `iced-x86` and executes the integer
/// instruction subset used by compiled user-mode code.
///
/// Faults are precise: when an instruction faults, the register file is left
/// exactly as it was before the instruction and memory is unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X64Interpreter;

impl X64Interpreter {
    /// Creates the interpreter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CpuBackend for X64Interpreter {
    fn step(&mut self, regs: &mut RegisterFile, memory: &mut AddressSpace) -> CpuStep {
        let rip = regs.rip();
        let instr = match decode_at(memory, rip) {
            Ok(instr) => instr,
            Err(fault) => return CpuStep::Fault(fault),
        };

        let saved = regs.clone();
        let mut ctx = Context {
            instr: &instr,
            regs,
            memory,
            rip,
        };
        let flow = execute(&mut ctx);
        match flow {
            Ok(Flow::Next) => {
                regs.set_rip(instr.next_ip());
                CpuStep::Retired
            }
            Ok(Flow::Jump(target)) => {
                regs.set_rip(target);
                CpuStep::Retired
            }
            Ok(Flow::Syscall) => {
                regs.set_rip(instr.next_ip());
                CpuStep::SyscallTrap
            }
            Err(fault) => {
                *regs = saved;
                CpuStep::Fault(fault)
            }
        }
    }
}

/// Decodes the instruction at `rip`, fetching with execute permission.
///
/// # Errors
///
/// Returns a memory fault when the first byte (or a byte the instruction
/// needs) cannot be fetched, and [`FaultCode::IllegalInstruction`] for an
/// invalid encoding.
pub fn decode_at(memory: &AddressSpace, rip: u64) -> Result<Instruction, Fault> {
    let mut bytes = [0u8; MAX_INSTRUCTION_LEN];
    let fetched = memory
        .fetch(rip, &mut bytes)
        .map_err(|error| memory_fault(rip, error))?;

    let mut decoder = Decoder::with_ip(64, &bytes[..fetched], rip, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.code() != Code::INVALID {
        return Ok(instr);
    }
    if decoder.last_error() == DecoderError::NoMoreBytes {
        let boundary = rip.wrapping_add(fetched as u64);
        let error = memory
            .fetch(boundary, &mut [0u8; 1])
            .err()
            .unwrap_or(MemoryError::Unmapped { address: boundary });
        return Err(memory_fault(rip, error));
    }
    Err(Fault::new(FaultCode::IllegalInstruction, rip))
}

fn execute(ctx: &mut Context<'_>) -> Result<Flow, Fault> {
    let mnemonic = ctx.instr.mnemonic();
    if let Some(condition) = Condition::of(mnemonic) {
        let holds = condition.holds(ctx.regs);
        return match ctx.instr.op_kind(0) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Ok(if holds {
                Flow::Jump(ctx.instr.near_branch_target())
            } else {
                Flow::Next
            }),
            _ if ctx.instr.op_count() == 1 => {
                ctx.write(0, u64::from(holds))?;
                Ok(Flow::Next)
            }
            _ => cmov(ctx, holds),
        };
    }

    match mnemonic {
        Mnemonic::Nop | Mnemonic::Endbr64 | Mnemonic::Pause => Ok(Flow::Next),
        Mnemonic::Mov => {
            let value = ctx.read(1)?;
            ctx.write(0, value)?;
            Ok(Flow::Next)
        }
        Mnemonic::Movzx => {
            let value = ctx.read(1)?;
            ctx.write(0, value)?;
            Ok(Flow::Next)
        }
        Mnemonic::Movsx | Mnemonic::Movsxd => {
            let bits = ctx.bits(1)?;
            #[allow(clippy::cast_sign_loss)]
            let value = sign_extend(ctx.read(1)?, bits) as u64;
            ctx.write(0, value & mask(ctx.bits(0)?))?;
            Ok(Flow::Next)
        }
        Mnemonic::Lea => {
            if ctx.instr.op_kind(1) != OpKind::Memory {
                return Err(ctx.unsupported());
            }
            let offset = ctx.effective_offset()?;
            ctx.write(0, offset)?;
            Ok(Flow::Next)
        }
        Mnemonic::Xchg => xchg(ctx),
        Mnemonic::Add => alu(ctx, Alu::Add),
        Mnemonic::Adc => alu(ctx, Alu::Adc),
        Mnemonic::Sub => alu(ctx, Alu::Sub),
        Mnemonic::Sbb => alu(ctx, Alu::Sbb),
        Mnemonic::Cmp => alu(ctx, Alu::Cmp),
        Mnemonic::And => alu(ctx, Alu::And),
        Mnemonic::Or => alu(ctx, Alu::Or),
        Mnemonic::Xor => alu(ctx, Alu::Xor),
        Mnemonic::Test => alu(ctx, Alu::Test),
        Mnemonic::Inc | Mnemonic::Dec => inc_dec(ctx, mnemonic == Mnemonic::Inc),
        Mnemonic::Neg => {
            let bits = ctx.bits(0)?;
            let value = ctx.read(0)?;
            let (result, update) = flags::sub(0, value, false, bits);
            ctx.write(0, result)?;
            update.apply(ctx.regs);
            Ok(Flow::Next)
        }
        Mnemonic::Not => {
            let bits = ctx.bits(0)?;
            let value = ctx.read(0)?;
            ctx.write(0, !value & mask(bits))?;
            Ok(Flow::Next)
        }
        Mnemonic::Shl | Mnemonic::Sal => shift(ctx, ShiftOp::Shl),
        Mnemonic::Shr => shift(ctx, ShiftOp::Shr),
        Mnemonic::Sar => shift(ctx, ShiftOp::Sar),
        Mnemonic::Rol => shift(ctx, ShiftOp::Rol),
        Mnemonic::Ror => shift(ctx, ShiftOp::Ror),
        Mnemonic::Imul => imul(ctx),
        Mnemonic::Mul => mul(ctx),
        Mnemonic::Div => divide(ctx, false),
        Mnemonic::Idiv => divide(ctx, true),
        Mnemonic::Cbw | Mnemonic::Cwde | Mnemonic::Cdqe => convert(ctx, mnemonic),
        Mnemonic::Cwd | Mnemonic::Cdq | Mnemonic::Cqo => convert(ctx, mnemonic),
        Mnemonic::Push => push(ctx),
        Mnemonic::Pop => pop(ctx),
        Mnemonic::Leave => {
            let frame = ctx.gpr(GeneralRegister::Rbp);
            let saved_rbp = ctx.load(frame, 64)?;
            ctx.regs.set_rsp(frame.wrapping_add(8));
            ctx.regs.set_gpr(GeneralRegister::Rbp, saved_rbp);
            Ok(Flow::Next)
        }
        Mnemonic::Call => {
            let target = branch_target(ctx)?;
            let rsp = ctx.regs.rsp().wrapping_sub(8);
            ctx.store(rsp, 64, ctx.instr.next_ip())?;
            ctx.regs.set_rsp(rsp);
            Ok(Flow::Jump(target))
        }
        Mnemonic::Ret => {
            let rsp = ctx.regs.rsp();
            let target = ctx.load(rsp, 64)?;
            let release = if ctx.instr.op_count() == 1 {
                ctx.instr.immediate(0)
            } else {
                0
            };
            ctx.regs.set_rsp(rsp.wrapping_add(8).wrapping_add(release));
            Ok(Flow::Jump(target))
        }
        Mnemonic::Jmp => Ok(Flow::Jump(branch_target(ctx)?)),
        Mnemonic::Syscall => {
            let rflags = ctx.regs.rflags();
            ctx.regs.set_gpr(GeneralRegister::Rcx, ctx.instr.next_ip());
            ctx.regs.set_gpr(GeneralRegister::R11, rflags);
            Ok(Flow::Syscall)
        }
        Mnemonic::Int3 => Err(Fault::new(FaultCode::Breakpoint, ctx.rip)),
        Mnemonic::Hlt => Err(Fault::new(FaultCode::PrivilegedInstruction, ctx.rip)),
        Mnemonic::Ud2 => Err(Fault::new(FaultCode::IllegalInstruction, ctx.rip)),
        _ => Err(ctx.unsupported()),
    }
}

fn branch_target(ctx: &Context<'_>) -> Result<u64, Fault> {
    match ctx.instr.op_kind(0) {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Ok(ctx.instr.near_branch_target())
        }
        OpKind::Register | OpKind::Memory if ctx.bits(0)? == 64 => ctx.read(0),
        _ => Err(ctx.unsupported()),
    }
}

fn cmov(ctx: &mut Context<'_>, holds: bool) -> Result<Flow, Fault> {
    let value = ctx.read(1)?;
    if holds {
        ctx.write(0, value)?;
    } else if ctx.bits(0)? == 32 {
        // A 32-bit destination is zero-extended even when the move is skipped.
        let current = ctx.read(0)?;
        ctx.write(0, current)?;
    }
    Ok(Flow::Next)
}

fn xchg(ctx: &mut Context<'_>) -> Result<Flow, Fault> {
    let first = ctx.read(0)?;
    let second = ctx.read(1)?;
    if ctx.instr.op_kind(1) == OpKind::Memory {
        ctx.write(1, first)?;
        ctx.write(0, second)?;
    } else {
        ctx.write(0, second)?;
        ctx.write(1, first)?;
    }
    Ok(Flow::Next)
}

fn alu(ctx: &mut Context<'_>, op: Alu) -> Result<Flow, Fault> {
    let bits = ctx.bits(0)?;
    let a = ctx.read(0)?;
    let b = ctx.read(1)? & mask(bits);
    let carry = ctx.regs.flag(RFLAGS_CF);
    let (result, update) = match op {
        Alu::Add => flags::add(a, b, false, bits),
        Alu::Adc => flags::add(a, b, carry, bits),
        Alu::Sub | Alu::Cmp => flags::sub(a, b, false, bits),
        Alu::Sbb => flags::sub(a, b, carry, bits),
        Alu::And | Alu::Test => (a & b, flags::logic(a & b, bits)),
        Alu::Or => (a | b, flags::logic(a | b, bits)),
        Alu::Xor => (a ^ b, flags::logic(a ^ b, bits)),
    };
    if !matches!(op, Alu::Cmp | Alu::Test) {
        ctx.write(0, result)?;
    }
    update.apply(ctx.regs);
    Ok(Flow::Next)
}

fn inc_dec(ctx: &mut Context<'_>, increment: bool) -> Result<Flow, Fault> {
    let bits = ctx.bits(0)?;
    let value = ctx.read(0)?;
    let (result, mut update) = if increment {
        flags::add(value, 1, false, bits)
    } else {
        flags::sub(value, 1, false, bits)
    };
    update.cf = None;
    ctx.write(0, result)?;
    update.apply(ctx.regs);
    Ok(Flow::Next)
}

fn shift(ctx: &mut Context<'_>, op: ShiftOp) -> Result<Flow, Fault> {
    let bits = ctx.bits(0)?;
    let value = ctx.read(0)?;
    let count = ctx.read(1)?;
    if let Some((result, update)) = flags::shift(op, value, count, bits) {
        ctx.write(0, result)?;
        update.apply(ctx.regs);
    }
    Ok(Flow::Next)
}

/// Accumulator pair `(low, high)` of widening multiply and divide.
const fn accumulator(bits: u32) -> (Register, Register) {
    match bits {
        16 => (Register::AX, Register::DX),
        32 => (Register::EAX, Register::EDX),
        _ => (Register::RAX, Register::RDX),
    }
}

fn set_overflow(ctx: &mut Context<'_>, overflow: bool) {
    flags::FlagUpdate {
        cf: Some(overflow),
        of: Some(overflow),
        ..flags::FlagUpdate::default()
    }
    .apply(ctx.regs);
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn mul(ctx: &mut Context<'_>) -> Result<Flow, Fault> {
    let bits = ctx.bits(0)?;
    let source = ctx.read(0)?;
    let overflow = if bits == 8 {
        let product = ctx.reg(Register::AL)? * source;
        ctx.set_reg(Register::AX, product)?;
        product >> 8 != 0
    } else {
        let (low, high) = accumulator(bits);
        let product = u128::from(ctx.reg(low)?) * u128::from(source);
        let upper = (product >> bits) as u64 & mask(bits);
        ctx.set_reg(low, product as u64)?;
        ctx.set_reg(high, upper)?;
        upper != 0
    };
    set_overflow(ctx, overflow);
    Ok(Flow::Next)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn imul(ctx: &mut Context<'_>) -> Result<Flow, Fault> {
    let bits = ctx.bits(0)?;
    let overflow = match ctx.instr.op_count() {
        1 => {
            let source = i128::from(sign_extend(ctx.read(0)?, bits));
            if bits == 8 {
                let product = i128::from(sign_extend(ctx.reg(Register::AL)?, 8)) * source;
                ctx.set_reg(Register::AX, product as u64 & 0xFFFF)?;
                product != i128::from(sign_extend(product as u64 & 0xFF, 8))
            } else {
                let (low, high) = accumulator(bits);
                let product = i128::from(sign_extend(ctx.reg(low)?, bits)) * source;
                ctx.set_reg(low, product as u64 & mask(bits))?;
                ctx.set_reg(high, (product >> bits) as u64 & mask(bits))?;
                product != i128::from(sign_extend(product as u64 & mask(bits), bits))
            }
        }
        2 | 3 => {
            let (lhs, rhs) = if ctx.instr.op_count() == 3 {
                (ctx.read(1)?, ctx.read(2)?)
            } else {
                (ctx.read(0)?, ctx.read(1)?)
            };
            let product = i128::from(sign_extend(lhs & mask(bits), bits))
                * i128::from(sign_extend(rhs & mask(bits), bits));
            let truncated = product as u64 & mask(bits);
            ctx.write(0, truncated)?;
            product != i128::from(sign_extend(truncated, bits))
        }
        _ => return Err(ctx.unsupported()),
    };
    set_overflow(ctx, overflow);
    Ok(Flow::Next)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn divide(ctx: &mut Context<'_>, signed: bool) -> Result<Flow, Fault> {
    let divide_error = Fault::new(FaultCode::DivideError, ctx.rip);
    let bits = ctx.bits(0)?;
    let divisor = ctx.read(0)? & mask(bits);
    if divisor == 0 {
        return Err(divide_error);
    }

    let (dividend, low, high) = if bits == 8 {
        (u128::from(ctx.reg(Register::AX)?), Register::AL, Register::AH)
    } else {
        let (low, high) = accumulator(bits);
        let wide = (u128::from(ctx.reg(high)?) << bits) | u128::from(ctx.reg(low)?);
        (wide, low, high)
    };

    let (quotient, remainder) = if signed {
        let width = bits * 2;
        let dividend = if width == 128 {
            dividend as i128
        } else {
            i128::from(sign_extend(dividend as u64, width))
        };
        let divisor = i128::from(sign_extend(divisor, bits));
        let quotient = dividend.checked_div(divisor).ok_or(divide_error)?;
        let remainder = dividend.checked_rem(divisor).ok_or(divide_error)?;
        let limit = 1i128 << (bits - 1);
        if quotient < -limit || quotient >= limit {
            return Err(divide_error);
        }
        (quotient as u64 & mask(bits), remainder as u64 & mask(bits))
    } else {
        let quotient = dividend / u128::from(divisor);
        if quotient > u128::from(mask(bits)) {
            return Err(divide_error);
        }
        (quotient as u64, (dividend % u128::from(divisor)) as u64)
    };

    ctx.set_reg(low, quotient)?;
    ctx.set_reg(high, remainder)?;
    Ok(Flow::Next)
}

#[allow(clippy::cast_sign_loss)]
fn convert(ctx: &mut Context<'_>, mnemonic: Mnemonic) -> Result<Flow, Fault> {
    let (source, bits, target) = match mnemonic {
        Mnemonic::Cbw => (Register::AL, 8, Register::AX),
        Mnemonic::Cwde => (Register::AX, 16, Register::EAX),
        Mnemonic::Cdqe => (Register::EAX, 32, Register::RAX),
        Mnemonic::Cwd => (Register::AX, 16, Register::DX),
        Mnemonic::Cdq => (Register::EAX, 32, Register::EDX),
        _ => (Register::RAX, 64, Register::RDX),
    };
    let extended = sign_extend(ctx.reg(source)?, bits);
    let value = if matches!(mnemonic, Mnemonic::Cbw | Mnemonic::Cwde | Mnemonic::Cdqe) {
        extended as u64
    } else if extended < 0 {
        u64::MAX
    } else {
        0
    };
    ctx.set_reg(target, value)?;
    Ok(Flow::Next)
}

fn stack_width(ctx: &Context<'_>) -> Result<u32, Fault> {
    let bits = match ctx.instr.op_kind(0) {
        OpKind::Register | OpKind::Memory => ctx.bits(0)?,
        _ if matches!(ctx.instr.code(), Code::Pushw_imm8 | Code::Push_imm16) => 16,
        _ => 64,
    };
    if bits == 16 || bits == 64 {
        Ok(bits)
    } else {
        Err(ctx.unsupported())
    }
}

fn push(ctx: &mut Context<'_>) -> Result<Flow, Fault> {
    let bits = stack_width(ctx)?;
    let value = ctx.read(0)? & mask(bits);
    let rsp = ctx.regs.rsp().wrapping_sub(u64::from(bits / 8));
    ctx.store(rsp, bits, value)?;
    ctx.regs.set_rsp(rsp);
    Ok(Flow::Next)
}

fn pop(ctx: &mut Context<'_>) -> Result<Flow, Fault> {
    let bits = stack_width(ctx)?;
    let rsp = ctx.regs.rsp();
    let value = ctx.load(rsp, bits)?;
    ctx.regs.set_rsp(rsp.wrapping_add(u64::from(bits / 8)));
    ctx.write(0, value)?;
    Ok(Flow::Next)
}
