//! Arithmetic flag computation and condition evaluation.

use iced_x86::Mnemonic;

use crate::state::{
    RegisterFile, RFLAGS_AF, RFLAGS_CF, RFLAGS_OF, RFLAGS_PF, RFLAGS_SF, RFLAGS_ZF,
};

/// All-ones mask of the low `bits` bits.
pub(crate) const fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

pub(crate) const fn sign_bit(bits: u32) -> u64 {
    1u64 << (bits - 1)
}

/// Sign-extends the low `bits` bits of `value` to 64 bits.
#[allow(clippy::cast_possible_wrap)]
pub(crate) const fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// `true` when the low byte has an even number of set bits.
pub(crate) const fn parity_even(value: u64) -> bool {
    (value as u8).count_ones() % 2 == 0
}

/// Status flags produced by one instruction; `None` leaves a flag unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FlagUpdate {
    pub cf: Option<bool>,
    pub pf: Option<bool>,
    pub af: Option<bool>,
    pub zf: Option<bool>,
    pub sf: Option<bool>,
    pub of: Option<bool>,
}

impl FlagUpdate {
    /// ZF/SF/PF from a masked result.
    pub const fn result(result: u64, bits: u32) -> Self {
        Self {
            cf: None,
            pf: Some(parity_even(result)),
            af: None,
            zf: Some(result == 0),
            sf: Some(result & sign_bit(bits) != 0),
            of: None,
        }
    }

    pub fn apply(self, regs: &mut RegisterFile) {
        for (flag, value) in [
            (RFLAGS_CF, self.cf),
            (RFLAGS_PF, self.pf),
            (RFLAGS_AF, self.af),
            (RFLAGS_ZF, self.zf),
            (RFLAGS_SF, self.sf),
            (RFLAGS_OF, self.of),
        ] {
            if let Some(value) = value {
                regs.set_flag(flag, value);
            }
        }
    }
}

/// `a + b + carry` on `bits`-wide operands.
pub(crate) fn add(a: u64, b: u64, carry: bool, bits: u32) -> (u64, FlagUpdate) {
    let wide = u128::from(a) + u128::from(b) + u128::from(carry);
    #[allow(clippy::cast_possible_truncation)]
    let result = (wide as u64) & mask(bits);
    let mut flags = FlagUpdate::result(result, bits);
    flags.cf = Some(wide >> bits != 0);
    flags.af = Some((a ^ b ^ result) & 0x10 != 0);
    flags.of = Some((a ^ result) & (b ^ result) & sign_bit(bits) != 0);
    (result, flags)
}

/// `a - b - borrow` on `bits`-wide operands.
pub(crate) fn sub(a: u64, b: u64, borrow: bool, bits: u32) -> (u64, FlagUpdate) {
    let result = a.wrapping_sub(b).wrapping_sub(u64::from(borrow)) & mask(bits);
    let mut flags = FlagUpdate::result(result, bits);
    flags.cf = Some(u128::from(a) < u128::from(b) + u128::from(borrow));
    flags.af = Some((a ^ b ^ result) & 0x10 != 0);
    flags.of = Some((a ^ b) & (a ^ result) & sign_bit(bits) != 0);
    (result, flags)
}

/// Flags of `and`/`or`/`xor`/`test`.
pub(crate) const fn logic(result: u64, bits: u32) -> FlagUpdate {
    let mut flags = FlagUpdate::result(result, bits);
    flags.cf = Some(false);
    flags.of = Some(false);
    flags.af = Some(false);
    flags
}

/// Shift and rotate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

/// Applies a shift or rotate; `None` when the masked count is zero.
pub(crate) fn shift(op: ShiftOp, value: u64, count: u64, bits: u32) -> Option<(u64, FlagUpdate)> {
    let count_mask = if bits == 64 { 0x3F } else { 0x1F };
    #[allow(clippy::cast_possible_truncation)]
    let count = (count & count_mask) as u32;
    if count == 0 {
        return None;
    }
    let value = value & mask(bits);
    let msb = |v: u64| v & sign_bit(bits) != 0;

    let outcome = match op {
        ShiftOp::Shl => {
            let result = value.checked_shl(count).unwrap_or(0) & mask(bits);
            let cf = count <= bits && (value >> (bits - count)) & 1 != 0;
            let mut flags = FlagUpdate::result(result, bits);
            flags.cf = Some(cf);
            flags.of = Some(msb(result) ^ cf);
            flags.af = Some(false);
            (result, flags)
        }
        ShiftOp::Shr => {
            let result = value.checked_shr(count).unwrap_or(0);
            let cf = value.checked_shr(count - 1).unwrap_or(0) & 1 != 0;
            let mut flags = FlagUpdate::result(result, bits);
            flags.cf = Some(cf);
            flags.of = Some(msb(value));
            flags.af = Some(false);
            (result, flags)
        }
        ShiftOp::Sar => {
            let signed = sign_extend(value, bits);
            #[allow(clippy::cast_sign_loss)]
            let result = (signed >> count.min(63)) as u64 & mask(bits);
            let cf = (signed >> (count - 1).min(63)) & 1 != 0;
            let mut flags = FlagUpdate::result(result, bits);
            flags.cf = Some(cf);
            flags.of = Some(false);
            flags.af = Some(false);
            (result, flags)
        }
        ShiftOp::Rol => {
            let rotate = count % bits;
            let result = if rotate == 0 {
                value
            } else {
                ((value << rotate) | (value >> (bits - rotate))) & mask(bits)
            };
            let cf = result & 1 != 0;
            (
                result,
                FlagUpdate {
                    cf: Some(cf),
                    of: Some(msb(result) ^ cf),
                    ..FlagUpdate::default()
                },
            )
        }
        ShiftOp::Ror => {
            let rotate = count % bits;
            let result = if rotate == 0 {
                value
            } else {
                ((value >> rotate) | (value << (bits - rotate))) & mask(bits)
            };
            let cf = msb(result);
            let next = result & (sign_bit(bits) >> 1) != 0;
            (
                result,
                FlagUpdate {
                    cf: Some(cf),
                    of: Some(cf ^ next),
                    ..FlagUpdate::default()
                },
            )
        }
    };
    Some(outcome)
}

/// x86 condition codes shared by `jcc`, `setcc` and `cmovcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub(crate) enum Condition {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Condition {
    pub const fn holds(self, regs: &RegisterFile) -> bool {
        let cf = regs.flag(RFLAGS_CF);
        let zf = regs.flag(RFLAGS_ZF);
        let sf = regs.flag(RFLAGS_SF);
        let of = regs.flag(RFLAGS_OF);
        let pf = regs.flag(RFLAGS_PF);
        match self {
            Self::O => of,
            Self::No => !of,
            Self::B => cf,
            Self::Ae => !cf,
            Self::E => zf,
            Self::Ne => !zf,
            Self::Be => cf || zf,
            Self::A => !cf && !zf,
            Self::S => sf,
            Self::Ns => !sf,
            Self::P => pf,
            Self::Np => !pf,
            Self::L => sf != of,
            Self::Ge => sf == of,
            Self::Le => zf || sf != of,
            Self::G => !zf && sf == of,
        }
    }

    /// Condition tested by a `jcc`, `setcc` or `cmovcc` mnemonic.
    pub const fn of(mnemonic: Mnemonic) -> Option<Self> {
        Some(match mnemonic {
            Mnemonic::Jo | Mnemonic::Seto | Mnemonic::Cmovo => Self::O,
            Mnemonic::Jno | Mnemonic::Setno | Mnemonic::Cmovno => Self::No,
            Mnemonic::Jb | Mnemonic::Setb | Mnemonic::Cmovb => Self::B,
            Mnemonic::Jae | Mnemonic::Setae | Mnemonic::Cmovae => Self::Ae,
            Mnemonic::Je | Mnemonic::Sete | Mnemonic::Cmove => Self::E,
            Mnemonic::Jne | Mnemonic::Setne | Mnemonic::Cmovne => Self::Ne,
            Mnemonic::Jbe | Mnemonic::Setbe | Mnemonic::Cmovbe => Self::Be,
            Mnemonic::Ja | Mnemonic::Seta | Mnemonic::Cmova => Self::A,
            Mnemonic::Js | Mnemonic::Sets | Mnemonic::Cmovs => Self::S,
            Mnemonic::Jns | Mnemonic::Setns | Mnemonic::Cmovns => Self::Ns,
            Mnemonic::Jp | Mnemonic::Setp | Mnemonic::Cmovp => Self::P,
            Mnemonic::Jnp | Mnemonic::Setnp | Mnemonic::Cmovnp => Self::Np,
            Mnemonic::Jl | Mnemonic::Setl | Mnemonic::Cmovl => Self::L,
            Mnemonic::Jge | Mnemonic::Setge | Mnemonic::Cmovge => Self::Ge,
            Mnemonic::Jle | Mnemonic::Setle | Mnemonic::Cmovle => Self::Le,
            Mnemonic::Jg | Mnemonic::Setg | Mnemonic::Cmovg => Self::G,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{add, logic, shift, sign_extend, sub, Condition, ShiftOp};
    use crate::state::{RegisterFile, RFLAGS_CF, RFLAGS_SF, RFLAGS_ZF};

    #[test]
    fn add_reports_carry_and_signed_overflow() {
        let (result, flags) = add(0xFF, 1, false, 8);
        assert_eq!(result, 0);
        assert_eq!(flags.cf, Some(true));
        assert_eq!(flags.zf, Some(true));
        assert_eq!(flags.of, Some(false));

        let (result, flags) = add(0x7FFF_FFFF, 1, false, 32);
        assert_eq!(result, 0x8000_0000);
        assert_eq!(flags.of, Some(true));
        assert_eq!(flags.sf, Some(true));
        assert_eq!(flags.cf, Some(false));
    }

    #[test]
    fn sub_with_borrow_reports_borrow() {
        let (result, flags) = sub(0, 0, true, 64);
        assert_eq!(result, u64::MAX);
        assert_eq!(flags.cf, Some(true));
        assert_eq!(flags.sf, Some(true));

        let (result, flags) = sub(0x8000_0000_0000_0000, 1, false, 64);
        assert_eq!(result, 0x7FFF_FFFF_FFFF_FFFF);
        assert_eq!(flags.of, Some(true));
    }

    #[test]
    fn logic_clears_carry_and_overflow() {
        let flags = logic(0, 32);
        assert_eq!(flags.cf, Some(false));
        assert_eq!(flags.of, Some(false));
        assert_eq!(flags.zf, Some(true));
    }

    #[rstest]
    #[case(ShiftOp::Shl, 0x81, 1, 8, 0x02, true)]
    #[case(ShiftOp::Shr, 0x81, 1, 8, 0x40, true)]
    #[case(ShiftOp::Sar, 0x80, 7, 8, 0xFF, false)]
    #[case(ShiftOp::Rol, 0x81, 1, 8, 0x03, true)]
    #[case(ShiftOp::Ror, 0x01, 1, 8, 0x80, true)]
    #[case(ShiftOp::Shl, 1, 63, 64, 0x8000_0000_0000_0000, false)]
    fn shifts_and_rotates(
        #[case] op: ShiftOp,
        #[case] value: u64,
        #[case] count: u64,
        #[case] bits: u32,
        #[case] expected: u64,
        #[case] carry: bool,
    ) {
        let (result, flags) = shift(op, value, count, bits).expect("non-zero count");
        assert_eq!(result, expected);
        assert_eq!(flags.cf, Some(carry));
    }

    #[test]
    fn zero_count_shift_changes_nothing() {
        assert!(shift(ShiftOp::Shl, 1, 0, 32).is_none());
        assert!(shift(ShiftOp::Shl, 1, 0x20, 32).is_none());
    }

    #[test]
    fn sign_extension_uses_source_width() {
        assert_eq!(sign_extend(0x80, 8), -128);
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0xFFFF_FFFF, 32), -1);
    }

    #[test]
    fn conditions_read_status_flags() {
        let mut regs = RegisterFile::default();
        regs.set_flag(RFLAGS_ZF, true);
        assert!(Condition::E.holds(&regs));
        assert!(Condition::Be.holds(&regs));
        assert!(!Condition::A.holds(&regs));

        regs.set_flag(RFLAGS_ZF, false);
        regs.set_flag(RFLAGS_SF, true);
        assert!(Condition::L.holds(&regs));
        assert!(!Condition::Ge.holds(&regs));

        regs.set_flag(RFLAGS_CF, true);
        assert!(Condition::B.holds(&regs));
    }
}
