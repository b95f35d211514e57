/// Number of x64 general-purpose registers (`RAX..R15`).
pub const GENERAL_REGISTER_COUNT: usize = 16;
/// `RFLAGS` carry flag.
pub const RFLAGS_CF: u64 = 1 << 0;
/// `RFLAGS` always-one reserved bit.
pub const RFLAGS_RESERVED: u64 = 1 << 1;
/// `RFLAGS` parity flag.
pub const RFLAGS_PF: u64 = 1 << 2;
/// `RFLAGS` auxiliary-carry flag.
pub const RFLAGS_AF: u64 = 1 << 4;
/// `RFLAGS` zero flag.
pub const RFLAGS_ZF: u64 = 1 << 6;
/// `RFLAGS` sign flag.
pub const RFLAGS_SF: u64 = 1 << 7;
/// `RFLAGS` interrupt-enable flag.
pub const RFLAGS_IF: u64 = 1 << 9;
/// `RFLAGS` direction flag.
pub const RFLAGS_DF: u64 = 1 << 10;
/// `RFLAGS` overflow flag.
pub const RFLAGS_OF: u64 = 1 << 11;

/// x64 general-purpose register identifier, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum GeneralRegister {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl GeneralRegister {
    /// All general-purpose registers in encoding order.
    pub const ALL: [Self; GENERAL_REGISTER_COUNT] = [
        Self::Rax,
        Self::Rcx,
        Self::Rdx,
        Self::Rbx,
        Self::Rsp,
        Self::Rbp,
        Self::Rsi,
        Self::Rdi,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
    ];

    /// Returns the array index for this register (`0..=15`).
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decodes a 4-bit register number.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < GENERAL_REGISTER_COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }
}

/// Guest-visible x64 register state of the single emulated thread.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegisterFile {
    gpr: [u64; GENERAL_REGISTER_COUNT],
    rip: u64,
    rflags: u64,
    fs_base: u64,
    gs_base: u64,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            gpr: [0; GENERAL_REGISTER_COUNT],
            rip: 0,
            rflags: RFLAGS_RESERVED,
            fs_base: 0,
            gs_base: 0,
        }
    }
}

impl RegisterFile {
    /// Reads a general-purpose register.
    #[must_use]
    pub const fn gpr(&self, reg: GeneralRegister) -> u64 {
        self.gpr[reg.index()]
    }

    /// Writes a general-purpose register.
    pub const fn set_gpr(&mut self, reg: GeneralRegister, value: u64) {
        self.gpr[reg.index()] = value;
    }

    /// All general-purpose registers in encoding order.
    #[must_use]
    pub const fn gprs(&self) -> &[u64; GENERAL_REGISTER_COUNT] {
        &self.gpr
    }

    /// Reads `RIP`.
    #[must_use]
    pub const fn rip(&self) -> u64 {
        self.rip
    }

    /// Writes `RIP`.
    pub const fn set_rip(&mut self, value: u64) {
        self.rip = value;
    }

    /// Reads `RSP`.
    #[must_use]
    pub const fn rsp(&self) -> u64 {
        self.gpr(GeneralRegister::Rsp)
    }

    /// Writes `RSP`.
    pub const fn set_rsp(&mut self, value: u64) {
        self.set_gpr(GeneralRegister::Rsp, value);
    }

    /// Reads `RFLAGS`.
    #[must_use]
    pub const fn rflags(&self) -> u64 {
        self.rflags
    }

    /// Writes `RFLAGS`; the reserved bit 1 always reads as one.
    pub const fn set_rflags(&mut self, value: u64) {
        self.rflags = value | RFLAGS_RESERVED;
    }

    /// Returns `true` when a specific `RFLAGS` bit is set.
    #[must_use]
    pub const fn flag(&self, flag: u64) -> bool {
        (self.rflags & flag) != 0
    }

    /// Sets or clears a specific `RFLAGS` bit.
    pub const fn set_flag(&mut self, flag: u64, enabled: bool) {
        if enabled {
            self.rflags |= flag;
        } else {
            self.rflags &= !flag;
        }
        self.rflags |= RFLAGS_RESERVED;
    }

    /// Reads the `FS` segment base.
    #[must_use]
    pub const fn fs_base(&self) -> u64 {
        self.fs_base
    }

    /// Writes the `FS` segment base.
    pub const fn set_fs_base(&mut self, value: u64) {
        self.fs_base = value;
    }

    /// Reads the `GS` segment base (thread block pointer on x64 Windows).
    #[must_use]
    pub const fn gs_base(&self) -> u64 {
        self.gs_base
    }

    /// Writes the `GS` segment base.
    pub const fn set_gs_base(&mut self, value: u64) {
        self.gs_base = value;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        GeneralRegister, RegisterFile, GENERAL_REGISTER_COUNT, RFLAGS_CF, RFLAGS_RESERVED,
        RFLAGS_ZF,
    };

    #[test]
    fn register_indices_follow_encoding_order() {
        for (index, reg) in GeneralRegister::ALL.iter().enumerate() {
            assert_eq!(reg.index(), index);
            assert_eq!(GeneralRegister::from_index(index), Some(*reg));
        }
        assert!(GeneralRegister::from_index(GENERAL_REGISTER_COUNT).is_none());
    }

    #[test]
    fn general_register_file_tracks_each_register_independently() {
        let mut regs = RegisterFile::default();
        for (offset, reg) in (0_u64..).zip(GeneralRegister::ALL) {
            regs.set_gpr(reg, 0x1000_0000_0000 + offset);
        }
        for (offset, reg) in (0_u64..).zip(GeneralRegister::ALL) {
            assert_eq!(regs.gpr(reg), 0x1000_0000_0000 + offset);
        }
        assert_eq!(regs.rsp(), 0x1000_0000_0004);
    }

    #[test]
    fn reserved_flag_bit_always_reads_as_one() {
        let mut regs = RegisterFile::default();
        assert_eq!(regs.rflags(), RFLAGS_RESERVED);

        regs.set_rflags(0);
        assert_eq!(regs.rflags(), RFLAGS_RESERVED);

        regs.set_flag(RFLAGS_ZF, true);
        regs.set_flag(RFLAGS_CF, true);
        assert!(regs.flag(RFLAGS_ZF));
        regs.set_flag(RFLAGS_ZF, false);
        assert!(!regs.flag(RFLAGS_ZF));
        assert_eq!(regs.rflags(), RFLAGS_RESERVED | RFLAGS_CF);
    }
}
