//! Guest CPU and lifecycle state.

/// x64 register file.
pub mod registers;
/// Process termination state.
pub mod run_state;

pub use registers::{
    GeneralRegister, RegisterFile, GENERAL_REGISTER_COUNT, RFLAGS_AF, RFLAGS_CF, RFLAGS_DF,
    RFLAGS_IF, RFLAGS_OF, RFLAGS_PF, RFLAGS_RESERVED, RFLAGS_SF, RFLAGS_ZF,
};
pub use run_state::Termination;
