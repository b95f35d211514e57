//! Process context: everything one emulated process owns.

use widestring::U16String;

use crate::api::{MAX_STACK_SIZE, MIN_STACK_SIZE};
use crate::mapper::{MappedBinary, ModuleTable};
use crate::memory::{align_up, AddressSpace, MemoryError, Permissions, PAGE_SIZE};
use crate::state::{GeneralRegister, RegisterFile, Termination, RFLAGS_IF, RFLAGS_RESERVED};
use crate::Fault;

/// Bytes between the initial `RSP` and the stack top: the return address
/// slot plus the 32-byte home area.
pub const ENTRY_FRAME_SIZE: u64 = 0x28;

/// `NT_TIB.StackBase`.
pub const TEB_STACK_BASE: u64 = 0x08;
/// `NT_TIB.StackLimit`.
pub const TEB_STACK_LIMIT: u64 = 0x10;
/// `NT_TIB.Self`.
pub const TEB_SELF: u64 = 0x30;

/// `mov rdx, rax; mov r10, -1; mov eax, imm32; syscall; int3`.
fn exit_stub(terminate_process: u32) -> Vec<u8> {
    let mut code = vec![0x48, 0x89, 0xC2, 0x49, 0xC7, 0xC2, 0xFF, 0xFF, 0xFF, 0xFF, 0xB8];
    code.extend_from_slice(&terminate_process.to_le_bytes());
    code.extend_from_slice(&[0x0F, 0x05, 0xCC]);
    code
}

/// Emulator-owned regions created around the main image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ProcessLayout {
    /// Lowest stack address (`StackLimit`).
    pub stack_limit: u64,
    /// One past the highest stack address (`StackBase`).
    pub stack_base: u64,
    /// Thread environment block; also the `GS` base.
    pub teb: u64,
    /// Code the entry point returns into.
    pub exit_stub: u64,
}

/// Initial process parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessParams {
    /// Stack reserve override.
    pub stack_size: Option<u64>,
    /// Service number the exit stub invokes.
    pub terminate_process: u32,
}

/// Stack size actually reserved for `requested` bytes.
#[must_use]
pub fn stack_size_for(requested: u64) -> u64 {
    let clamped = requested.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE);
    align_up(clamped, PAGE_SIZE).unwrap_or(MAX_STACK_SIZE)
}

/// State of one emulated process.
///
/// Only the execution engine mutates it once the facade has finished setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessContext {
    pub(crate) registers: RegisterFile,
    pub(crate) memory: AddressSpace,
    pub(crate) modules: ModuleTable,
    pub(crate) executed_instructions: u64,
    pub(crate) termination: Termination,
    pub(crate) started: bool,
    pub(crate) command_line: Option<u64>,
    layout: Option<ProcessLayout>,
}

impl ProcessContext {
    /// Wraps already-prepared state. No stack, thread block or exit stub is
    /// created; the caller owns the register setup.
    #[must_use]
    pub const fn from_parts(
        memory: AddressSpace,
        modules: ModuleTable,
        registers: RegisterFile,
    ) -> Self {
        Self {
            registers,
            memory,
            modules,
            executed_instructions: 0,
            termination: Termination::Running,
            started: false,
            command_line: None,
            layout: None,
        }
    }

    /// Builds the initial process around `main`, whose image is already in
    /// `memory`.
    ///
    /// # Errors
    ///
    /// Returns a [`MemoryError`] when a setup region cannot be allocated.
    pub fn create(
        memory: AddressSpace,
        modules: ModuleTable,
        main: &MappedBinary,
        entry: u64,
        params: ProcessParams,
    ) -> Result<Self, MemoryError> {
        let mut process = Self::from_parts(memory, modules, RegisterFile::default());
        let stack_size = stack_size_for(params.stack_size.unwrap_or(main.stack_reserve()));

        let stack = process
            .memory
            .allocate(None, stack_size, Permissions::READ_WRITE)?;
        let teb = process
            .memory
            .allocate(None, PAGE_SIZE, Permissions::READ_WRITE)?;
        let stub = process
            .memory
            .allocate(None, PAGE_SIZE, Permissions::READ_EXECUTE)?;

        let layout = ProcessLayout {
            stack_limit: stack.base,
            stack_base: stack.end(),
            teb: teb.base,
            exit_stub: stub.base,
        };
        process
            .memory
            .load(stub.base, &exit_stub(params.terminate_process))?;
        process
            .memory
            .write_u64(teb.base + TEB_STACK_BASE, layout.stack_base)?;
        process
            .memory
            .write_u64(teb.base + TEB_STACK_LIMIT, layout.stack_limit)?;
        process.memory.write_u64(teb.base + TEB_SELF, teb.base)?;

        let rsp = layout.stack_base - ENTRY_FRAME_SIZE;
        process.memory.write_u64(rsp, layout.exit_stub)?;

        let regs = &mut process.registers;
        regs.set_rip(entry);
        regs.set_rsp(rsp);
        regs.set_rflags(RFLAGS_RESERVED | RFLAGS_IF);
        regs.set_gs_base(teb.base);

        process.layout = Some(layout);
        Ok(process)
    }

    /// Writes the command line for the entry point: `RCX` receives its
    /// address, `RDX` its length in UTF-16 code units (NUL excluded).
    pub(crate) fn stage_arguments(&mut self, args: &[String]) -> Result<(), MemoryError> {
        let joined = args.join(" ");
        let units = U16String::from_str(&joined).into_vec();
        let length = units.len() as u64;
        let bytes: Vec<u8> = units
            .iter()
            .chain(std::iter::once(&0u16))
            .flat_map(|unit| unit.to_le_bytes())
            .collect();

        let region = self
            .memory
            .allocate(None, bytes.len() as u64, Permissions::READ)?;
        self.memory.load(region.base, &bytes)?;
        self.registers.set_gpr(GeneralRegister::Rcx, region.base);
        self.registers.set_gpr(GeneralRegister::Rdx, length);
        self.command_line = Some(region.base);
        Ok(())
    }

    /// Register file.
    #[must_use]
    pub const fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// Address space.
    #[must_use]
    pub const fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    /// Mapped modules, main image first.
    #[must_use]
    pub const fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    /// Instructions retired since the process was created.
    #[must_use]
    pub const fn executed_instructions(&self) -> u64 {
        self.executed_instructions
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn termination(&self) -> Termination {
        self.termination
    }

    /// Exit code, once terminated.
    #[must_use]
    pub const fn exit_code(&self) -> Option<u32> {
        self.termination.exit_code()
    }

    /// Latched fault, once faulted.
    #[must_use]
    pub const fn fault(&self) -> Option<Fault> {
        self.termination.fault()
    }

    /// Returns `true` once a run call was allowed to execute.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Address of the staged command line.
    #[must_use]
    pub const fn command_line(&self) -> Option<u64> {
        self.command_line
    }

    /// Emulator-owned regions, for processes built by [`Self::create`].
    #[must_use]
    pub const fn layout(&self) -> Option<ProcessLayout> {
        self.layout
    }
}
