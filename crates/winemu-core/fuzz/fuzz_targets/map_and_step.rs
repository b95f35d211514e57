#![no_main]

use libfuzzer_sys::fuzz_target;
use winemu_core::{
    AddressSpace, ExecutionEngine, Logger, MapperConfig, ModuleMapper, ModuleTable, NtKernel,
    Permissions, ProcessContext, RegisterFile, RunRequest, X64Interpreter,
};

const CODE: u64 = 0x1_0000;
const BUDGET: u64 = 256;

fuzz_target!(|data: &[u8]| {
    let Some((&mode, rest)) = data.split_first() else {
        return;
    };
    let logger = Logger::silent();

    if mode & 1 == 0 {
        // Untrusted image: mapping either succeeds or leaves no trace.
        let config = MapperConfig::default();
        let mut space = AddressSpace::new();
        let mut modules = ModuleTable::new();
        let result = ModuleMapper::new(&config, &logger).map_bytes(
            &mut space,
            &mut modules,
            "fuzz.exe",
            rest,
        );
        if result.is_err() {
            assert_eq!(space.region_count(), 0);
            assert!(modules.is_empty());
        }
        return;
    }

    // Raw code: a bounded run always stops between instructions.
    let mut memory = AddressSpace::new();
    if memory
        .allocate(Some(CODE), 0x1000, Permissions::READ_EXECUTE)
        .is_err()
        || memory.load(CODE, &rest[..rest.len().min(0x1000)]).is_err()
    {
        return;
    }
    memory
        .allocate(Some(0x2_0000), 0x1_0000, Permissions::READ_WRITE)
        .ok();
    let mut regs = RegisterFile::default();
    regs.set_rip(CODE);
    regs.set_rsp(0x2_8000);
    let mut process = ProcessContext::from_parts(memory, ModuleTable::new(), regs);

    let mut engine = ExecutionEngine::new(X64Interpreter::new(), NtKernel::default());
    let request = RunRequest::new().with_instruction_limit(BUDGET);
    let outcome = engine.run(&mut process, &request, &logger, &mut ());
    assert!(outcome.retired <= BUDGET);
    assert_eq!(process.executed_instructions(), outcome.retired);
});
