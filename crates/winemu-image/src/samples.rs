//! Canned guest programs.
//!
//! Every executable's entry point returns its result in `EAX`; the emulator's
//! exit stub turns that into the process exit code. The stub itself retires
//! [`EXIT_STUB_INSTRUCTIONS`] instructions.

use iced_x86::code_asm::{
    byte_ptr, eax, ecx, edx, ptr, qword_ptr, r10, rax, rcx, rsp, CodeAssembler, CodeLabel,
};
use iced_x86::{BlockEncoderOptions, IcedError};

use crate::builder::{
    iat_slot, BuildError, ExportItem, ImageBuilder, ImportModule, ImportName, SectionSpec,
    DATA, DEFAULT_DLL_BASE, DEFAULT_EXE_BASE, REL_DIR64, TEXT,
};

/// Instructions retired by the exit stub after the entry point returns.
pub const EXIT_STUB_INSTRUCTIONS: u64 = 4;

/// RVA of `.text` in every sample.
pub const TEXT_RVA: u32 = 0x1000;
/// RVA of `.data`.
pub const DATA_RVA: u32 = 0x2000;
/// RVA of the generated import section.
pub const IMPORT_RVA: u32 = 0x3000;
/// RVA of the generated export section.
pub const EXPORT_RVA: u32 = 0x4000;
/// RVA of the generated relocation section.
pub const RELOC_RVA: u32 = 0x5000;

/// File name the import samples expect for [`math_library`].
pub const MATH_LIBRARY: &str = "mathlib.dll";

/// Sample names accepted by [`by_name`].
pub const NAMES: &[&str] = &[
    "return-code",
    "sum-to",
    "factorial",
    "terminate",
    "argument-length",
    "global-counter",
    "importer",
    "mathlib",
    "breakpoint",
    "write-to-code",
    "divide-by-zero",
    "unsupported-syscall",
];

/// Builds sample `name` with its default parameters, or `None` for an
/// unknown name.
#[must_use]
pub fn by_name(name: &str) -> Option<Result<Vec<u8>, BuildError>> {
    Some(match name {
        "return-code" => return_code(42),
        "sum-to" => sum_to(100),
        "factorial" => factorial(10),
        "terminate" => terminate(7),
        "argument-length" => argument_length(),
        "global-counter" => global_counter(DEFAULT_EXE_BASE, 25),
        "importer" => importer(),
        "mathlib" => math_library(DEFAULT_DLL_BASE),
        "breakpoint" => breakpoint(),
        "write-to-code" => write_to_code(),
        "divide-by-zero" => divide_by_zero(),
        "unsupported-syscall" => unsupported_syscall(0x1FF),
        _ => return None,
    })
}

/// Assembled code plus the addresses of the labels `build` returned.
struct Assembled {
    code: Vec<u8>,
    labels: Vec<u64>,
}

fn assemble(
    ip: u64,
    build: impl FnOnce(&mut CodeAssembler) -> Result<Vec<CodeLabel>, IcedError>,
) -> Result<Assembled, BuildError> {
    let mut asm = CodeAssembler::new(64)?;
    let labels = build(&mut asm)?;
    let result = asm.assemble_options(ip, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
    let labels = labels
        .iter()
        .map(|label| result.label_ip(label))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Assembled {
        code: result.inner.code_buffer,
        labels,
    })
}

fn rva_of(base: u64, address: u64) -> Result<u32, BuildError> {
    address
        .checked_sub(base)
        .and_then(|offset| u32::try_from(offset).ok())
        .ok_or_else(|| BuildError::Layout(format!("address {address:#x} is not inside the image")))
}

fn simple_executable(
    build: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
) -> Result<Vec<u8>, BuildError> {
    let text = assemble(DEFAULT_EXE_BASE + u64::from(TEXT_RVA), |a| {
        build(a)?;
        Ok(Vec::new())
    })?;
    ImageBuilder::executable()
        .entry(TEXT_RVA)
        .section(SectionSpec::new(".text", TEXT_RVA, TEXT, text.code))
        .build()
}

/// `mov eax, code; ret`.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn return_code(code: u32) -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        a.mov(eax, code)?;
        a.ret()
    })
}

/// Sums `1..=n` in a loop and returns the sum. Retires `3 * n + 3`
/// instructions before the exit stub.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn sum_to(n: u32) -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        let mut top = a.create_label();
        a.xor(eax, eax)?;
        a.mov(ecx, n)?;
        a.set_label(&mut top)?;
        a.add(eax, ecx)?;
        a.dec(ecx)?;
        a.jne(top)?;
        a.ret()
    })
}

/// Recursive `n!` (wrapping at 32 bits).
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn factorial(n: u32) -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        let mut fact = a.create_label();
        let mut base_case = a.create_label();
        a.mov(ecx, n)?;
        a.call(fact)?;
        a.ret()?;

        a.set_label(&mut fact)?;
        a.cmp(ecx, 1)?;
        a.jbe(base_case)?;
        a.push(rcx)?;
        a.dec(ecx)?;
        a.call(fact)?;
        a.pop(rcx)?;
        a.imul_2(eax, ecx)?;
        a.ret()?;

        a.set_label(&mut base_case)?;
        a.mov(eax, 1)?;
        a.ret()
    })
}

/// Calls `NtTerminateProcess(-1, code)` directly; never returns to the stub.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn terminate(code: u32) -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        a.mov(r10, -1i64)?;
        a.mov(edx, code)?;
        a.mov(eax, 0x2C)?;
        a.syscall()?;
        a.int3()
    })
}

/// Returns the command-line length passed in `RDX`.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn argument_length() -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        a.mov(eax, edx)?;
        a.ret()
    })
}

/// Increments a `.data` counter `n` times through an absolute pointer and
/// returns it. The pointer is covered by a `DIR64` relocation, so the image
/// runs correctly at any base, including a preferred base of 0.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn global_counter(image_base: u64, n: u32) -> Result<Vec<u8>, BuildError> {
    let counter = image_base + u64::from(DATA_RVA);
    let text = assemble(image_base + u64::from(TEXT_RVA), |a| {
        let mut top = a.create_label();
        // mov rax, imm64: the immediate sits at offset 2.
        a.db(&[0x48, 0xB8])?;
        a.db(&counter.to_le_bytes())?;
        a.mov(ecx, n)?;
        a.set_label(&mut top)?;
        a.inc(qword_ptr(rax))?;
        a.dec(ecx)?;
        a.jne(top)?;
        a.mov(rax, qword_ptr(rax))?;
        a.ret()?;
        Ok(Vec::new())
    })?;
    ImageBuilder::executable()
        .image_base(image_base)
        .entry(TEXT_RVA)
        .section(SectionSpec::new(".text", TEXT_RVA, TEXT, text.code))
        .section(SectionSpec::new(".data", DATA_RVA, DATA, vec![0; 8]))
        .relocations(RELOC_RVA, vec![(TEXT_RVA + 2, REL_DIR64)])
        .build()
}

/// `mathlib.dll`: exports `add_one(x) = x + 1` (ordinal 1), `twice(x) = 2x`
/// (ordinal 2), `plus_one` forwarded to `MATHLIB.add_one` (ordinal 3) and
/// `add_one_ptr` (ordinal 4), a relocated data pointer to `add_one`.
/// Declares no entry point.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn math_library(image_base: u64) -> Result<Vec<u8>, BuildError> {
    let text = assemble(image_base + u64::from(TEXT_RVA), |a| {
        let mut add_one = a.create_label();
        let mut twice = a.create_label();
        a.set_label(&mut add_one)?;
        a.lea(eax, ptr(rcx + 1))?;
        a.ret()?;
        a.set_label(&mut twice)?;
        a.lea(eax, ptr(rcx + rcx))?;
        a.ret()?;
        Ok(vec![add_one, twice])
    })?;
    let add_one = rva_of(image_base, text.labels[0])?;
    let twice = rva_of(image_base, text.labels[1])?;
    let pointer = image_base + u64::from(add_one);

    ImageBuilder::dll()
        .image_base(image_base)
        .section(SectionSpec::new(".text", TEXT_RVA, TEXT, text.code))
        .section(SectionSpec::new(
            ".data",
            DATA_RVA,
            DATA,
            pointer.to_le_bytes().to_vec(),
        ))
        .exports(
            EXPORT_RVA,
            MATH_LIBRARY,
            vec![
                ExportItem::named("add_one", add_one),
                ExportItem::named("twice", twice),
                ExportItem::forwarder("plus_one", "MATHLIB.add_one"),
                ExportItem::named("add_one_ptr", DATA_RVA),
            ],
        )
        .relocations(RELOC_RVA, vec![(DATA_RVA, REL_DIR64)])
        .build()
}

/// Imports from [`MATH_LIBRARY`] used by [`importer`], in IAT order.
#[must_use]
pub fn importer_imports() -> Vec<ImportModule> {
    vec![ImportModule {
        name: MATH_LIBRARY.to_owned(),
        symbols: vec![
            ImportName::Name("add_one".into()),
            ImportName::Name("plus_one".into()),
            ImportName::Ordinal(2),
        ],
    }]
}

/// Executable computing 42 through `mathlib.dll`: by name, through the
/// forwarder and by ordinal.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn importer() -> Result<Vec<u8>, BuildError> {
    let base = DEFAULT_EXE_BASE;
    let text_va = base + u64::from(TEXT_RVA);
    let modules = importer_imports();

    let text = assemble(text_va, |a| {
        // One `jmp [rip + slot]` thunk per import at the start of .text.
        let mut thunks = Vec::new();
        for index in 0..modules[0].symbols.len() {
            let mut thunk = a.create_label();
            a.set_label(&mut thunk)?;
            let slot = base + u64::from(iat_slot(IMPORT_RVA, &modules, 0, index));
            let next = text_va + 6 * index as u64 + 6;
            #[allow(clippy::cast_possible_truncation)]
            let displacement = slot.wrapping_sub(next) as u32;
            a.db(&[0xFF, 0x25])?;
            a.db(&displacement.to_le_bytes())?;
            thunks.push(thunk);
        }
        let (add_one, plus_one, twice) = (thunks[0], thunks[1], thunks[2]);

        let mut main = a.create_label();
        a.set_label(&mut main)?;
        a.sub(rsp, 0x28)?;
        a.mov(ecx, 19)?;
        a.call(twice)?;
        a.mov(ecx, eax)?;
        a.call(add_one)?;
        a.mov(ecx, eax)?;
        a.call(plus_one)?;
        a.mov(ecx, eax)?;
        a.call(add_one)?;
        a.mov(ecx, eax)?;
        a.call(plus_one)?;
        a.add(rsp, 0x28)?;
        a.ret()?;
        Ok(vec![main])
    })?;
    let entry = rva_of(base, text.labels[0])?;

    ImageBuilder::executable()
        .entry(entry)
        .section(SectionSpec::new(".text", TEXT_RVA, TEXT, text.code))
        .imports(IMPORT_RVA, modules)
        .build()
}

/// `nop; int3`.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn breakpoint() -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        a.nop()?;
        a.int3()
    })
}

/// Stores into its own code section.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn write_to_code() -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        let mut here = a.create_label();
        a.set_label(&mut here)?;
        a.lea(rax, ptr(here))?;
        a.mov(byte_ptr(rax), 0x90)?;
        a.ret()
    })
}

/// `idiv` by zero after one setup instruction pair.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn divide_by_zero() -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        a.xor(ecx, ecx)?;
        a.mov(eax, 1)?;
        a.cdq()?;
        a.idiv(ecx)?;
        a.ret()
    })
}

/// Issues syscall `number`.
///
/// # Errors
///
/// Propagates assembler and layout errors.
pub fn unsupported_syscall(number: u32) -> Result<Vec<u8>, BuildError> {
    simple_executable(|a| {
        a.mov(eax, number)?;
        a.syscall()?;
        a.ret()
    })
}
