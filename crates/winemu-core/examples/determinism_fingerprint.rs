//! Deterministic run fingerprint used for cross-host comparison.
//!
//! Runs the relocating counter sample in budgeted sessions and hashes the
//! final process state. Two hosts agree iff they print the same hash.

use bitflags as _;
use goblin as _;
use iced_x86 as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use tempfile as _;
use thiserror as _;
use tracing as _;
use widestring as _;
use winemu_core::{
    EmulatorConfig, NtKernel, RunRequest, StopReason, Termination, WindowsEmulator, X64Interpreter,
};
use winemu_image::samples;

const SESSION: u64 = 17;

fn hash_bytes(hash: &mut u64, bytes: &[u8]) {
    for byte in bytes {
        *hash ^= u64::from(*byte);
        *hash = hash.wrapping_mul(0x1000_0000_01B3);
    }
}

fn fingerprint() -> String {
    let image = samples::global_counter(0, 40).expect("sample should build");
    let config = EmulatorConfig {
        log_output: false,
        ..EmulatorConfig::default()
    };
    let mut emulator = WindowsEmulator::from_image_bytes(
        "counter.exe",
        &image,
        config,
        X64Interpreter::new(),
        NtKernel::default(),
    )
    .expect("sample should map");

    let mut sessions = 0u64;
    while emulator
        .start(RunRequest::new().with_instruction_limit(SESSION))
        .stop
        == StopReason::BudgetExhausted
    {
        sessions += 1;
    }

    let process = emulator.process();
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    hash_bytes(&mut hash, &sessions.to_le_bytes());
    hash_bytes(&mut hash, &process.executed_instructions().to_le_bytes());

    match process.termination() {
        Termination::Running => hash_bytes(&mut hash, &[0x00]),
        Termination::Terminated(code) => {
            hash_bytes(&mut hash, &[0x01]);
            hash_bytes(&mut hash, &code.to_le_bytes());
        }
        Termination::Faulted(fault) => {
            hash_bytes(&mut hash, &[0x02, fault.code.as_u8()]);
            hash_bytes(&mut hash, &fault.rip.to_le_bytes());
        }
    }

    let regs = process.registers();
    for value in regs.gprs() {
        hash_bytes(&mut hash, &value.to_le_bytes());
    }
    hash_bytes(&mut hash, &regs.rip().to_le_bytes());
    hash_bytes(&mut hash, &regs.rflags().to_le_bytes());
    for region in process.memory().regions() {
        hash_bytes(&mut hash, &region.base.to_le_bytes());
        hash_bytes(&mut hash, &region.size.to_le_bytes());
        hash_bytes(&mut hash, &[region.permissions.bits()]);
    }

    format!("{hash:016x}")
}

fn main() {
    println!("{}", fingerprint());
}
