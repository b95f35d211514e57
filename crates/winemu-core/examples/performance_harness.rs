//! Instruction throughput of the interpreter under budgeted sessions.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p winemu-core --release --example performance_harness
//! ```
//!
//! ## Metrics
//!
//! - Instructions per second, summed over all threads
//! - Sessions per second at the configured budget
//!
//! Each thread owns one emulator and repeatedly runs the summing loop in
//! sessions of [`SESSION_BUDGET`] instructions, rebuilding the process
//! whenever the guest exits.

#![allow(clippy::pedantic)]

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
    EmulatorConfig, NtKernel, RunRequest, StopReason, WindowsEmulator, X64Interpreter,
};
use winemu_image::samples;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const SESSION_BUDGET: u64 = 10_000;
const LOOP_COUNT: u32 = 1_000_000;
const NUM_THREADS: usize = 4;

#[derive(Debug, Clone, Copy)]
struct BenchmarkResult {
    name: &'static str,
    instructions_per_second: f64,
    sessions_per_second: f64,
}

fn fresh(image: &[u8]) -> WindowsEmulator {
    let config = EmulatorConfig {
        log_output: false,
        ..EmulatorConfig::default()
    };
    WindowsEmulator::from_image_bytes(
        "bench.exe",
        image,
        config,
        X64Interpreter::new(),
        NtKernel::default(),
    )
    .expect("benchmark image should map")
}

fn benchmark_sum_loop(duration: Duration) -> BenchmarkResult {
    let image = samples::sum_to(LOOP_COUNT).expect("sample should build");
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let tx = tx.clone();
            let image = image.clone();
            thread::spawn(move || {
                let mut emulator = fresh(&image);
                let request = RunRequest::new().with_instruction_limit(SESSION_BUDGET);
                let mut total_instructions = 0u64;
                let mut sessions = 0u64;
                let start = Instant::now();

                while start.elapsed() < duration {
                    let outcome = emulator.start(request.clone());
                    total_instructions += outcome.retired;
                    sessions += 1;
                    match outcome.stop {
                        StopReason::BudgetExhausted => {}
                        StopReason::Terminated(_) => emulator = fresh(&image),
                        StopReason::Faulted(fault) => panic!("benchmark faulted: {fault}"),
                    }
                }

                tx.send((total_instructions, sessions)).ok();
            })
        })
        .collect();
    drop(tx);

    for h in handles {
        h.join().expect("benchmark thread panicked");
    }

    let (instructions, sessions) = rx
        .iter()
        .fold((0u64, 0u64), |(i, s), (di, ds)| (i + di, s + ds));
    let seconds = duration.as_secs_f64();
    BenchmarkResult {
        name: "sum loop",
        instructions_per_second: instructions as f64 / seconds,
        sessions_per_second: sessions as f64 / seconds,
    }
}

fn main() {
    let duration = Duration::from_secs(3);
    println!("winemu-core performance harness");
    println!("threads: {NUM_THREADS}, session budget: {SESSION_BUDGET} instructions");
    println!();

    let result = benchmark_sum_loop(duration);
    println!("{}", result.name);
    println!(
        "  instructions/s: {:>14.0} ({:.2} M)",
        result.instructions_per_second,
        result.instructions_per_second / 1_000_000.0
    );
    println!("  sessions/s:     {:>14.0}", result.sessions_per_second);
}
