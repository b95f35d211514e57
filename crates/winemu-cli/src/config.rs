//! Command-line interface definition.

use std::path::PathBuf;

use clap::Parser;
use winemu_core::{EmulatorConfig, MapperConfig};

/// Runs a 64-bit Windows executable on the winemu emulator.
///
/// The process exit code of the guest becomes the exit code of this
/// command. A fault exits with 1, a suspended run (instruction limit
/// reached) with 3.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// PE32+ executable to run
    pub image: PathBuf,

    /// Command-line arguments handed to the guest (after the image name)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Stop after this many instructions
    #[arg(short = 'n', long, help = "Maximum number of instructions to execute")]
    pub instruction_limit: Option<u64>,

    /// Extra directories searched for dependent DLLs
    #[arg(short = 'L', long = "search-path", value_name = "DIR")]
    pub search_paths: Vec<PathBuf>,

    /// Stack reserve in bytes (overrides the image header)
    #[arg(long, value_parser = parse_size)]
    pub stack_size: Option<u64>,

    /// Print every retired instruction
    #[arg(long)]
    pub trace: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", help = "Set the logging level")]
    pub log_level: String,

    /// Suppress emulator diagnostics entirely
    #[arg(short, long)]
    pub quiet: bool,
}

impl Config {
    /// Emulator configuration described by the flags.
    #[must_use]
    pub fn emulator_config(&self) -> EmulatorConfig {
        EmulatorConfig {
            mapper: MapperConfig {
                search_paths: self.search_paths.clone(),
            },
            stack_size: self.stack_size,
            log_output: !self.quiet,
            ..EmulatorConfig::default()
        }
    }

    /// Guest command line: the image name followed by the extra arguments.
    #[must_use]
    pub fn guest_args(&self) -> Vec<String> {
        let name = self.image.file_name().map_or_else(
            || self.image.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        std::iter::once(name).chain(self.args.iter().cloned()).collect()
    }
}

/// Accepts decimal or `0x`-prefixed hexadecimal sizes.
fn parse_size(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|error| format!("invalid size {value:?}: {error}"))
}
