//! Writes sample guest images to disk.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use iced_x86 as _;
use thiserror as _;
#[cfg(test)]
use tempfile as _;
use winemu_image::samples;

const USAGE_TEXT: &str = "\
Usage: winemu-sample <name> <output>
       winemu-sample --list

Arguments:
  <name>    Sample to build (see --list)
  <output>  File the PE image is written to

Options:
  -l, --list  Print the available sample names
  -h, --help  Show this help message

Examples:
  winemu-sample sum-to sum.exe
  winemu-sample mathlib mathlib.dll
";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Write { name: String, output: PathBuf },
    List,
    Help,
}

fn parse_args(args: impl Iterator<Item = OsString>) -> Result<Command, String> {
    let mut positional = Vec::new();
    for arg in args {
        if arg == "--help" || arg == "-h" {
            return Ok(Command::Help);
        }
        if arg == "--list" || arg == "-l" {
            return Ok(Command::List);
        }
        if arg.to_string_lossy().starts_with('-') {
            return Err(format!("unknown option: {}", arg.to_string_lossy()));
        }
        positional.push(arg);
    }

    let mut positional = positional.into_iter();
    let name = positional
        .next()
        .ok_or_else(|| "missing sample name".to_string())?
        .to_string_lossy()
        .into_owned();
    let output = positional
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| "missing output path".to_string())?;
    if positional.next().is_some() {
        return Err("too many arguments".to_string());
    }
    Ok(Command::Write { name, output })
}

fn run_write(name: &str, output: &Path) -> Result<(), i32> {
    let image = match samples::by_name(name) {
        Some(Ok(image)) => image,
        Some(Err(e)) => {
            eprintln!("error: failed to build {name}: {e}");
            return Err(1);
        }
        None => {
            eprintln!("error: unknown sample: {name} (try --list)");
            return Err(2);
        }
    };

    if let Err(e) = fs::write(output, &image) {
        eprintln!("error: failed to write output: {e}");
        return Err(1);
    }

    println!("Wrote {name} ({} bytes) -> {}", image.len(), output.display());
    Ok(())
}

fn main() {
    let command = match parse_args(env::args_os().skip(1)) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}\n\n{USAGE_TEXT}");
            std::process::exit(2);
        }
    };

    let result = match command {
        Command::Help => {
            print!("{USAGE_TEXT}");
            Ok(())
        }
        Command::List => {
            for name in samples::NAMES {
                println!("{name}");
            }
            Ok(())
        }
        Command::Write { name, output } => run_write(&name, &output),
    };

    if let Err(code) = result {
        std::process::exit(code);
    }
}
