use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use env_logger::Builder;
use log::{error, LevelFilter};
use pikey::{InterpretError, Vm, VmConfig};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::exit;

const EXIT_USAGE: i32 = 64;
const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;
const EXIT_IO_ERROR: i32 = 74;

#[derive(Parser, Debug)]
#[command(version, about = "Run a pikey script, or start a REPL without one")]
struct Args {
    file: Option<PathBuf>,
    /// Collect garbage before every allocation
    #[arg(long)]
    gc_stress: bool,
    /// Seed for the random natives
    #[arg(long)]
    seed: Option<u64>,
    /// Log everything the VM does
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            eprintln!("{e}");
            exit(EXIT_USAGE);
        }
    };
    init_logger(args.verbose);

    let config = VmConfig {
        gc_stress: args.gc_stress,
        seed: args.seed,
        ..VmConfig::default()
    };
    let mut vm = Vm::with_config(std::io::stdout(), config);

    if let Some(path) = args.file {
        run_file(&mut vm, &path)
    } else {
        repl(&mut vm)
    }
}

fn repl<W: Write>(vm: &mut Vm<W>) -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, ">")?;
    stdout.flush()?;
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.is_empty() {
            break;
        }
        if let Err(e) = vm.run(&line) {
            error!("Error: {e}");
            eprintln!("{e}");
        }
        write!(stdout, ">")?;
        stdout.flush()?;
    }
    Ok(())
}

fn run_file<W: Write>(vm: &mut Vm<W>, path: &Path) -> Result<()> {
    let contents = match std::fs::read_to_string(path)
        .with_context(|| format!("Could not read file \"{}\"", path.display()))
    {
        Ok(contents) => contents,
        Err(e) => {
            eprintln!("{e:#}");
            exit(EXIT_IO_ERROR);
        }
    };
    match vm.run(&contents) {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("{e}");
            exit(match e {
                InterpretError::Compile(_) => EXIT_COMPILE_ERROR,
                InterpretError::Runtime(_) => EXIT_RUNTIME_ERROR,
            })
        }
    }
}

fn init_logger(verbose: bool) {
    let mut builder = Builder::from_default_env();
    if verbose || cfg!(debug_assertions) {
        builder.filter_level(LevelFilter::Trace);
    }
    builder.init()
}
