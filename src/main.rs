use clap::error::ErrorKind;
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use lox::{InterpretError, RuntimeConfig, Vm};

// sysexits-style codes
const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_NOINPUT: u8 = 66;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Parser)]
#[command(name = "lox")]
#[command(about = "A bytecode interpreter for the Lox language", long_about = None)]
struct Cli {
    /// Lox source file to run; omit to start a REPL
    script: Option<PathBuf>,

    /// Run a collection cycle on every allocation
    #[arg(long)]
    gc_stress: bool,

    /// Log collection cycles to stderr
    #[arg(long)]
    log_gc: bool,

    /// Print collection statistics on exit
    #[arg(long)]
    gc_stats: bool,

    /// Trace each instruction as it executes
    #[arg(long)]
    trace: bool,

    /// Disassemble compiled code before running
    #[arg(long)]
    print_code: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config = RuntimeConfig {
        gc_stress: cli.gc_stress,
        log_gc: cli.log_gc,
        gc_stats: cli.gc_stats,
        trace: cli.trace,
        print_code: cli.print_code,
    };

    match cli.script {
        Some(path) => run_file(&path, config),
        None => run_prompt(config),
    }
}

fn run_file(path: &PathBuf, config: RuntimeConfig) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            eprintln!("error: could not find '{}'", path.display());
            return ExitCode::from(EX_NOINPUT);
        }
        Err(e) => {
            eprintln!("error: could not read '{}': {}", path.display(), e);
            return ExitCode::from(EX_IOERR);
        }
    };

    let print_stats = config.gc_stats;
    let mut vm = Vm::new(config);
    let result = vm.interpret(&source);

    if print_stats {
        let stats = vm.gc_stats();
        eprintln!(
            "[GC] collections: {}, total pause: {}us, max pause: {}us",
            stats.cycles, stats.total_pause_us, stats.max_pause_us
        );
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ InterpretError::Compile(_)) => {
            eprintln!("{}", e);
            ExitCode::from(EX_DATAERR)
        }
        Err(e @ InterpretError::Runtime(_)) => {
            eprintln!("{}", e);
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

/// The REPL: one statement or expression per line, against a persistent VM
/// so globals survive between lines. Errors are reported and the loop goes
/// on.
fn run_prompt(config: RuntimeConfig) -> ExitCode {
    let mut vm = Vm::new(config);
    let stdin = io::stdin();

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        if let Err(e) = vm.interpret(&line) {
            eprintln!("{}", e);
        }
    }

    ExitCode::SUCCESS
}
