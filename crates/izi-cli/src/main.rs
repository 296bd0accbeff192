//! `izi`: the command-line driver for the izi language. With no
//! arguments it opens a REPL over a single persistent `Vm`; given a
//! path it compiles and runs that file once.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;

use izi_vm::{RuntimeError, Vm, VmConfig};

#[derive(Parser)]
#[command(name = "izi")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bytecode interpreter for the izi language", long_about = None)]
struct Cli {
    /// Script to run. Omit to start the REPL.
    path: Option<PathBuf>,

    /// Print the compiled chunk's disassembly instead of running it.
    #[arg(long)]
    disassemble: bool,

    /// Log every dispatched instruction alongside a stack snapshot.
    #[arg(long)]
    trace: bool,
}

const EXIT_USAGE: i32 = 64;
const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;
const EXIT_IO_ERROR: i32 = 74;

fn main() {
    init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(_) => {
            eprintln!("Usage: izi [path]");
            process::exit(EXIT_USAGE);
        }
    };
    let config = VmConfig {
        trace_execution: cli.trace,
    };

    match cli.path {
        None => {
            if cli.disassemble {
                eprintln!("Usage: izi [path]");
                process::exit(EXIT_USAGE);
            }
            run_repl(config);
        }
        Some(path) if cli.disassemble => disassemble_file(&path),
        Some(path) => run_file(&path, config),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("izi_cli=info".parse().unwrap()),
        )
        .with_writer(io::stderr)
        .init();
}

fn run_repl(config: VmConfig) {
    let mut vm = Vm::new(config);
    let stdin = io::stdin();
    let mut lock = stdin.lock();

    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let mut line = String::new();
        match lock.read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) if line.len() > 1024 => {
                eprintln!("Error reading input: line too long (max 1024 bytes).");
                process::exit(EXIT_IO_ERROR);
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                process::exit(EXIT_IO_ERROR);
            }
        }

        match izi_compiler::compile(&line) {
            Ok(function) => {
                if let Err(e) = vm.interpret(function) {
                    report_runtime_error(&e);
                }
            }
            Err(e) => eprintln!("{}", e),
        }
    }
}

fn run_file(path: &Path, config: VmConfig) {
    let source = read_source(path);

    let function = match izi_compiler::compile(&source) {
        Ok(function) => function,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(EXIT_COMPILE_ERROR);
        }
    };

    let mut vm = Vm::new(config);
    if let Some(dir) = path.parent() {
        vm.set_module_dir(dir.to_path_buf());
    }

    if let Err(e) = vm.interpret(function) {
        report_runtime_error(&e);
        process::exit(EXIT_RUNTIME_ERROR);
    }
}

fn disassemble_file(path: &Path) {
    let source = read_source(path);

    let function = match izi_compiler::compile(&source) {
        Ok(function) => function,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(EXIT_COMPILE_ERROR);
        }
    };

    print_disassembly(&function);
}

fn print_disassembly(function: &izi_core::Function) {
    let name = if function.is_script() {
        "<script>"
    } else {
        function.name.as_ref()
    };
    print!("{}", izi_compiler::disassemble_chunk(&function.chunk, name));

    for constant in &function.chunk.constants {
        if let izi_core::Value::Function(nested) = constant {
            print_disassembly(nested);
        }
    }
}

fn read_source(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Can't read file '{}': {}", path.display(), e);
        process::exit(EXIT_IO_ERROR);
    })
}

fn report_runtime_error(error: &RuntimeError) {
    eprint!("{}", error);
}
