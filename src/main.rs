//! Anvil CLI
//!
//! A command-line driver for the anvil stack-machine JIT engine.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anvil::{parse_flat, parse_program, Jit, Program, Vm};

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version)]
#[command(about = "JIT engine for a stack-based arithmetic instruction set", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file: native code when possible, VM otherwise
    Run {
        /// Input source file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Treat the input as the flat grammar (one instruction per line)
        #[arg(long)]
        flat: bool,

        /// Execution backend: auto, vm, or jit
        #[arg(long, default_value = "auto")]
        backend: String,

        /// Trace each interpreted instruction to stderr (implies the VM)
        #[arg(long)]
        trace: bool,
    },

    /// Parse and validate a source file without executing it
    Check {
        /// Input source file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Treat the input as the flat grammar
        #[arg(long)]
        flat: bool,
    },

    /// Format a source file
    Fmt {
        /// Input source file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Treat the input as the flat grammar
        #[arg(long)]
        flat: bool,

        /// Write formatted output back to the file
        #[arg(long)]
        write: bool,

        /// Check if the file is formatted (exit with error if not)
        #[arg(long)]
        check: bool,
    },

    /// Emit native machine code for a program's Main function
    Emit {
        /// Input source file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Treat the input as the flat grammar
        #[arg(long)]
        flat: bool,

        /// Write raw code bytes to this file instead of hex to stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            flat,
            backend,
            trace,
        } => cmd_run(&file, flat, &backend, trace),
        Commands::Check { file, flat } => cmd_check(&file, flat),
        Commands::Fmt {
            file,
            flat,
            write,
            check,
        } => cmd_fmt(&file, flat, write, check),
        Commands::Emit { file, flat, output } => cmd_emit(&file, flat, output.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{} {}", "error:".red().bold(), message);
            ExitCode::FAILURE
        }
    }
}

fn load_program(file: &Path, flat: bool) -> Result<Program, String> {
    let source = fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
    let parsed = if flat {
        parse_flat(&source)
    } else {
        parse_program(&source)
    };
    parsed.map_err(|e| e.to_string())
}

fn cmd_run(file: &Path, flat: bool, backend: &str, trace: bool) -> Result<(), String> {
    let program = load_program(file, flat)?;

    let result = match backend {
        // Tracing is an interpreter feature, so it forces the VM even in
        // auto mode.
        "auto" if !trace => {
            let jit = Jit::new();
            match jit.compile_program(&program).map_err(|e| e.to_string())? {
                Some(compiled) => compiled.invoke(),
                None => run_vm(&program, trace)?,
            }
        }
        "auto" | "vm" => run_vm(&program, trace)?,
        "jit" => {
            let jit = Jit::new();
            let compiled = jit
                .compile_program(&program)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| {
                    "native compilation is unavailable for this program on this host".to_string()
                })?;
            compiled.invoke()
        }
        other => {
            return Err(format!(
                "unknown backend '{}': expected auto, vm, or jit",
                other
            ))
        }
    };

    println!("{}", result);
    Ok(())
}

fn run_vm(program: &Program, trace: bool) -> Result<i64, String> {
    let mut vm = if trace { Vm::with_trace() } else { Vm::new() };
    vm.execute_program(program).map_err(|e| e.to_string())
}

fn cmd_check(file: &Path, flat: bool) -> Result<(), String> {
    let program = load_program(file, flat)?;
    let functions = program.len();
    println!(
        "{} {} ({} function{})",
        "ok:".green().bold(),
        file.display(),
        functions,
        if functions == 1 { "" } else { "s" }
    );
    Ok(())
}

fn cmd_fmt(file: &Path, flat: bool, write: bool, check: bool) -> Result<(), String> {
    let source = fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
    let formatted = if flat {
        let program = parse_flat(&source).map_err(|e| e.to_string())?;
        anvil::fmt::format_flat(&program)
            .ok_or_else(|| "program is not expressible in the flat grammar".to_string())?
    } else {
        let program = parse_program(&source).map_err(|e| e.to_string())?;
        anvil::fmt::format_program(&program)
    };

    if check {
        if source != formatted {
            return Err(format!("{} is not formatted", file.display()));
        }
        println!("{} {}", "ok:".green().bold(), file.display());
    } else if write {
        fs::write(file, &formatted)
            .map_err(|e| format!("cannot write {}: {}", file.display(), e))?;
        println!("{} {}", "formatted:".green().bold(), file.display());
    } else {
        print!("{}", formatted);
    }
    Ok(())
}

fn cmd_emit(file: &Path, flat: bool, output: Option<&Path>) -> Result<(), String> {
    let program = load_program(file, flat)?;
    let main = program
        .main()
        .ok_or_else(|| "program has no Main function".to_string())?;

    let jit = Jit::new();
    let code = jit.emit_code(&main.body).ok_or_else(|| {
        "native code generation is unavailable for this program on this host".to_string()
    })?;

    match output {
        Some(path) => {
            fs::write(path, &code)
                .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
            println!(
                "{} {} bytes of {} code -> {}",
                "emitted:".green().bold(),
                code.len(),
                std::env::consts::ARCH,
                path.display()
            );
        }
        None => {
            for (offset, chunk) in code.chunks(16).enumerate() {
                let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                println!("{:08x}  {}", offset * 16, bytes.join(" "));
            }
        }
    }
    Ok(())
}
