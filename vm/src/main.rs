use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Bytecode virtual machine", long_about = None)]
struct Cli {
    /// The program snapshot to execute
    snapshot: PathBuf,

    /// Worker threads (defaults to the hardware thread count)
    #[arg(long)]
    workers: Option<usize>,

    /// Wait for a debugger connection on this port before running
    #[arg(long)]
    debug_port: Option<u16>,

    /// Print the snapshot's functions instead of running
    #[arg(long)]
    print_snapshot: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut env = vm::setup();
    if let Some(workers) = cli.workers {
        env = env.with_worker_count(workers);
    }

    let bytes = match std::fs::read(&cli.snapshot) {
        Ok(bytes) => bytes,
        Err(error) => {
            eprintln!("error reading {}: {error}", cli.snapshot.display());
            return ExitCode::FAILURE;
        }
    };

    if cli.print_snapshot {
        return match print_snapshot(&bytes) {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("error: {error}");
                ExitCode::FAILURE
            }
        };
    }

    let result = match cli.debug_port {
        Some(port) => env.wait_for_debugger_connection(port, &bytes),
        None => env.run_snapshot(&bytes),
    };

    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(status) => ExitCode::from(status.clamp(0, 255) as u8),
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn print_snapshot(bytes: &[u8]) -> Result<(), vm::SnapshotError> {
    let builder = vm::snapshot::parse(bytes)?;
    println!(
        "snapshot: {} classes, {} functions, {} constants, {} statics",
        builder.classes.len(),
        builder.functions.len(),
        builder.constants.len(),
        builder.statics.len(),
    );
    for (index, function) in builder.functions.iter().enumerate() {
        println!("function #{index} (arity {}):", function.arity);
        print!("{}", bytecode::disassemble(&function.code));
    }
    Ok(())
}
