//! Interactive shell over the snapshot analyzer.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use pymem::{dispatch, Environment, Session};

#[derive(Parser)]
#[command(name = "pymem")]
#[command(about = "Post-mortem analyzer for CPython memory snapshots", long_about = None)]
struct Cli {
    /// Snapshot to analyze: a directory of mem.*.bin region files, or a
    /// single file of framed regions
    data_path: PathBuf,

    /// Worker threads for scans (0 = all hardware threads)
    #[arg(short, long, default_value = "0")]
    threads: usize,

    /// Run a single command and exit instead of starting the shell
    #[arg(short, long)]
    command: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env = Environment::open(&cli.data_path)
        .with_context(|| format!("Failed to open snapshot at {:?}", cli.data_path))?;
    let mut session = Session::new(env, cli.threads);
    session.prepare().context("Catalog bootstrap failed")?;

    if let Some(command) = cli.command {
        dispatch(&mut session, &command)?;
        return Ok(());
    }
    run_shell(&mut session)
}

fn run_shell(session: &mut Session) -> Result<()> {
    let prompt = format!("{}> ", session.env.data_path().display());
    let stdin = io::stdin();
    let mut line = String::new();

    while !session.should_exit {
        eprint!("{prompt}");
        io::stderr().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF (Ctrl+D)
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        // Per-command errors leave the session usable.
        if let Err(e) = dispatch(session, command) {
            eprintln!("Error: {e}");
        }
    }
    Ok(())
}
