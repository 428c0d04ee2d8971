use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Check(args) => args.run(),
        Command::Replay(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "ostinato", about = "Step schedule compression tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress a schedule and verify the emitted command stream
    /// reproduces it within tolerance.
    Check(cli::check::CheckArgs),
    /// Compress a schedule and dump the decoded command stream as JSON.
    Replay(cli::replay::ReplayArgs),
}
