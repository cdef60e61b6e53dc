use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;

use toccata::{config, sim};

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => args.run(),
        Command::Check(args) => args.run(),
        Command::Calibrate(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "toccata", about = "Motion-core tooling for Toccata")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a move stream through the motion core on a simulated platform.
    Simulate(cli::simulate::SimulateArgs),
    /// Check meta-command script files and print what they produce.
    Check(cli::check::CheckArgs),
    /// Run a delta calibration pass from probed bed heights.
    Calibrate(cli::calibrate::CalibrateArgs),
}
