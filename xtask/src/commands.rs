use anyhow::Result;
use clap::Subcommand;
use xshell::Shell;

pub mod build;
pub mod ci;
pub mod common;
pub mod fmt;
pub mod test;

#[derive(Subcommand)]
pub enum Command {
    /// Build all workspace crates
    Build(build::Build),
    /// Run CI checks (fmt, clippy, test). Runs all if no subcommand specified.
    Ci(ci::Ci),
    /// Apply rustfmt to all files
    Fmt(fmt::Fmt),
    /// Run tests
    Test(test::Test),
}

impl Command {
    pub fn run(self, sh: &Shell) -> Result<()> {
        match self {
            Command::Build(cmd) => cmd.run(sh),
            Command::Ci(cmd) => cmd.run(sh),
            Command::Fmt(cmd) => cmd.run(sh),
            Command::Test(cmd) => cmd.run(sh),
        }
    }
}
