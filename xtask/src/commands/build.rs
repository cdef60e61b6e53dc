use anyhow::Result;
use clap::Args;
use xshell::{cmd, Shell};

#[derive(Args)]
pub struct Build {
    #[arg(long, default_value = "dev")]
    profile: String,
}

impl Build {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        let cargo = cmd!(sh, "cargo build --workspace")
            .arg("--profile")
            .arg(&self.profile);
        cargo.run()?;

        Ok(())
    }
}
