use anyhow::Result;
use clap::Args;
use xshell::{cmd, Shell};

#[derive(Args)]
pub struct Test {
    #[arg(long, default_value = "dev")]
    profile: String,
}

impl Test {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        let cargo = cmd!(sh, "cargo test --workspace")
            .arg("--profile")
            .arg(&self.profile);
        cargo.run()?;

        Ok(())
    }
}
