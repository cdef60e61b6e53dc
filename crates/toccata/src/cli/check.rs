use anyhow::Result;
use clap::Args;
use std::{fs, path::PathBuf};
use toccata_script::{NullObjectModel, ScriptEvent, ScriptRunner};

#[derive(Args)]
pub struct CheckArgs {
    /// Script files to run.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Print the commands and echo output the scripts produce.
    #[arg(long, short)]
    pub verbose: bool,
}

impl CheckArgs {
    pub fn run(&self) -> Result<()> {
        let mut failed = 0usize;
        for path in &self.files {
            let display = path.display();
            let input = match fs::read_to_string(path) {
                Ok(content) => content,
                Err(err) => {
                    eprintln!("{display}: read error: {err}");
                    failed += 1;
                    continue;
                }
            };

            let mut runner = ScriptRunner::new();
            let mut events = Vec::new();
            match runner.run(&input, &NullObjectModel, &mut |event| events.push(event)) {
                Ok(()) => {
                    println!("OK {display}");
                    if self.verbose {
                        for event in &events {
                            match event {
                                ScriptEvent::Command(text) => println!("  > {text}"),
                                ScriptEvent::Echo(text) => println!("  echo: {text}"),
                                ScriptEvent::Abort(text) => println!("  abort: {text}"),
                            }
                        }
                    }
                }
                Err(err) => {
                    println!("ERR {display}: {err}");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            std::process::exit(1);
        }
        Ok(())
    }
}
