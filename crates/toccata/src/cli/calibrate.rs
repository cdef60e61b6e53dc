use crate::config::Config;
use anyhow::{Context, Result};
use clap::Args;
use std::{fs, path::PathBuf};
use toccata_motion::calibration;
use toccata_motion::Geometry;

#[derive(Args)]
pub struct CalibrateArgs {
    /// Machine configuration file; must describe a delta.
    #[arg(long, short)]
    pub config: PathBuf,

    /// Probe results: one `X Y Z` triple per line, Z being the height
    /// error measured at (X, Y).
    pub probe_points: PathBuf,

    /// Number of calibration passes to run.
    #[arg(long, default_value_t = 1)]
    pub passes: u32,
}

impl CalibrateArgs {
    pub fn run(&self) -> Result<()> {
        let config = Config::from_file(&self.config)?;
        config.validate()?;
        let Geometry::Delta(mut params) = config.geometry()? else {
            anyhow::bail!("calibration needs geometry = \"delta\"");
        };

        let points = parse_probe_points(
            &fs::read_to_string(&self.probe_points)
                .with_context(|| format!("failed to read {}", self.probe_points.display()))?,
        )?;

        println!("before: {}", params.print_parameters(true));
        for pass in 1..=self.passes {
            let solution = calibration::compute_adjustment(&params, &points)?;
            calibration::apply_adjustment(&mut params, &solution);
            println!(
                "pass {pass}: {} factors, deviation {:.4} -> {:.4} (rms)",
                solution.num_factors, solution.initial_deviation, solution.expected_deviation
            );
        }
        println!("after: {}", params.print_parameters(true));
        Ok(())
    }
}

fn parse_probe_points(content: &str) -> Result<Vec<(f32, f32, f32)>> {
    let mut points = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        let fields: Vec<f32> = line
            .split_whitespace()
            .map(|field| field.parse::<f32>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("line {}: bad number in '{line}'", index + 1))?;
        if fields.len() != 3 {
            anyhow::bail!("line {}: expected X Y Z, got {} values", index + 1, fields.len());
        }
        points.push((fields[0], fields[1], fields[2]));
    }
    Ok(points)
}
