use crate::{config::Config, sim};
use anyhow::{Context, Result};
use clap::Args;
use std::{fs, path::PathBuf};
use toccata_motion::platform::MoveRequest;
use toccata_motion::{MoveRing, DRIVES, STEP_CLOCK_RATE};

#[derive(Args)]
pub struct SimulateArgs {
    /// Path to the machine configuration file (TOML or JSON).
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Move stream: one move per line, whitespace-separated
    /// `X Y Z E F` values (positions in mm, feed rate in mm/min).
    pub moves: PathBuf,
}

impl SimulateArgs {
    pub fn run(&self) -> Result<()> {
        tracing_subscriber::fmt::init();

        let config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.validate()?;

        let moves = parse_moves(
            &fs::read_to_string(&self.moves)
                .with_context(|| format!("failed to read {}", self.moves.display()))?,
        )?;
        tracing::info!(
            "Simulating {} moves on {} geometry",
            moves.len(),
            config.geometry
        );

        let mut platform = sim::SimPlatform::new(config.clone());
        let mut ring = MoveRing::new(config.geometry()?, &platform);
        ring.set_idle_timeout(config.idle_timeout);
        let mut source = sim::VecMoveSource::new(moves);
        let mut replies = sim::CollectedReplies::default();

        let mut now = 0u32;
        let mut spins = 0u64;
        while !(source.is_empty() && ring.ring_empty()) {
            ring.spin(&mut platform, &mut source, &mut replies, now);
            match ring.armed_interrupt() {
                Some(deadline) => {
                    now = deadline;
                    platform.advance_clock(now);
                    ring.interrupt(&mut platform, now);
                }
                None => now = now.wrapping_add(STEP_CLOCK_RATE / 1000),
            }
            spins += 1;
            if spins > 500_000_000 {
                anyhow::bail!("simulation did not converge");
            }
        }

        for message in &replies.messages {
            println!("reply: {message}");
        }

        let live = ring.live_coordinates(&mut platform);
        println!(
            "final position: X{:.3} Y{:.3} Z{:.3} E{:.3}",
            live[0], live[1], live[2], live[3]
        );
        println!("step pulses: {}", platform.total_pulses);
        for drive in 0..DRIVES {
            println!(
                "  drive {drive}: {} steps -> {:.3} mm",
                platform.step_counts[drive],
                platform.positions()[drive]
            );
        }
        println!(
            "simulated time: {:.3} s",
            now as f32 / STEP_CLOCK_RATE as f32
        );

        let mut diagnostics = sim::CollectedReplies::default();
        ring.diagnostics(&mut diagnostics);
        for message in &diagnostics.messages {
            println!("{message}");
        }
        Ok(())
    }
}

/// Parse a move stream: `X Y Z E F` per line, `;`/`#` comments allowed.
fn parse_moves(content: &str) -> Result<Vec<MoveRequest>> {
    let mut moves = Vec::new();
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
        if fields.len() != DRIVES + 1 {
            anyhow::bail!(
                "line {}: expected {} values (X Y Z E F), got {}",
                index + 1,
                DRIVES + 1,
                fields.len()
            );
        }
        let mut values = [0.0f32; DRIVES + 1];
        values.copy_from_slice(&fields);
        moves.push(MoveRequest {
            values,
            endstops: 0,
            move_type: 0,
            file_position: Some(index as u64),
        });
    }
    Ok(moves)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_move_stream() {
        let moves = parse_moves("; header\n10 0 0 0 3000\n10 10 0 0.4 1800\n").unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].values[0], 10.0);
        assert_eq!(moves[1].values[4], 1800.0);
        assert_eq!(moves[1].file_position, Some(2));
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_moves("10 0 0\n").is_err());
        assert!(parse_moves("a b c d e\n").is_err());
    }
}
