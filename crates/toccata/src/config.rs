use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use toccata_motion::kinematics::{CoreMode, DeltaParameters};
use toccata_motion::{Geometry, AXES, DRIVES};

/// Machine configuration consumed by the simulated platform and the
/// calibration tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Geometry kind: cartesian, corexy, corexz, coreyz, or delta
    #[serde(default = "default_geometry")]
    pub geometry: String,

    #[serde(default = "default_steps_per_unit")]
    pub steps_per_unit: [f32; DRIVES],

    #[serde(default)]
    pub axis_minimum: [f32; AXES],

    #[serde(default = "default_axis_maximum")]
    pub axis_maximum: [f32; AXES],

    /// Per-drive speed ceiling, units/s
    #[serde(default = "default_max_feed_rate")]
    pub max_feed_rate: [f32; DRIVES],

    /// Per-drive acceleration, units/s²
    #[serde(default = "default_acceleration")]
    pub acceleration: [f32; DRIVES],

    /// Per-drive instantaneous speed change, units/s
    #[serde(default = "default_instant_dv")]
    pub instant_dv: [f32; DRIVES],

    /// Per-drive homing feed rate, units/s
    #[serde(default = "default_home_feed_rate")]
    pub home_feed_rate: [f32; DRIVES],

    /// Seconds of inactivity before drives drop to idle hold
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f32,

    /// Delta geometry parameters; required when geometry = "delta"
    pub delta: Option<DeltaConfig>,

    /// Axis skew compensation tangents
    #[serde(default)]
    pub skew: SkewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    pub diagonal: f32,
    pub radius: f32,
    pub homed_height: f32,
    #[serde(default = "default_print_radius")]
    pub print_radius: f32,
    #[serde(default)]
    pub endstop_corrections: [f32; AXES],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkewConfig {
    #[serde(default)]
    pub tan_xy: f32,
    #[serde(default)]
    pub tan_yz: f32,
    #[serde(default)]
    pub tan_xz: f32,
}

fn default_geometry() -> String {
    "cartesian".to_string()
}

fn default_steps_per_unit() -> [f32; DRIVES] {
    [80.0, 80.0, 400.0, 420.0]
}

fn default_axis_maximum() -> [f32; AXES] {
    [200.0, 200.0, 180.0]
}

fn default_max_feed_rate() -> [f32; DRIVES] {
    [100.0, 100.0, 3.0, 20.0]
}

fn default_acceleration() -> [f32; DRIVES] {
    [500.0, 500.0, 20.0, 250.0]
}

fn default_instant_dv() -> [f32; DRIVES] {
    [15.0, 15.0, 0.2, 2.0]
}

fn default_home_feed_rate() -> [f32; DRIVES] {
    [50.0, 50.0, 1.0, 0.0]
}

fn default_idle_timeout() -> f32 {
    30.0
}

fn default_print_radius() -> f32 {
    50.0
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("defaults are valid")
    }
}

impl Config {
    /// Load configuration from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let extension = path.extension().and_then(|s| s.to_str());
        match extension {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config as TOML")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse config as JSON")
    }

    pub fn validate(&self) -> Result<()> {
        match self.geometry.as_str() {
            "cartesian" | "corexy" | "corexz" | "coreyz" => {}
            "delta" => {
                let delta = self
                    .delta
                    .as_ref()
                    .context("geometry = \"delta\" needs a [delta] section")?;
                if delta.radius <= 0.0 || delta.diagonal <= delta.radius {
                    anyhow::bail!(
                        "delta geometry needs radius > 0 and diagonal > radius, got \
                         diagonal {} radius {}",
                        delta.diagonal,
                        delta.radius
                    );
                }
            }
            other => anyhow::bail!("unknown geometry '{other}'"),
        }
        for (drive, &spu) in self.steps_per_unit.iter().enumerate() {
            if spu <= 0.0 {
                anyhow::bail!("steps_per_unit[{drive}] must be positive, got {spu}");
            }
        }
        Ok(())
    }

    /// Build the kinematic geometry described by this configuration.
    pub fn geometry(&self) -> Result<Geometry> {
        Ok(match self.geometry.as_str() {
            "cartesian" => Geometry::Cartesian,
            "delta" => {
                let delta = self
                    .delta
                    .as_ref()
                    .context("geometry = \"delta\" needs a [delta] section")?;
                let mut params = DeltaParameters::new();
                params.set_diagonal(delta.diagonal);
                params.set_homed_height(delta.homed_height);
                params.set_print_radius(delta.print_radius);
                for (axis, &correction) in delta.endstop_corrections.iter().enumerate() {
                    params.set_endstop_adjustment(axis, correction);
                }
                params.set_radius(delta.radius);
                Geometry::Delta(params)
            }
            name => Geometry::Core(
                CoreMode::parse(name).with_context(|| format!("unknown geometry '{name}'"))?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let toml = r#"
geometry = "corexy"
steps_per_unit = [160.0, 160.0, 800.0, 420.0]
idle_timeout = 10.0

[skew]
tan_xy = 0.001
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.geometry, "corexy");
        assert_eq!(config.steps_per_unit[0], 160.0);
        assert_eq!(config.idle_timeout, 10.0);
        assert_eq!(config.skew.tan_xy, 0.001);
        config.validate().unwrap();
        assert!(matches!(config.geometry().unwrap(), Geometry::Core(_)));
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "geometry": "delta",
            "delta": {
                "diagonal": 300.0,
                "radius": 105.0,
                "homed_height": 240.0
            }
        }"#;
        let config = Config::from_json(json).unwrap();
        config.validate().unwrap();
        match config.geometry().unwrap() {
            Geometry::Delta(params) => {
                assert_eq!(params.diagonal(), 300.0);
                assert!(params.in_delta_mode());
            }
            _ => panic!("expected delta geometry"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.geometry, "cartesian");
        assert_eq!(config.steps_per_unit, [80.0, 80.0, 400.0, 420.0]);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let config = Config::from_toml("geometry = \"delta\"").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_toml("geometry = \"polar\"").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_toml("steps_per_unit = [0.0, 80.0, 400.0, 420.0]").unwrap();
        assert!(config.validate().is_err());
    }
}
