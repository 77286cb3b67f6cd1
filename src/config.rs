use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::geometry::GeometryConfig;
use crate::handler::HandlerSettings;
use crate::position::Position;
use crate::scenario::GridDemo;
use crate::solver::DEFAULT_MAX_THREADS;

#[derive(Parser, Debug)]
#[command(
    name = "swarm_rust",
    about = "Collision-free drone swarm coordination built on conflict-based search.",
    version = "0.1"
)]
pub struct Cli {
    #[arg(
        long,
        help = "Address of the drone controller endpoint",
        default_value = "127.0.0.1:12345"
    )]
    pub drone_endpoint: String,

    #[arg(
        long,
        help = "Bind address of the interaction endpoint",
        default_value = "0.0.0.0:12346"
    )]
    pub interaction_bind: String,

    #[arg(
        long,
        help = "Requested state notification interval in ms",
        default_value_t = 15
    )]
    pub notify_interval_ms: u16,

    #[arg(long, help = "Tick period of the operation handler in ms", default_value_t = 15)]
    pub tick_ms: u64,

    #[arg(long, help = "Minimum flight altitude", default_value_t = 1.0)]
    pub min_altitude: f64,

    #[arg(
        long,
        help = "Vertical extent of the flight volume above the minimum altitude",
        default_value_t = 0.7
    )]
    pub volume_height: f64,

    #[arg(
        long,
        help = "Lattice step sizes as x,y,z",
        value_delimiter = ',',
        default_values_t = [0.6, 0.6, 0.6]
    )]
    pub steps: Vec<f64>,

    #[arg(
        long,
        help = "Lattice edge weights as x,y,z",
        value_delimiter = ',',
        default_values_t = [0.2, 0.21, 0.4]
    )]
    pub weights: Vec<f64>,

    #[arg(
        long,
        help = "Parallel width of the CBS expansion",
        default_value_t = DEFAULT_MAX_THREADS
    )]
    pub max_threads: usize,

    #[arg(long, help = "Proximity fast-stop threshold", default_value_t = 0.2)]
    pub proximity_alert: f64,

    #[arg(long, help = "Per-step target distance tolerance", default_value_t = 0.1)]
    pub target_tolerance: f64,

    #[arg(long, help = "Hover debounce in ms", default_value_t = 200)]
    pub hover_debounce_ms: u64,

    #[arg(long, help = "Append every computed plan to this file as a JSON line")]
    pub plan_dump: Option<String>,

    #[arg(long, help = "YAML file whose fields override the flags above")]
    pub config: Option<String>,

    #[arg(
        long,
        help = "Run the random grid evaluation instead of connecting to endpoints",
        default_value_t = false
    )]
    pub grid_demo: bool,

    #[arg(long, help = "Grid width for the demo", default_value_t = 4)]
    pub grid_width: u32,

    #[arg(long, help = "Grid height for the demo", default_value_t = 4)]
    pub grid_height: u32,

    #[arg(long, help = "Number of agents for the demo", default_value_t = 10)]
    pub grid_agents: usize,

    #[arg(long, help = "Number of random tasks to solve in the demo", default_value_t = 20)]
    pub grid_cycles: usize,

    #[arg(long, help = "Seed for the grid demo random generator")]
    pub seed: Option<u64>,

    #[arg(long, help = "Append the demo solve-time distribution to this file")]
    pub output_path: Option<String>,
}

/// Optional YAML overrides; only the present fields replace CLI values.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverrides {
    drone_endpoint: Option<String>,
    interaction_bind: Option<String>,
    notify_interval_ms: Option<u16>,
    tick_ms: Option<u64>,
    geometry: Option<GeometryConfig>,
    max_threads: Option<usize>,
    proximity_alert: Option<f64>,
    target_tolerance: Option<f64>,
    hover_debounce_ms: Option<u64>,
    plan_dump: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub drone_endpoint: String,
    pub interaction_bind: String,
    pub notify_interval_ms: u16,
    pub tick: Duration,
    pub geometry: GeometryConfig,
    pub max_threads: usize,
    pub proximity_alert: f64,
    pub target_tolerance: f64,
    pub hover_debounce: Duration,
    pub plan_dump: Option<String>,
    pub grid_demo: Option<GridDemo>,
}

impl Config {
    pub fn new(cli: &Cli) -> Result<Self> {
        let axis = |values: &[f64], what: &str| -> Result<Position> {
            if values.len() != 3 {
                bail!("{what} must have exactly three components, got {}", values.len());
            }
            Ok(Position::new(values[0], values[1], values[2], 0.0))
        };

        let mut config = Config {
            drone_endpoint: cli.drone_endpoint.clone(),
            interaction_bind: cli.interaction_bind.clone(),
            notify_interval_ms: cli.notify_interval_ms,
            tick: Duration::from_millis(cli.tick_ms),
            geometry: GeometryConfig {
                min_altitude: cli.min_altitude,
                height: cli.volume_height,
                step_sizes: axis(&cli.steps, "--steps")?,
                edge_weights: axis(&cli.weights, "--weights")?,
            },
            max_threads: cli.max_threads,
            proximity_alert: cli.proximity_alert,
            target_tolerance: cli.target_tolerance,
            hover_debounce: Duration::from_millis(cli.hover_debounce_ms),
            plan_dump: cli.plan_dump.clone(),
            grid_demo: cli.grid_demo.then(|| GridDemo {
                width: cli.grid_width,
                height: cli.grid_height,
                agents: cli.grid_agents,
                cycles: cli.grid_cycles,
                max_threads: cli.max_threads,
                seed: cli.seed,
                output_path: cli.output_path.clone(),
            }),
        };

        if let Some(path) = &cli.config {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?;
            let overrides: ConfigOverrides = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing config file {path}"))?;
            config.apply(overrides);
        }

        Ok(config)
    }

    fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(value) = overrides.drone_endpoint {
            self.drone_endpoint = value;
        }
        if let Some(value) = overrides.interaction_bind {
            self.interaction_bind = value;
        }
        if let Some(value) = overrides.notify_interval_ms {
            self.notify_interval_ms = value;
        }
        if let Some(value) = overrides.tick_ms {
            self.tick = Duration::from_millis(value);
        }
        if let Some(value) = overrides.geometry {
            self.geometry = value;
        }
        if let Some(value) = overrides.max_threads {
            self.max_threads = value;
        }
        if let Some(value) = overrides.proximity_alert {
            self.proximity_alert = value;
        }
        if let Some(value) = overrides.target_tolerance {
            self.target_tolerance = value;
        }
        if let Some(value) = overrides.hover_debounce_ms {
            self.hover_debounce = Duration::from_millis(value);
        }
        if let Some(value) = overrides.plan_dump {
            self.plan_dump = Some(value);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let steps = self.geometry.step_sizes;
        if steps.x <= 0.0 || steps.y <= 0.0 || steps.z <= 0.0 {
            bail!("lattice step sizes must be positive, got {steps}");
        }
        let weights = self.geometry.edge_weights;
        if weights.x <= 0.0 || weights.y <= 0.0 || weights.z <= 0.0 {
            bail!("lattice edge weights must be positive, got {weights}");
        }
        if self.geometry.height < 0.0 {
            bail!("the flight volume height cannot be negative");
        }
        if self.max_threads == 0 {
            bail!("max_threads must be at least 1");
        }
        if self.notify_interval_ms == 0 {
            bail!("the notification interval must be at least 1 ms");
        }
        if self.tick.is_zero() {
            bail!("the tick period must be at least 1 ms");
        }
        if self.proximity_alert <= 0.0 || self.target_tolerance <= 0.0 {
            bail!("proximity and tolerance thresholds must be positive");
        }

        if let Some(demo) = &self.grid_demo {
            let nodes = (demo.width as usize) * (demo.height as usize);
            if demo.agents > nodes {
                bail!(
                    "the grid demo cannot place {} agents on a {}x{} grid",
                    demo.agents,
                    demo.width,
                    demo.height
                );
            }
        }
        Ok(())
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            proximity_alert: self.proximity_alert,
            target_tolerance: self.target_tolerance,
            hover_debounce: self.hover_debounce,
            max_threads: self.max_threads,
            plan_dump_path: self.plan_dump.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_cli() -> Cli {
        Cli::parse_from(["swarm_rust"])
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::new(&default_cli()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tick, Duration::from_millis(15));
        assert_eq!(config.geometry.step_sizes, Position::new(0.6, 0.6, 0.6, 0.0));
        assert!(config.grid_demo.is_none());
    }

    #[test]
    fn test_rejects_non_positive_steps() {
        let cli = Cli::parse_from(["swarm_rust", "--steps", "0.6,0.0,0.6"]);
        let config = Config::new(&cli).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_axis_list() {
        let cli = Cli::parse_from(["swarm_rust", "--steps", "0.6,0.6"]);
        assert!(Config::new(&cli).is_err());
    }

    #[test]
    fn test_rejects_zero_threads() {
        let cli = Cli::parse_from(["swarm_rust", "--max-threads", "0"]);
        let config = Config::new(&cli).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_grid_demo_capacity_check() {
        let cli = Cli::parse_from([
            "swarm_rust",
            "--grid-demo",
            "--grid-width",
            "2",
            "--grid-height",
            "2",
            "--grid-agents",
            "5",
        ]);
        let config = Config::new(&cli).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_overrides() {
        let dir = std::env::temp_dir().join("swarm_rust_config_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("override.yaml");
        std::fs::write(
            &path,
            "drone_endpoint: \"10.0.0.1:9000\"\nmax_threads: 8\nhover_debounce_ms: 50\n",
        )
        .unwrap();

        let mut cli = default_cli();
        cli.config = Some(path.to_string_lossy().into_owned());
        let config = Config::new(&cli).unwrap();

        assert_eq!(config.drone_endpoint, "10.0.0.1:9000");
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.hover_debounce, Duration::from_millis(50));
        // Untouched fields keep their CLI defaults.
        assert_eq!(config.interaction_bind, "0.0.0.0:12346");
    }
}
