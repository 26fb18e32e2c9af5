use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use directories::BaseDirs;
use portal_network_core::{CoordinatorConfig, FrameRules};

use crate::telemetry::logging::{LogConfig, LogLevel};

const MAX_FRAME_RADIUS: u32 = 32;

#[derive(Debug, Parser)]
#[command(
    name = "portal-network-server",
    author,
    version,
    about = "Authoritative portal network simulation and device gateway"
)]
pub struct Cli {
    /// Address the device listener binds to.
    #[arg(long, env = "PORTAL_LISTEN_ADDR", default_value = "127.0.0.1:25570")]
    pub listen_addr: String,

    /// Directory holding the registry and world state files.
    #[arg(long, env = "PORTAL_WORLD_DIR")]
    pub world_dir: Option<PathBuf>,

    /// Length of one simulation tick.
    #[arg(long, env = "PORTAL_TICK_MILLIS", default_value_t = 50)]
    pub tick_millis: u64,

    /// Ticks between automatic saves.
    #[arg(long, env = "PORTAL_SAVE_INTERVAL_TICKS", default_value_t = 6000)]
    pub save_interval_ticks: u64,

    /// How far from an anchor the frame scan reaches.
    #[arg(long, env = "PORTAL_FRAME_RADIUS", default_value_t = 8)]
    pub frame_radius: u32,

    /// Ticks an unstable link survives before it closes.
    #[arg(long, env = "PORTAL_UNSTABLE_GRACE_TICKS", default_value_t = 100)]
    pub unstable_grace_ticks: u32,

    /// Ticks between periodic frame revalidation; 0 disables it.
    #[arg(long, env = "PORTAL_REVALIDATE_INTERVAL_TICKS", default_value_t = 20)]
    pub revalidate_interval_ticks: u32,

    /// Radius of the fallback scan for keyboards without a binding.
    #[arg(long, env = "PORTAL_LEGACY_SCAN_RADIUS", default_value_t = 4)]
    pub legacy_scan_radius: u32,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "PORTAL_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    #[arg(long, env = "PORTAL_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Append logs to this file instead of stderr.
    #[arg(long, env = "PORTAL_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the simulation and accept device connections (default).
    Serve,
    /// Write a small two-endpoint demo world into the world directory.
    SeedDemo {
        /// Replace existing world files.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub world_dir: PathBuf,
    pub tick: Duration,
    pub save_interval_ticks: u64,
    pub coordinator: CoordinatorConfig,
    pub legacy_scan_radius: u32,
    pub metrics_addr: Option<SocketAddr>,
    pub log: LogConfig,
}

impl ServerConfig {
    /// Defaults suitable for tests: ephemeral port, given world directory.
    pub fn for_world(world_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            world_dir: world_dir.into(),
            tick: Duration::from_millis(50),
            save_interval_ticks: 6000,
            coordinator: CoordinatorConfig::default(),
            legacy_scan_radius: 4,
            metrics_addr: None,
            log: LogConfig::default(),
        }
    }
}

fn default_world_dir() -> anyhow::Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine a data directory; pass --world-dir")?;
    Ok(base.data_dir().join("portal-network").join("world"))
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let metrics_addr = cli
            .metrics_addr
            .as_deref()
            .map(|raw| {
                raw.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics address: {raw}"))
            })
            .transpose()?;
        if cli.tick_millis == 0 {
            bail!("tick length must be greater than zero");
        }
        if cli.save_interval_ticks == 0 {
            bail!("save interval must be greater than zero");
        }
        if !(1..=MAX_FRAME_RADIUS).contains(&cli.frame_radius) {
            bail!("frame radius must be between 1 and {MAX_FRAME_RADIUS}");
        }
        let world_dir = match cli.world_dir {
            Some(dir) => dir,
            None => default_world_dir()?,
        };

        Ok(ServerConfig {
            listen_addr,
            world_dir,
            tick: Duration::from_millis(cli.tick_millis),
            save_interval_ticks: cli.save_interval_ticks,
            coordinator: CoordinatorConfig {
                frame: FrameRules {
                    radius: cli.frame_radius,
                    ..FrameRules::default()
                },
                unstable_grace_ticks: cli.unstable_grace_ticks,
                revalidate_interval_ticks: cli.revalidate_interval_ticks,
            },
            legacy_scan_radius: cli.legacy_scan_radius,
            metrics_addr,
            log: LogConfig {
                level: cli.log_level,
                file: cli.log_file,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["portal-network-server", "--world-dir", "/tmp/portal-world"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("parse")
    }

    #[test_timeout::timeout]
    fn defaults_match_documented_values() {
        let cli = parse(&[]);
        assert_eq!(cli.command, None);
        let config = ServerConfig::try_from(cli).expect("config");
        assert_eq!(config.listen_addr.port(), 25570);
        assert_eq!(config.tick, Duration::from_millis(50));
        assert_eq!(config.save_interval_ticks, 6000);
        assert_eq!(config.coordinator.frame.radius, 8);
        assert_eq!(config.coordinator.unstable_grace_ticks, 100);
        assert_eq!(config.coordinator.revalidate_interval_ticks, 20);
        assert_eq!(config.legacy_scan_radius, 4);
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.metrics_addr.is_none());
    }

    #[test_timeout::timeout]
    fn rejects_invalid_values() {
        assert!(ServerConfig::try_from(parse(&["--listen-addr", "nope"])).is_err());
        assert!(ServerConfig::try_from(parse(&["--tick-millis", "0"])).is_err());
        assert!(ServerConfig::try_from(parse(&["--frame-radius", "0"])).is_err());
        assert!(ServerConfig::try_from(parse(&["--metrics-addr", "x:y"])).is_err());
    }

    #[test_timeout::timeout]
    fn parses_seed_subcommand() {
        let cli = parse(&["--log-level", "debug", "seed-demo", "--force"]);
        assert_eq!(cli.command, Some(Command::SeedDemo { force: true }));
        assert_eq!(cli.log_level, LogLevel::Debug);
    }
}
