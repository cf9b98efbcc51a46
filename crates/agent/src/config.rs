//! Agent configuration
//!
//! Layers, lowest precedence first: built-in defaults, an optional file,
//! `SPOUT_`-prefixed environment variables and command-line flags.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use spout_lib::runtime::{TransportConfig, TransportKind};
use spout_lib::sink::{SinkCatalog, SinkOptions};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line flags; every flag overrides the matching configuration key
#[derive(Debug, Default, Parser)]
#[command(name = "spout-agent", version, about)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON, by extension)
    #[arg(short, long, env = "SPOUT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds between polls
    #[arg(short, long)]
    pub interval: Option<u32>,

    /// Number of stats workers and pooled connections
    #[arg(short, long)]
    pub workers: Option<u32>,

    /// Sink receiving the samples
    #[arg(short, long)]
    pub sink: Option<String>,

    /// Container names never polled (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub ignore: Option<Vec<String>>,

    /// How to reach the runtime: socket, http or tls
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Runtime address for http and tls modes
    #[arg(long)]
    pub address: Option<String>,

    /// Runtime socket path for socket mode
    #[arg(long)]
    pub socket_path: Option<PathBuf>,

    /// Port of the health and self-metrics API
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Log output: json or pretty
    #[arg(long)]
    pub log_format: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SpoutConfig {
    /// Poll interval in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Worker pool and connection pool size
    #[serde(default = "default_workers")]
    pub workers: u64,

    /// Container names excluded from polling
    #[serde(default)]
    pub ignore: Vec<String>,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Runtime transport
    #[serde(default)]
    pub mode: TransportConfig,

    /// Selected sink
    #[serde(default = "default_sink")]
    pub sink: String,

    /// Options of every sink
    #[serde(default)]
    pub sinks: SinkOptions,
}

fn default_interval() -> u64 {
    5
}

fn default_workers() -> u64 {
    8
}

fn default_api_port() -> u16 {
    9100
}

fn default_sink() -> String {
    "stdout".to_string()
}

impl SpoutConfig {
    /// Load configuration from file, environment and flags
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SPOUT")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ignore")
                .try_parsing(true),
        );

        if let Some(interval) = cli.interval {
            builder = builder.set_override("interval_secs", i64::from(interval))?;
        }
        if let Some(workers) = cli.workers {
            builder = builder.set_override("workers", i64::from(workers))?;
        }
        if let Some(sink) = &cli.sink {
            builder = builder.set_override("sink", sink.as_str())?;
        }
        if let Some(ignore) = &cli.ignore {
            builder = builder.set_override("ignore", ignore.clone())?;
        }
        if let Some(mode) = &cli.mode {
            builder = builder.set_override("mode.kind", mode.as_str())?;
        }
        if let Some(address) = &cli.address {
            builder = builder.set_override("mode.address", address.as_str())?;
        }
        if let Some(socket_path) = &cli.socket_path {
            builder = builder
                .set_override("mode.socket_path", socket_path.to_string_lossy().into_owned())?;
        }
        if let Some(api_port) = cli.api_port {
            builder = builder.set_override("api_port", i64::from(api_port))?;
        }
        if let Some(log_format) = &cli.log_format {
            builder = builder.set_override("log_format", log_format.as_str())?;
        }

        let config: SpoutConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config.validate(&SinkCatalog::with_defaults())?;
        Ok(config)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self, catalog: &SinkCatalog) -> Result<()> {
        if self.interval_secs < 1 {
            bail!("interval_secs must be at least 1, got {}", self.interval_secs);
        }
        if self.workers < 1 {
            bail!("workers must be at least 1, got {}", self.workers);
        }
        if !catalog.contains(&self.sink) {
            bail!(
                "unknown sink `{}`, expected one of: {}",
                self.sink,
                catalog.names().join(", ")
            );
        }
        if self.mode.kind == TransportKind::Tls {
            for (key, path) in [("tls_cert", &self.mode.tls_cert), ("tls_key", &self.mode.tls_key)] {
                match path {
                    Some(path) if path.is_file() => {}
                    Some(path) => bail!("mode.{} `{}` is not a readable file", key, path.display()),
                    None => bail!("mode.{} is required in tls mode", key),
                }
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn worker_count(&self) -> usize {
        usize::try_from(self.workers).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = SpoutConfig::load(&Cli::default()).unwrap();
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.workers, 8);
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.sink, "stdout");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.mode.kind, TransportKind::Socket);
        assert_eq!(config.sinks.influxdb.database, "statspout");
        assert_eq!(config.sinks.mongodb.collection, "stats");
        assert!(config.ignore.is_empty());
    }

    #[test]
    fn test_file_and_flags() {
        let file = toml_file(
            r#"
interval_secs = 10
workers = 2
ignore = ["proxy"]
sink = "rest"

[mode]
kind = "http"
address = "10.0.0.2:2375"

[sinks.rest]
path = "latest"
"#,
        );
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            workers: Some(4),
            ..Cli::default()
        };

        let config = SpoutConfig::load(&cli).unwrap();
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert_eq!(config.worker_count(), 4);
        assert_eq!(config.ignore, vec!["proxy".to_string()]);
        assert_eq!(config.mode.kind, TransportKind::Http);
        assert_eq!(config.mode.address, "10.0.0.2:2375");
        assert_eq!(config.sinks.rest.path, "latest");
    }

    #[test]
    fn test_rejects_zero_interval() {
        let cli = Cli {
            interval: Some(0),
            ..Cli::default()
        };
        assert!(SpoutConfig::load(&cli).is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let cli = Cli {
            workers: Some(0),
            ..Cli::default()
        };
        assert!(SpoutConfig::load(&cli).is_err());
    }

    #[test]
    fn test_rejects_unknown_sink() {
        let cli = Cli {
            sink: Some("elasticsearch".to_string()),
            ..Cli::default()
        };
        let err = SpoutConfig::load(&cli).unwrap_err();
        assert!(err.to_string().contains("unknown sink"));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let cli = Cli {
            mode: Some("carrier-pigeon".to_string()),
            ..Cli::default()
        };
        assert!(SpoutConfig::load(&cli).is_err());
    }

    #[test]
    fn test_tls_requires_files() {
        let cli = Cli {
            mode: Some("tls".to_string()),
            ..Cli::default()
        };
        let err = SpoutConfig::load(&cli).unwrap_err();
        assert!(err.to_string().contains("tls_cert"));

        let cert = NamedTempFile::new().unwrap();
        let file = toml_file(&format!(
            "[mode]\nkind = \"tls\"\ntls_cert = {:?}\ntls_key = \"/nonexistent/key.pem\"\n",
            cert.path().display().to_string()
        ));
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        };
        let err = SpoutConfig::load(&cli).unwrap_err();
        assert!(err.to_string().contains("tls_key"));
    }

    #[test]
    fn test_cli_parses_ignore_list() {
        let cli = Cli::parse_from(["spout-agent", "--ignore", "a,b", "--sink", "prometheus"]);
        assert_eq!(cli.ignore, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(cli.sink.as_deref(), Some("prometheus"));
    }
}
