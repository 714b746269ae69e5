// src/config.rs
//
// Runtime configuration: a clap CLI (the listening port is the sole
// required argument) optionally layered over a JSON config file. All
// limits are fixed at process start.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{EmberError, EmberResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    pub host: String,
    /// Document root all request targets resolve under.
    pub doc_root: PathBuf,
    /// Connection table capacity; the admission bound.
    pub max_connections: usize,
    /// Worker thread count; 0 means one per CPU.
    pub workers: usize,
    pub read_buf_size: usize,
    pub write_buf_size: usize,
    /// Idle eviction timeout in seconds; 0 disables the sweep.
    pub idle_timeout_secs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            host: "0.0.0.0".to_string(),
            doc_root: PathBuf::from("."),
            max_connections: 1024,
            workers: 0,
            read_buf_size: 2048,
            write_buf_size: 1024,
            idle_timeout_secs: 0,
        }
    }
}

impl Config {
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn validate(&self) -> EmberResult<()> {
        if self.max_connections == 0 {
            return Err(EmberError::Other("max_connections must be at least 1".into()));
        }
        if self.read_buf_size < 256 {
            return Err(EmberError::Other("read_buf_size must be at least 256".into()));
        }
        // The write buffer must hold a full header block plus the largest
        // inline error body.
        if self.write_buf_size < 512 {
            return Err(EmberError::Other("write_buf_size must be at least 512".into()));
        }
        Ok(())
    }
}

/// Command-line interface. Explicit flags override config-file values.
#[derive(Debug, Parser)]
#[command(name = "ember", about = "Reactor-style static HTTP/1.1 file server")]
pub struct Cli {
    /// Port to listen on.
    pub port: u16,

    /// Address to bind.
    #[arg(long)]
    pub host: Option<String>,

    /// Document root to serve files from.
    #[arg(long, env = "EMBER_ROOT")]
    pub root: Option<PathBuf>,

    /// Maximum concurrent connections (table capacity).
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Worker thread count (defaults to one per CPU).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Per-connection read buffer size in bytes.
    #[arg(long)]
    pub read_buf: Option<usize>,

    /// Per-connection write buffer size in bytes.
    #[arg(long)]
    pub write_buf: Option<usize>,

    /// Evict connections idle longer than this many seconds (0 = never).
    #[arg(long)]
    pub idle_timeout: Option<u32>,

    /// JSON config file supplying defaults for the flags above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> EmberResult<Self> {
        let mut config = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str::<Config>(&text)
                    .map_err(|e| EmberError::Other(format!("bad config file: {}", e)))?
            }
            None => Config::default(),
        };

        config.port = cli.port;
        if let Some(host) = cli.host {
            config.host = host;
        }
        if let Some(root) = cli.root {
            config.doc_root = root;
        }
        if let Some(n) = cli.max_connections {
            config.max_connections = n;
        }
        if let Some(n) = cli.workers {
            config.workers = n;
        }
        if let Some(n) = cli.read_buf {
            config.read_buf_size = n;
        }
        if let Some(n) = cli.write_buf {
            config.write_buf_size = n;
        }
        if let Some(n) = cli.idle_timeout {
            config.idle_timeout_secs = n;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("ember").chain(args.iter().copied()))
    }

    #[test]
    fn port_is_the_only_required_argument() {
        let config = Config::from_cli(cli(&["8080"])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 1024);
    }

    #[test]
    fn missing_port_is_a_usage_error() {
        assert!(Cli::try_parse_from(["ember"]).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::from_cli(cli(&[
            "9000",
            "--root",
            "/srv/www",
            "--max-connections",
            "64",
            "--workers",
            "2",
        ]))
        .unwrap();
        assert_eq!(config.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.worker_count(), 2);
    }

    #[test]
    fn config_file_supplies_defaults_and_flags_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ember.json");
        std::fs::write(
            &path,
            r#"{"host": "127.0.0.1", "max_connections": 16, "read_buf_size": 4096}"#,
        )
        .unwrap();

        let config = Config::from_cli(cli(&[
            "8080",
            "--config",
            path.to_str().unwrap(),
            "--max-connections",
            "32",
        ]))
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.read_buf_size, 4096);
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn tiny_buffers_are_rejected() {
        assert!(Config::from_cli(cli(&["8080", "--write-buf", "64"])).is_err());
        assert!(Config::from_cli(cli(&["8080", "--read-buf", "16"])).is_err());
    }
}
