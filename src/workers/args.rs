//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file
//! - Merging CLI with file config (CLI takes precedence)

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Peerdrop - room-based P2P file transfer over a signaling relay.
#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// TCP address the relay listens on. Defaults to 127.0.0.1:8000.
    #[clap(long)]
    pub bind: Option<String>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    #[serde(default)]
    pub verbose: u8,

    /// Run as an endpoint joining this room instead of serving the relay.
    #[clap(long)]
    pub join: Option<String>,

    /// Relay base URL for endpoint mode, e.g. ws://127.0.0.1:8000.
    #[clap(long)]
    pub relay_url: Option<String>,

    /// Connection token for endpoint mode.
    #[clap(long)]
    pub token: Option<String>,

    /// Directory where received files are materialized.
    #[clap(long)]
    pub downloads: Option<PathBuf>,

    /// File to offer once the target peer appears in the room.
    #[clap(long)]
    pub send: Option<PathBuf>,

    /// Peer id the offered file is addressed to.
    #[clap(long)]
    pub to: Option<String>,

    /// Base URL of the transfer-history collaborator.
    #[clap(long)]
    pub history_url: Option<String>,

    /// Bearer token for the transfer-history collaborator.
    #[clap(long)]
    pub history_token: Option<String>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let cli_args = Args::parse();

        let default_path = PathBuf::from("config.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        toml::from_str::<Args>(&content).ok()
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.bind.is_some() {
            file.bind = cli.bind;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.join.is_some() {
            file.join = cli.join;
        }
        if cli.relay_url.is_some() {
            file.relay_url = cli.relay_url;
        }
        if cli.token.is_some() {
            file.token = cli.token;
        }
        if cli.downloads.is_some() {
            file.downloads = cli.downloads;
        }
        if cli.send.is_some() {
            file.send = cli.send;
        }
        if cli.to.is_some() {
            file.to = cli.to;
        }
        if cli.history_url.is_some() {
            file.history_url = cli.history_url;
        }
        if cli.history_token.is_some() {
            file.history_token = cli.history_token;
        }
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_values() {
        let file: Args = toml::from_str("bind = \"0.0.0.0:9000\"\nverbose = 1\n").unwrap();
        let cli = Args::parse_from(["peerdrop", "--bind", "127.0.0.1:8100", "-vv"]);
        let merged = Args::merge(file, cli);
        assert_eq!(merged.bind.as_deref(), Some("127.0.0.1:8100"));
        assert_eq!(merged.verbose, 2);
    }

    #[test]
    fn file_values_survive_when_cli_is_silent() {
        let file: Args = toml::from_str("join = \"den\"\ntoken = \"1:alice\"\n").unwrap();
        let cli = Args::parse_from(["peerdrop"]);
        let merged = Args::merge(file, cli);
        assert_eq!(merged.join.as_deref(), Some("den"));
        assert_eq!(merged.token.as_deref(), Some("1:alice"));
    }
}
