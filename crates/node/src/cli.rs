//! CLI definitions for the launcher.
//!
//! All flags have environment variable fallbacks; CLI flags take
//! precedence. The launcher runs the whole configured tree in one
//! process over the in-process transport.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Which application drives the signing tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum App {
    /// Plain collective signing: statements only, zero local roots.
    Sign,
    /// Timestamping: each node batches synthetic client digests into a
    /// local Merkle root and verifies the returned inclusion proof.
    Time,
}

/// cosi-node — tree-organized collective signing and timestamping.
#[derive(Debug, Parser)]
#[command(
    name = "cosi-node",
    version,
    about = "Tree-organized collective signing and timestamping",
    long_about = "Runs the signing tree described by the config file and drives\n\
                  the requested number of rounds from the root. With --app time,\n\
                  every node also timestamps a batch of synthetic client digests\n\
                  per round and checks its inclusion proof against the signed\n\
                  global root."
)]
pub struct Cli {
    /// Run only this host (reserved for networked deployments; the
    /// default in-process launcher runs every configured host).
    #[arg(long, env = "COSI_HOSTNAME")]
    pub hostname: Option<String>,

    /// Path to the TOML topology file.
    #[arg(long, env = "COSI_CONFIG", default_value = "cosi.toml")]
    pub config: PathBuf,

    /// Application to run on top of the tree.
    #[arg(long, value_enum, default_value_t = App::Sign)]
    pub app: App,

    /// Number of signing rounds to drive from the root.
    #[arg(long, default_value_t = 1)]
    pub rounds: u64,

    /// Per-message drop probability in percent, applied to every
    /// non-root node (failure injection).
    #[arg(long, default_value_t = 0)]
    pub failures: u8,

    /// Simulate the root crashing every Nth round (0 disables).
    #[arg(long, default_value_t = 0)]
    pub rfail: u64,

    /// Simulate followers ignoring every Nth round (0 disables).
    #[arg(long, default_value_t = 0)]
    pub ffail: u64,

    /// Crypto suite token; this build configures ed25519 only.
    #[arg(long, default_value = "ed25519")]
    pub suite: String,

    /// Verbose logging plus panic-on-failed-verification.
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["cosi-node"]);
        assert_eq!(cli.app, App::Sign);
        assert_eq!(cli.rounds, 1);
        assert_eq!(cli.failures, 0);
        assert_eq!(cli.suite, "ed25519");
        assert!(!cli.debug);
    }

    #[test]
    fn test_full_flag_set() {
        let cli = Cli::parse_from([
            "cosi-node",
            "--config",
            "tree.toml",
            "--app",
            "time",
            "--rounds",
            "5",
            "--failures",
            "15",
            "--rfail",
            "3",
            "--ffail",
            "4",
            "--debug",
        ]);
        assert_eq!(cli.app, App::Time);
        assert_eq!(cli.rounds, 5);
        assert_eq!(cli.failures, 15);
        assert_eq!(cli.rfail, 3);
        assert_eq!(cli.ffail, 4);
        assert!(cli.debug);
    }
}
