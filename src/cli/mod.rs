// CLI - Command Line Interface for the RANDPA simulator
// Principle: Simple, clear, composable commands

pub mod config;
pub mod runner;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// RANDPA simulator - BFT finality over a simulated DPoS network
#[derive(Parser, Debug)]
#[command(name = "randpa-sim")]
#[command(author = "RANDPA Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the RANDPA finality gadget over a simulated DPoS network")]
#[command(long_about = r#"
RANDPA finalizes blocks of a DPoS chain in two-block rounds of prevotes and
precommits, ahead of the chain's own irreversibility.

Three producers, fully connected:
  randpa-sim simulate --nodes 3 --slots 20

Star of ten producers with slow links:
  randpa-sim simulate --nodes 10 --topology star --delay-ms 100

Generate a voter key and its signature provider entry:
  randpa-sim key generate
"#)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", env = "RANDPA_LOG")]
    pub log_level: String,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation
    Simulate(SimulateCmd),

    /// Key management
    Key(KeyCmd),
}

/// Network shape of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Topology {
    /// Every node linked to every other
    Mesh,
    /// Every node linked to node 0 only
    Star,
    /// Node i linked to node i + 1
    Chain,
    /// Chain closed back to node 0
    Ring,
}

/// Run a simulation
#[derive(Parser, Debug)]
pub struct SimulateCmd {
    /// Number of block producers
    #[arg(short, long, default_value = "3")]
    pub nodes: usize,

    /// Number of additional non-producing nodes
    #[arg(long, default_value = "0")]
    pub full_nodes: usize,

    /// Link topology
    #[arg(long, value_enum, default_value = "mesh")]
    pub topology: Topology,

    /// Delay of every link in milliseconds
    #[arg(long, default_value = "20")]
    pub delay_ms: u64,

    /// Number of production slots to simulate
    #[arg(long, default_value = "20")]
    pub slots: u64,

    /// Slot duration in milliseconds
    #[arg(long, default_value = "500")]
    pub slot_ms: u64,

    /// DPoS confirmation depth (derived from the producer count if unset)
    #[arg(long)]
    pub conf_number: Option<u32>,

    /// Run the nodes without the finality gadget
    #[arg(long)]
    pub no_randpa: bool,

    /// RANDPA configuration file (JSON)
    #[arg(short, long, env = "RANDPA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    pub format: String,
}

/// Key management commands
#[derive(Parser, Debug)]
pub struct KeyCmd {
    #[command(subcommand)]
    pub subcommand: KeySubcommand,
}

#[derive(Subcommand, Debug)]
pub enum KeySubcommand {
    /// Generate a new ed25519 voter key
    Generate {
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format (json, provider)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Derive the public key of a private key
    Inspect {
        /// Private key in hex
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_simulate_defaults() {
        let cli = Cli::try_parse_from(["randpa-sim", "simulate"]).unwrap();
        match cli.command {
            Commands::Simulate(cmd) => {
                assert_eq!(cmd.nodes, 3);
                assert_eq!(cmd.topology, Topology::Mesh);
                assert_eq!(cmd.slots, 20);
                assert!(cmd.conf_number.is_none());
                assert!(!cmd.no_randpa);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_cli_parse_simulate_options() {
        let cli = Cli::try_parse_from([
            "randpa-sim",
            "simulate",
            "--nodes", "10",
            "--topology", "star",
            "--delay-ms", "100",
            "--conf-number", "4",
            "--no-randpa",
        ]).unwrap();
        match cli.command {
            Commands::Simulate(cmd) => {
                assert_eq!(cmd.nodes, 10);
                assert_eq!(cmd.topology, Topology::Star);
                assert_eq!(cmd.delay_ms, 100);
                assert_eq!(cmd.conf_number, Some(4));
                assert!(cmd.no_randpa);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_cli_parse_key_generate() {
        let cli = Cli::try_parse_from(["randpa-sim", "key", "generate", "--format", "provider"]).unwrap();
        match cli.command {
            Commands::Key(cmd) => match cmd.subcommand {
                KeySubcommand::Generate { format, output } => {
                    assert_eq!(format, "provider");
                    assert!(output.is_none());
                }
                _ => panic!("Expected Generate subcommand"),
            },
            _ => panic!("Expected Key command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_topology() {
        assert!(Cli::try_parse_from(["randpa-sim", "simulate", "--topology", "torus"]).is_err());
    }

    #[test]
    fn test_global_verbose_flag() {
        let cli = Cli::try_parse_from(["randpa-sim", "simulate", "-v"]).unwrap();
        assert!(cli.verbose);
    }
}
