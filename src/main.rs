// RANDPA Simulator - Entry point
// Principle: Watch finality happen before trusting it

use clap::Parser;
use randpa::cli::runner::{run_simulation, SimulationReport};
use randpa::cli::{Cli, Commands, KeySubcommand};
use randpa::types::keys::PrivateKey;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Remote signers block on HTTP, so the simulator stays off any async runtime
fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_filter = if cli.verbose {
        "debug"
    } else {
        &cli.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_filter)),
        )
        .init();

    match cli.command {
        Commands::Simulate(cmd) => {
            let report = run_simulation(&cmd).map_err(|e| {
                error!("Simulation failed: {}", e);
                anyhow::anyhow!("Simulation failed: {}", e)
            })?;
            print_report(&report, &cmd.format)?;
        }

        Commands::Key(cmd) => match cmd.subcommand {
            KeySubcommand::Generate { output, format } => {
                generate_key(output.as_ref(), &format)?;
            }
            KeySubcommand::Inspect { key } => {
                inspect_key(&key)?;
            }
        },
    }

    Ok(())
}

/// Print the per-node outcome of a simulation
fn print_report(report: &SimulationReport, format: &str) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(report)?),
        "text" => {
            println!("Simulated {} ms", report.elapsed_ms);
            println!("{:>5}  {:<9} {:>6} {:>6}  {}", "node", "role", "head", "lib", "randpa");
            for node in &report.nodes {
                let role = if node.producer { "producer" } else { "full" };
                let randpa = match node.frozen {
                    Some(true) => "frozen",
                    Some(false) => "active",
                    None => "off",
                };
                println!(
                    "{:>5}  {:<9} {:>6} {:>6}  {}",
                    node.index, role, node.head, node.lib, randpa
                );
            }
        }
        _ => return Err(anyhow::anyhow!("Unknown format: {}", format)),
    }
    Ok(())
}

/// Generate a new voter keypair
fn generate_key(output: Option<&std::path::PathBuf>, format: &str) -> anyhow::Result<()> {
    info!("Generating ed25519 voter key");

    let private_key = PrivateKey::generate();
    let public_hex = private_key.public_key().to_hex();
    let secret_hex = private_key.to_hex();
    let provider = format!("{}=KEY:{}", public_hex, secret_hex);

    let output_str = match format {
        "json" => serde_json::to_string_pretty(&serde_json::json!({
            "scheme": "ed25519",
            "secretKey": format!("0x{}", secret_hex),
            "publicKey": format!("0x{}", public_hex),
            "signatureProvider": provider,
        }))?,
        "provider" => provider,
        _ => return Err(anyhow::anyhow!("Unknown format: {}", format)),
    };

    if let Some(path) = output {
        std::fs::write(path, &output_str)?;
        info!("Key saved to: {}", path.display());
    } else {
        println!("{}", output_str);
    }

    Ok(())
}

/// Derive the public key of a private key
fn inspect_key(key: &str) -> anyhow::Result<()> {
    let private_key = PrivateKey::from_hex(key)?;
    println!("Public Key: 0x{}", private_key.public_key().to_hex());
    Ok(())
}
