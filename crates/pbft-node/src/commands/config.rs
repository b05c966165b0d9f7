//! Configuration display.

use anyhow::{Context, Result};
use pbft_config::{Paths, PbftConfig};
use std::path::Path;

/// Show the configuration after all sources are merged.
pub fn show(project: &str, format: &str) -> Result<()> {
    let project_path = Path::new(project);
    let config = PbftConfig::load_from_dir(project_path).context("Failed to load configuration")?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{json}");
        }
        "toml" => {
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{toml_str}");
        }
        _ => {
            println!("PBFT Configuration");
            println!("==================\n");

            println!("Cluster:");
            println!(
                "  Replicas: {} (tolerates {} faulty)",
                config.cluster.replicas.len(),
                config.max_faults()
            );
            for (i, replica) in config.cluster.replicas.iter().enumerate() {
                println!("    {i}: {replica}");
            }
            for client in &config.cluster.clients {
                println!("  Client: {client}");
            }
            println!();

            println!("Consensus:");
            println!("  Checkpoint interval: {}", config.consensus.checkpoint_interval);
            println!(
                "  View change min interval: {:?}",
                config.consensus.view_change_min_interval()
            );
            println!("  Max pending requests: {}", config.consensus.max_pending_requests);
            println!();

            println!("Network:");
            println!("  Loss rate: {}", config.network.loss_rate);
            println!("  Timeout: {:?}", config.network.timeout());
            println!();

            println!("Client:");
            println!("  Resend interval: {:?}", config.client.resend_interval());
            println!(
                "  Retries before view change: {}",
                config.client.retry_times_before_view_change
            );
            println!("  Max attempts: {}", config.client.max_attempts);
            println!();

            println!("Journal:");
            println!("  Directory: {}", config.journal.dir.display());
            println!();

            println!("Files:");
            println!(
                "  Project: {}",
                Paths::project_config_file(project_path).display()
            );
            println!(
                "  Local: {}",
                Paths::local_config_file(project_path).display()
            );
            if let Ok(user) = Paths::new().user_config_file() {
                println!("  User: {}", user.display());
            }
        }
    }

    Ok(())
}
