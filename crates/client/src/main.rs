use anyhow::Context;
use clap::{Parser, Subcommand};
use registrar::config::{Config, DEFAULT_CONFIG_PATH};
use registrar::identity::IdentityResolver;
use registrar::metadata::MetadataProbe;
use registrar::shutdown::DirectDeregistration;
use registrar::{shutdown_signal, Agent, RestClient, ShutdownGuard};
use registrar_common::{CloudMetadata, InstanceEnvelope};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the YAML configuration file
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the application registered until Ctrl+C or SIGTERM
    Run,
    /// Print the instance descriptor that would be registered
    Describe {
        /// Probe cloud metadata even if disabled in the configuration
        #[arg(long)]
        cloud: bool,
    },
    /// Print the values reported by the cloud metadata service
    Probe,
    /// Remove the instance from every configured registry and exit
    Deregister {
        /// Instance id to remove (default: the configured hostname)
        #[arg(long)]
        instance_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run => {
            Agent::new(config)?.run(shutdown_signal()).await?;
        }
        Commands::Describe { cloud } => {
            let metadata = if cloud {
                probe(&config).await?
            } else {
                Agent::new(config.clone())?.cloud_metadata().await?
            };
            let descriptor = IdentityResolver::new()
                .resolve_default(&config.registration, &metadata)
                .await;
            println!("{}", serde_json::to_string_pretty(&InstanceEnvelope { instance: &descriptor })?);
        }
        Commands::Probe => {
            let metadata = probe(&config).await?;
            if metadata.is_empty() {
                eprintln!("No cloud metadata available");
                std::process::exit(1);
            }
            for (key, value) in metadata.iter() {
                println!("{}: {}", key, value);
            }
        }
        Commands::Deregister { instance_id } => {
            for endpoint in &config.services {
                let transport = RestClient::for_endpoint(endpoint, config.agent.request_timeout())?;
                let direct = match &instance_id {
                    Some(id) => DirectDeregistration::with_instance_id(transport, endpoint, &config.registration, id),
                    None => DirectDeregistration::new(transport, endpoint, &config.registration),
                };
                let outcome = ShutdownGuard::new(Arc::new(direct))
                    .with_timeout(config.agent.shutdown_timeout())
                    .execute()
                    .await;
                println!("{}: {:?}", endpoint, outcome);
            }
        }
    }

    Ok(())
}

async fn probe(config: &Config) -> anyhow::Result<CloudMetadata> {
    let settings = &config.agent.cloud_metadata;
    let transport = RestClient::new(&settings.host, settings.port, config.agent.request_timeout())?;
    Ok(MetadataProbe::with_path(transport, &settings.path).load().await)
}
