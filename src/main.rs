use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use botgate::commands::CommandRegistry;
use botgate::config::Config;
use botgate::gateway::{run_gateway, AcknowledgeWebhook};
use botgate::security::{sign_payload, SIGNATURE_PREFIX};

/// Bot ingress gateway: signed webhooks and rate-limited commands.
#[derive(Parser, Debug)]
#[command(name = "botgate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        /// Config file (defaults to the platform config dir)
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Override gateway.host
        #[arg(long)]
        host: Option<String>,
        /// Override gateway.port
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Print the webhook signature for a payload
    Sign {
        #[arg(long, env = "BOTGATE_WEBHOOK_SECRET", hide_env_values = true)]
        secret: String,
        /// Payload file; stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
        /// Print the bare hex digest without the `sha256=` prefix
        #[arg(long)]
        raw: bool,
    },
    /// Print the JSON schema of the config file
    ConfigSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, host, port } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            botgate::logging::init(&config.logging)?;
            run_gateway(
                config,
                CommandRegistry::with_builtins(),
                Arc::new(AcknowledgeWebhook),
            )
            .await
        }
        Command::Sign { secret, file, raw } => {
            let payload = match file {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin()
                        .read_to_end(&mut buf)
                        .context("Failed to read payload from stdin")?;
                    buf
                }
            };
            let digest = sign_payload(&payload, &secret);
            if raw {
                println!("{digest}");
            } else {
                println!("{SIGNATURE_PREFIX}{digest}");
            }
            Ok(())
        }
        Command::ConfigSchema => {
            let schema = schemars::schema_for!(Config);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}
