use std::path::Path;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use keel::{
    Service,
    adapters::{FileConfigSource, tls::install_crypto_provider},
    config::{ServiceConfigValidator, loader::load_config},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the service (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve_command(&config).await,
        None => serve_command(&args.config).await,
    }
}

async fn serve_command(config_path: &str) -> Result<()> {
    install_crypto_provider();

    let service = Service::load(&FileConfigSource::new(config_path))
        .await
        .wrap_err_with(|| format!("Failed to build service from {config_path}"))?;
    let errors = service.run().await.wrap_err("Service failed to start")?;
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("shutdown error: {e}");
        }
        std::process::exit(1);
    }
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let loaded = match load_config(config_path).await {
        Ok(loaded) => {
            println!("✅ Configuration parsing: OK");
            loaded
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    let config = &loaded.config;
    match ServiceConfigValidator::validate(config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Service: {} {}", config.name, config.version);
            println!(
                "   • Listen Address: {}:{}",
                config.server.http.host, config.server.http.port
            );
            println!("   • TLS Enabled: {}", config.server.tls.enabled);
            println!("   • Middleware Chain: {}", config.middlewares.enabled);
            println!("   • Peer Services: {}", config.clients.services.len());
            println!("   • Actions: {}", config.actions.enabled);
            println!("   • Cron: {}", config.cron.enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure peer service URLs start with http:// or https://");
            println!("   • Give every enabled middleware a distinct weight");
            println!("   • Use IANA names for cron.timezone (e.g. 'Europe/Berlin')");
            println!("   • Durations accept units such as 500ms, 30s or 5m");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'keel serve --config {config_path}' to start the service");
    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# keel service configuration
name: my-service
version: 0.1.0

server:
  http:
    host: 0.0.0.0
    port: 8080
    shutdown_timeout: 5s

logger:
  level: info
  format: json

health:
  enabled: true

metrics:
  enabled: true
  path: /metrics
  system: true
  system_interval: 5s

docs:
  enabled: true
  path: /docs

middlewares:
  enabled: true
  recovery:
    enabled: true
  logging:
    enabled: true
  rate_limit:
    enabled: true
    params:
      requests_per_minute: 600
  body_limit:
    enabled: true
    params:
      max_body_size: 1048576
  compression:
    enabled: true
  cors:
    enabled: false

# Peer services called through circuit-breaker guarded clients
# clients:
#   enabled: true
#   services:
#     users:
#       url: http://localhost:9000
#       timeout: 5s
#       retries: 2
#       events: [user.created]

# Scheduled jobs registered from code
# cron:
#   enabled: true
#   timezone: UTC
"#;
