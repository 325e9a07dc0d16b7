use anyhow::Context;
use clap::Parser;
use lan_relay::config::Config;
use lan_relay::{logging, RelayServer};
use log::info;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Relay HTTP requests to private-network services through a single endpoint"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g. 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for outbound requests to targets")]
    timeout: Option<u64>,

    #[clap(long, value_name = "FILE", help = "Append request log records to this JSON-lines file")]
    request_log: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file and exit")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = args.generate_config {
        Config::default()
            .to_file(&path)
            .with_context(|| format!("Failed to write {}", path))?;
        println!("Sample configuration file generated: {}", path);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            anyhow::bail!("Configuration file not found: {}", config_file);
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    config.apply_env()?;

    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.parse()?;
    }
    if let Some(format) = &args.log_format {
        config.logging.format = format.parse()?;
    }
    if let Some(timeout) = args.timeout {
        config.upstream_timeout_secs = timeout;
    }
    if let Some(path) = args.request_log {
        config.request_log_file = Some(path);
    }

    logging::init(&config.logging)?;

    info!("Starting relay server...");
    let server = RelayServer::bind(&config).await?;
    let addr = server.local_addr();
    info!("Dashboard API: http://{}/api", addr);
    info!("Proxy endpoint: http://{}/proxy/HOST:PORT/path", addr);

    let server_handle = tokio::spawn(server.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = server_handle => {
            result.context("Server task panicked")??;
        }
    }

    info!("Relay server stopped");
    Ok(())
}
