use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow::agent::AgentContainer;
use burrow::cli::{AgentArgs, Cli, Command, GatewayArgs, HealthArgs};
use burrow::gateway::GatewayContainer;
use burrow::{config, HealthCheckResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    match cli.command {
        Command::Gateway(args) => run_gateway(cli.config, args).await,
        Command::Agent(args) => run_agent(cli.config, args).await,
        Command::Health(args) => check_health(args).await,
        Command::Version => print_version(),
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = cli.log_level.as_str();
    let format = cli.log_format.as_str();

    let subscriber = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(level));

    match format {
        "json" => {
            subscriber
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            subscriber.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, args: GatewayArgs) -> anyhow::Result<()> {
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("gateway.json"));
    let mut config = config::load_gateway_config(&config_path)?;

    // Apply CLI overrides
    if let Some(port) = args.web_port {
        config.server.web_port = port;
    }
    if let Some(port) = args.data_plane_port {
        config.server.data_plane_port = port;
    }
    if let Some(ip) = args.bind_ip {
        config.server.bind_ip = ip;
    }
    config::validate_gateway_config(&config)?;

    tracing::info!("Starting burrow gateway");
    let gateway = Arc::new(GatewayContainer::new(config, config_path)?);
    gateway.start().await?;

    let gateway_run = gateway.clone();
    let mut run_handle = tokio::spawn(async move { gateway_run.run().await });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("Initiating graceful shutdown...");
            gateway.stop().await;

            match tokio::time::timeout(std::time::Duration::from_secs(10), &mut run_handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::error!("Gateway run loop error: {}", e),
                Ok(Err(e)) => tracing::error!("Run task panicked: {}", e),
                Err(_) => tracing::warn!("Shutdown timed out after 10 seconds"),
            }
        }
        result = &mut run_handle => {
            // The accept loop only returns on its own for fatal errors.
            gateway.stop().await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => anyhow::bail!("Gateway failed: {}", e),
                Err(e) => anyhow::bail!("Run task panicked: {}", e),
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_agent(config_path: Option<PathBuf>, args: AgentArgs) -> anyhow::Result<()> {
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("agent.json"));
    let mut config = config::load_agent_config(&config_path)?;

    // Apply CLI overrides
    if let Some(host) = args.gateway_host {
        config.server.host = host;
    }
    if let Some(port) = args.gateway_port {
        config.server.port = port;
    }
    if let Some(port) = args.gateway_web_port {
        config.server.web_port = port;
    }
    if let Some(port) = args.local_api_port {
        config.server.local_api_port = port;
    }
    config::validate_agent_config(&config)?;

    tracing::info!("Starting burrow agent");
    let agent = Arc::new(AgentContainer::new(config, config_path)?);
    agent.start().await?;

    let agent_run = agent.clone();
    let run_handle = tokio::spawn(async move { agent_run.run().await });

    wait_for_shutdown_signal().await;

    tracing::info!("Initiating graceful shutdown...");
    agent.stop().await;

    match tokio::time::timeout(std::time::Duration::from_secs(10), run_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                tracing::error!("Run task panicked: {}", e);
            }
        }
        Err(_) => {
            tracing::warn!("Shutdown timed out after 10 seconds");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn print_version() -> anyhow::Result<()> {
    println!("burrow {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C (SIGINT)");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

async fn check_health(args: HealthArgs) -> anyhow::Result<()> {
    use std::time::Duration;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()?;

    match client.get(&args.endpoint).send().await {
        Ok(response) => {
            if response.status().is_success() {
                match response.json::<HealthCheckResult>().await {
                    Ok(health) => {
                        if health.status.is_ready() {
                            println!("Health check passed: {}", health.message);
                            std::process::exit(0);
                        } else {
                            eprintln!("Health check failed: {}", health.message);
                            std::process::exit(1);
                        }
                    }
                    Err(e) => {
                        eprintln!("Health check failed: invalid response: {}", e);
                        std::process::exit(1);
                    }
                }
            } else {
                eprintln!("Health check failed: HTTP {}", response.status());
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}
