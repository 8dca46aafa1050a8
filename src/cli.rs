use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(author, version, about = "Reverse tunneling relay fabric", long_about = None)]
pub struct Cli {
    /// Configuration file path (defaults per role: gateway.json / agent.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log format (json, plain)
    #[arg(long, global = true, default_value = "plain")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the public-facing gateway
    Gateway(GatewayArgs),

    /// Run the private-side agent
    Agent(AgentArgs),

    /// Check health status of a running process
    Health(HealthArgs),

    /// Show version information
    Version,
}

#[derive(clap::Args)]
pub struct GatewayArgs {
    /// Override control-plane port
    #[arg(long)]
    pub web_port: Option<u16>,

    /// Override data-plane port
    #[arg(long)]
    pub data_plane_port: Option<u16>,

    /// Override bind IP
    #[arg(long)]
    pub bind_ip: Option<String>,
}

#[derive(clap::Args)]
pub struct AgentArgs {
    /// Override gateway host
    #[arg(long)]
    pub gateway_host: Option<String>,

    /// Override gateway data-plane port
    #[arg(long)]
    pub gateway_port: Option<u16>,

    /// Override gateway control-plane port
    #[arg(long)]
    pub gateway_web_port: Option<u16>,

    /// Override the local management API port
    #[arg(long)]
    pub local_api_port: Option<u16>,
}

#[derive(clap::Args)]
pub struct HealthArgs {
    /// Health check endpoint (HTTP)
    #[arg(long, default_value = "http://127.0.0.1:8080/health")]
    pub endpoint: String,

    /// Timeout in seconds
    #[arg(long, default_value = "5")]
    pub timeout: u64,
}
