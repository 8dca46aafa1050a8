//! burrow - reverse tunneling relay fabric
//!
//! A public-facing gateway rents out public ports and forwards their
//! traffic over a persistent data plane to an agent inside a private
//! network, which re-emits it toward local services. One public port is
//! shared by many concurrent end-user flows, TCP and UDP mixed.

pub mod agent;
pub mod cli;
pub mod config;
pub mod fabric;
pub mod gateway;
pub mod health;
pub mod stats;

pub use config::{
    load_agent_config, load_gateway_config, save_agent_config, save_gateway_config, AgentConfig,
    GatewayConfig, PortMapping, Protocol,
};
pub use health::{HealthCheckResult, HealthMonitor, HealthStatus};
