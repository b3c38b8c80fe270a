//! HTTP load balancer with health checks and token-bucket rate limiting.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ rate limiter ──▶ forwarder ──▶ Backend
//!                         │               │               │
//!                         │               │               ▼
//!                    /clients        token refill    load balancer
//!                   /admin/...       (background)    (registry + strategy)
//!                                                         ▲
//!                                                         │
//!                                                  health monitor
//!                                                   (background)
//! ```

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "balancer", version, about = "HTTP load balancer")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    balancer::lifecycle::startup::run(&args.config).await
}
