use anyhow::Result;
use clap::Parser;
use sluice::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sluice", about = "Admission control and priority scheduling core for an LLM gateway")]
struct Cli {
    /// Path to the core config file (TOML or JSON)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Admin API listen address (health/metrics/time-rules)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        admin_listen: cli.admin_listen,
    }))
}
