#![forbid(unsafe_code)]

mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use vex_core::Config;

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_tracing(log_level);

    if !cli.foreground {
        tracing::warn!("process daemonization is out of scope; running attached");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(vex_daemon::run(config))
}
