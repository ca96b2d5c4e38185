//! Command-line surface for `vexd`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "user-space L2/L3 tunnel daemon", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "vex.toml")]
    pub config: PathBuf,

    /// Stay attached to the controlling terminal instead of logging only.
    #[arg(long)]
    pub foreground: bool,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}
