use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Path to config TOML
    #[arg(long, default_value = "vmblend.toml")]
    pub config: PathBuf,

    /// Write a commented default config to --config and exit
    #[arg(long, default_value_t = false)]
    pub init_config: bool,

    /// Run length in seconds (overrides config)
    #[arg(long)]
    pub duration: Option<f64>,

    /// Demonstration samples to fit into a new mechanism once the loop is running
    #[arg(long, value_name = "FILE")]
    pub insert_samples: Option<PathBuf>,

    /// Save every mechanism's model into this directory on exit
    #[arg(long, value_name = "DIR")]
    pub save_dir: Option<PathBuf>,

    /// Suppress the periodic telemetry log line
    #[arg(long, default_value_t = false)]
    pub quiet_telemetry: bool,
}
