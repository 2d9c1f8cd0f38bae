// Entry point: parses arguments, loads the config and runs the headless control loop.
use clap::Parser;
use std::process::ExitCode;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vmblend::app;
use vmblend::cli::Args;
use vmblend::config::AppConfig;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let args = Args::parse();

    if args.init_config {
        return match AppConfig::write_default(&args.config) {
            Ok(_) => {
                info!(path = %args.config.display(), "default config written");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(%err, "cannot write config");
                ExitCode::FAILURE
            }
        };
    }

    let cfg = match AppConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "configuration fault");
            return ExitCode::FAILURE;
        }
    };

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_for_ctrlc = stop_flag.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        stop_flag_for_ctrlc.store(true, Ordering::SeqCst);
    }) {
        error!(%err, "error setting Ctrl-C handler");
        return ExitCode::FAILURE;
    }

    match app::run(&args, &cfg, stop_flag) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "run failed");
            ExitCode::FAILURE
        }
    }
}
