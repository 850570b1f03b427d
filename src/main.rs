//! annocanvas command-line entry point.

use std::process::ExitCode;

use annocanvas::EngineConfig;
use annocanvas::cli::{self, Cli};
use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(cli.engine_config.as_deref());
    let level = cli.log_level.unwrap_or(config.log_level);

    // RUST_LOG, when set, refines the configured level
    env_logger::Builder::new()
        .filter_level(level.to_level_filter())
        .parse_default_env()
        .init();
    log::debug!("Log level: {}", level.name());

    match cli::execute(&cli) {
        Ok(report) => {
            print!("{}", report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
