use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use promrelay::app;
use promrelay::config::Config;

#[derive(Debug, Parser)]
#[command(name = "promrelay", version, about = "A buffering, sharding ingestion proxy for Prometheus remote write")]
struct Opts {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "PROMRELAY_CONFIG")]
    config: PathBuf,
}

fn main() {
    let opts = Opts::parse();

    let config = match Config::load(&opts.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load configuration: {error}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    let filter = match EnvFilter::try_new(&config.log.level) {
        Ok(filter) => filter,
        Err(error) => {
            eprintln!("invalid log level {:?}: {error}", config.log.level);
            std::process::exit(exitcode::CONFIG);
        }
    };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start runtime: {error}");
            std::process::exit(exitcode::OSERR);
        }
    };

    if let Err(error) = runtime.block_on(app::run(config)) {
        tracing::error!(%error, "fatal");
        std::process::exit(exitcode::SOFTWARE);
    }

    std::process::exit(exitcode::OK);
}
