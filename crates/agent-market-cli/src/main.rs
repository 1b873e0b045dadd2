use std::process::ExitCode;

use agent_market_cli::{error_payload, run_cli, Cli};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    match run_cli(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = error_payload(&err);
            match serde_json::to_string_pretty(&payload) {
                Ok(rendered) => eprintln!("{rendered}"),
                Err(_) => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
