mod cli;
mod config;
mod extract;
mod graph;
mod partition;
mod reconcile;
mod registry;
mod scan;
mod toggle;
mod update;

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modvault=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = cli::run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
