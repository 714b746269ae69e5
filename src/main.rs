use clap::Parser;
use tracing_subscriber::EnvFilter;

use ember::config::{Cli, Config};
use ember::server::Server;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ember: {}", e);
            std::process::exit(1);
        }
    };

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("ember: {}", e);
            std::process::exit(1);
        }
    };

    let handle = server.handle();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        handle.shutdown();
    }) {
        tracing::warn!(error = %e, "could not install signal handler");
    }

    if let Err(e) = server.run() {
        eprintln!("ember: {}", e);
        std::process::exit(1);
    }
}
