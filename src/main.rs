// Entrypoint for the CLI application.
// - Keeps `main` small: install the log subscriber, parse the command
//   line and dispatch.
// - Authentication failures exit 2 so wrappers can prompt a re-login;
//   every other failure exits 3.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use skiff_cli::cli::{self, Cli};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(error) = cli::run(cli) {
        eprintln!("ERROR: {error}");
        std::process::exit(cli::exit_code(&error));
    }
}
