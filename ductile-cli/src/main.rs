use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ductile_config::ConfigLoader;
use ductile_server::logging;

/// Exit codes: 0 success, 1 configuration error at startup, 2 runtime
/// fatal.
const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

#[derive(Parser)]
#[command(
    name = "ductile",
    version,
    about = "Declarative SQL endpoints over an embedded analytical engine"
)]
struct Cli {
    /// Project configuration file
    #[arg(long, default_value = "ductile.yaml")]
    config: PathBuf,

    /// Listen port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Log level (debug|info|warning|error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log = logging::init(&cli.log_level);

    let loader = match ConfigLoader::new(&cli.config) {
        Ok(loader) => loader,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("runtime start failed: {err}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    runtime.block_on(async move {
        let (state, errors) = match ductile_server::build_state(loader, log).await {
            Ok(built) => built,
            Err(err) => {
                tracing::error!(error = %err, "startup failed");
                return ExitCode::from(EXIT_CONFIG);
            }
        };
        if !errors.is_empty() {
            for error in &errors {
                tracing::error!(error = %error, "invalid endpoint descriptor");
            }
            return ExitCode::from(EXIT_CONFIG);
        }
        tracing::info!(
            endpoints = state.registry.snapshot().len(),
            connections = state.project.connections.len(),
            "project loaded"
        );

        match ductile_server::run(state, cli.port).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(error = %err, "fatal server error");
                ExitCode::from(EXIT_RUNTIME)
            }
        }
    })
}
