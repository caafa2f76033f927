mod cli;
mod config;
mod demo;
mod sandbox;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::sandbox::{ExecutionConfig, SandboxError, SeatbeltExecutor, WasmExecutor};

/// Exit status for usage errors.
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match cli::parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}\n\nRun 'sandbox-runner --help' for usage.");
            std::process::exit(EXIT_USAGE);
        }
    };

    // Handle --help / --version before anything else
    match cli.command {
        Command::Help => {
            cli::print_help();
            return Ok(());
        }
        Command::Version => {
            println!("sandbox-runner v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandbox_runner=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(ref path) = cli.config_path {
        info!("Loading configuration from {path}");
    }
    let config = Config::load_or_default(cli.config_path.as_deref())?;

    let code = dispatch(cli, &config).await?;
    std::process::exit(code);
}

/// Runs the selected command and returns the process exit status.
async fn dispatch(cli: Cli, config: &Config) -> Result<i32> {
    match cli.command {
        Command::Exec {
            command,
            writable_roots,
            cwd,
            timeout,
        } => {
            let executor = SeatbeltExecutor::new(config.seatbelt.tool.clone());
            let exec_config = ExecutionConfig {
                cwd,
                env: None,
                timeout: timeout.or_else(|| config.seatbelt.timeout()),
            };
            let result = executor.run(&command, &exec_config, &writable_roots).await;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
            }
            Ok(result.exit_code)
        }
        Command::Python { code, fuel } => {
            let executor = match WasmExecutor::load(&config.wasm.module_path) {
                Ok(executor) => executor,
                Err(e @ SandboxError::ArtifactMissing { .. }) => {
                    error!("{e}");
                    eprintln!("{e}");
                    return Ok(1);
                }
                Err(e) => return Err(e.into()),
            };
            let fuel = fuel.unwrap_or(config.wasm.fuel);
            info!(
                "Running snippet with {} (fuel budget {fuel})",
                executor.module_path().display()
            );
            let outcome = tokio::task::spawn_blocking(move || executor.run(&code, fuel)).await?;

            match outcome {
                Ok(result) => {
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        print!("{result}");
                    }
                    Ok(0)
                }
                Err(e) => {
                    if let SandboxError::GuestTrap { ref stderr, .. } = e {
                        eprint!("{stderr}");
                    }
                    if e.is_out_of_fuel() {
                        eprintln!("fuel budget of {fuel} exhausted");
                    }
                    eprintln!("{e}");
                    Ok(1)
                }
            }
        }
        Command::Demo => demo::run(config).await,
        Command::Help | Command::Version => Ok(0),
    }
}
