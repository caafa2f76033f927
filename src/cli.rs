//! Command-line parsing.
//!
//! Hand-rolled: the surface is small and `--` must hand the remaining
//! arguments to the sandboxed command untouched.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a command under the Seatbelt executor.
    Exec {
        command: Vec<String>,
        writable_roots: Vec<PathBuf>,
        cwd: Option<PathBuf>,
        timeout: Option<Duration>,
    },
    /// Run Python code under the fuel-metered executor.
    Python { code: String, fuel: Option<u64> },
    /// Replay the demonstration scenarios.
    Demo,
    Help,
    Version,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub config_path: Option<String>,
    /// Print results as JSON instead of plain text
    pub json: bool,
    pub command: Command,
}

pub fn print_help() {
    println!(
        "\
sandbox-runner v{}

Run untrusted code under a Seatbelt profile or a fuel-metered Wasm engine.

USAGE:
    sandbox-runner [OPTIONS] <COMMAND>

COMMANDS:
    exec [--writable PATH]... [--cwd DIR] [--timeout SECS] -- <CMD> [ARGS...]
                     Run CMD under sandbox-exec with a read-only profile,
                     granting write access only to the given paths
    python [--fuel N] <CODE>
                     Run CODE with the precompiled CPython Wasm module
    demo             Replay the demonstration scenarios of both executors

OPTIONS:
    -c, --config PATH    TOML configuration file
        --json           Print results as JSON
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, sandbox_runner=debug,warn)

EXAMPLES:
    sandbox-runner exec -- ls /private/tmp
    sandbox-runner exec --writable /private/tmp -- touch /private/tmp/f
    sandbox-runner python --fuel 100000000 \"print('hello world')\"
    RUST_LOG=debug sandbox-runner exec -- ls   # shows the full profile",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parses the arguments after the program name.
pub fn parse_args<I>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut config_path = None;
    let mut json = false;

    let subcommand = loop {
        let Some(arg) = args.next() else {
            return Ok(Cli {
                config_path,
                json,
                command: Command::Help,
            });
        };
        match arg.as_str() {
            "-h" | "--help" => {
                return Ok(Cli {
                    config_path,
                    json,
                    command: Command::Help,
                })
            }
            "-V" | "--version" => {
                return Ok(Cli {
                    config_path,
                    json,
                    command: Command::Version,
                })
            }
            "-c" | "--config" => config_path = Some(value_for(&arg, args.next())?),
            "--json" => json = true,
            other if other.starts_with('-') => bail!("unknown option '{other}'"),
            _ => break arg,
        }
    };

    let command = match subcommand.as_str() {
        "exec" => parse_exec(args)?,
        "python" => parse_python(args)?,
        "demo" => {
            if let Some(extra) = args.next() {
                bail!("unexpected argument '{extra}' for demo");
            }
            Command::Demo
        }
        other => bail!("unknown command '{other}'"),
    };

    Ok(Cli {
        config_path,
        json,
        command,
    })
}

fn parse_exec(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let mut writable_roots = Vec::new();
    let mut cwd = None;
    let mut timeout = None;
    let mut command = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--" => break,
            "-w" | "--writable" => writable_roots.push(PathBuf::from(value_for(&arg, args.next())?)),
            "--cwd" => cwd = Some(PathBuf::from(value_for(&arg, args.next())?)),
            "--timeout" => {
                let raw = value_for(&arg, args.next())?;
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| anyhow!("invalid timeout '{raw}'"))?;
                timeout = Some(
                    Duration::try_from_secs_f64(secs)
                        .map_err(|_| anyhow!("invalid timeout '{raw}'"))?,
                );
            }
            other if other.starts_with('-') => bail!("unknown exec option '{other}'"),
            _ => {
                command.push(arg);
                break;
            }
        }
    }
    command.extend(args);

    if command.is_empty() {
        bail!("exec needs a command after '--'");
    }

    Ok(Command::Exec {
        command,
        writable_roots,
        cwd,
        timeout,
    })
}

fn parse_python(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let mut fuel = None;
    let mut code = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fuel" => {
                let raw = value_for(&arg, args.next())?;
                let value: u64 = raw
                    .replace('_', "")
                    .parse()
                    .map_err(|_| anyhow!("invalid fuel budget '{raw}'"))?;
                if value == 0 {
                    bail!("fuel budget must be positive");
                }
                fuel = Some(value);
            }
            _ if code.is_none() => code = Some(arg),
            _ => bail!("python takes a single CODE argument (quote it)"),
        }
    }

    let code = code.ok_or_else(|| anyhow!("python needs a CODE argument"))?;
    Ok(Command::Python { code, fuel })
}

fn value_for(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| anyhow!("option '{flag}' needs a value"))
}
