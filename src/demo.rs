//! Demonstration scenarios for both executors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::sandbox::{
    ExecutionConfig, ExecutionResult, SandboxError, SeatbeltExecutor, WasmExecutor,
};

/// Snippets run through the interpreter, from trivial to fuel-hungry.
const PYTHON_SNIPPETS: &[&str] = &[
    "print('hello world')",
    "for i in range(10000): print('hello world')",
    "print('hello world')",
    "for i in range(100000): print('hello world')",
    "import sqlite3; print(sqlite3.connect(':memory:').execute('select sqlite_version()').fetchone()[0])",
];

/// Runs every scenario and returns the process exit status.
///
/// The interpreter module is loaded before anything runs; without it the
/// demo prints the download hint and fails.
pub async fn run(config: &Config) -> Result<i32> {
    let interpreter = match WasmExecutor::load(&config.wasm.module_path) {
        Ok(executor) => Arc::new(executor),
        Err(e @ SandboxError::ArtifactMissing { .. }) => {
            error!("{e}");
            eprintln!("{e}");
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    seatbelt_scenarios(config).await?;
    python_scenarios(interpreter, config.wasm.fuel).await?;
    Ok(0)
}

async fn seatbelt_scenarios(config: &Config) -> Result<()> {
    if !cfg!(target_os = "macos") {
        warn!("Seatbelt is only available on macOS; expect exit code 127 below");
    }

    let executor = SeatbeltExecutor::new(config.seatbelt.tool.clone());
    info!("Seatbelt scenarios via {}", executor.tool());
    let base = ExecutionConfig {
        timeout: config.seatbelt.timeout(),
        ..Default::default()
    };
    // /tmp is usually a symlink to /private/tmp on macOS
    let tmp = PathBuf::from("/private/tmp");

    println!("\n=== Running ls /private/tmp (read-only) ===");
    let listing = executor
        .run(
            &["ls".to_string(), "/private/tmp".to_string()],
            &ExecutionConfig {
                cwd: Some(PathBuf::from("/")),
                ..base.clone()
            },
            &[],
        )
        .await;
    print_exec("ls /private/tmp", &listing);

    println!("\n=== Running touch /private/tmp/test_seatbelt_fail (write - should fail) ===");
    let fail_file = tmp.join("test_seatbelt_fail");
    let denied = executor.run(&touch(&fail_file), &base, &[]).await;
    print_exec("touch (fail)", &denied);
    remove_if_present(&fail_file);

    println!("\n=== Running touch /private/tmp/test_seatbelt_ok (write - should succeed) ===");
    let ok_file = tmp.join("test_seatbelt_ok");
    if !tmp.exists() {
        if let Err(e) = std::fs::create_dir_all(&tmp) {
            warn!("Could not create {}: {e}", tmp.display());
        }
    }
    let allowed = executor.run(&touch(&ok_file), &base, &[tmp.clone()]).await;
    print_exec("touch (ok)", &allowed);

    if allowed.success() && ok_file.exists() {
        remove_if_present(&ok_file);
    } else if allowed.success() {
        println!("Command succeeded (exit 0) but file {} not found.", ok_file.display());
    } else {
        println!("Command failed, file {} likely not created.", ok_file.display());
    }

    Ok(())
}

async fn python_scenarios(executor: Arc<WasmExecutor>, fuel: u64) -> Result<()> {
    for code in PYTHON_SNIPPETS {
        println!("{code}");
        println!("====");
        let runner = executor.clone();
        let outcome = tokio::task::spawn_blocking(move || runner.run(code, fuel)).await?;
        match outcome {
            Ok(result) => println!("{result}"),
            Err(e) => println!("{e}"),
        }
    }

    info!("Demo finished");
    Ok(())
}

fn touch(path: &Path) -> Vec<String> {
    vec!["touch".to_string(), path.display().to_string()]
}

fn print_exec(label: &str, result: &ExecutionResult) {
    println!("{label} exited with code: {}", result.exit_code);
    if !result.stdout.is_empty() {
        println!("--- stdout ---");
        println!("{}", result.stdout.trim());
        println!("--------------");
    }
    if !result.stderr.is_empty() {
        println!("--- stderr ---");
        println!("{}", result.stderr.trim());
        println!("--------------");
    }
}

fn remove_if_present(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Could not remove {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_interpreter_fails_demo() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.wasm.module_path = dir.path().join("python-3.12.0.wasm");
        config.seatbelt.tool = "definitely-not-a-real-sandbox-tool".to_string();

        let code = run(&config).await.unwrap();
        assert_eq!(code, 1);
    }
}
