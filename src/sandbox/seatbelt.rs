//! Policy-scoped process executor.
//!
//! Wraps an arbitrary command in `sandbox-exec` with a profile built for
//! this call only. Every outcome, including a missing front end, a timeout
//! or a spawn failure, comes back as an [`ExecutionResult`]; nothing is
//! raised to the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{SandboxError, SandboxResult};
use super::policy::{RootReport, SeatbeltPolicy, WritableRoots};

/// Default enforcement front end, looked up on `PATH`.
pub const SANDBOX_EXEC: &str = "sandbox-exec";

/// Exit code reported when the front end is not installed.
pub const EXIT_TOOL_MISSING: i32 = 127;

/// Exit code reported when the caller's timeout elapsed.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code for unexpected failures that carry no OS error number.
const EXIT_GENERIC_FAILURE: i32 = 1;

/// How long pipe readers may keep draining after a timed-out child is killed.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Per-call options applied to the child. Nothing else can be set.
#[derive(Debug, Clone, Default)]
pub struct ExecutionConfig {
    /// Working directory of the child.
    pub cwd: Option<PathBuf>,
    /// Replaces the child's environment entirely when set.
    pub env: Option<HashMap<String, String>>,
    /// Wall-clock limit; the child is killed once it elapses.
    pub timeout: Option<Duration>,
}

/// Outcome of a sandboxed command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Real exit code, or 127 (front end missing), 124 (timeout), or an OS
    /// error number when the command never ran to completion.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Writable roots granted to and skipped from the profile.
    pub roots: RootReport,
}

impl ExecutionResult {
    /// Maps a failure onto the sentinel result shape.
    pub fn from_error(err: SandboxError, roots: RootReport) -> Self {
        let message = err.to_string();
        let (exit_code, stdout, stderr) = match err {
            SandboxError::ToolUnavailable { .. } => (EXIT_TOOL_MISSING, String::new(), message),
            SandboxError::Timeout { stdout, stderr, .. } => {
                let stderr = if stderr.is_empty() { message } else { stderr };
                (EXIT_TIMEOUT, stdout, stderr)
            }
            SandboxError::UnexpectedHostError { errno, .. } => (
                errno.unwrap_or(EXIT_GENERIC_FAILURE),
                String::new(),
                message,
            ),
            // Not produced on the process path; kept as generic failures.
            SandboxError::WritableRootUnusable { .. }
            | SandboxError::GuestTrap { .. }
            | SandboxError::ArtifactMissing { .. } => {
                (EXIT_GENERIC_FAILURE, String::new(), message)
            }
        };
        Self {
            exit_code,
            stdout,
            stderr,
            roots,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands under `sandbox-exec` with a per-call Seatbelt profile.
///
/// Holds no per-call state; overlapping calls are independent.
#[derive(Debug, Clone)]
pub struct SeatbeltExecutor {
    tool: String,
}

impl Default for SeatbeltExecutor {
    fn default() -> Self {
        Self::new(SANDBOX_EXEC)
    }
}

impl SeatbeltExecutor {
    /// Creates an executor that invokes `tool` as the enforcement front end.
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Runs `command` inside the sandbox, granting write access only to the
    /// existing paths among `writable_roots`.
    pub async fn run(
        &self,
        command: &[String],
        config: &ExecutionConfig,
        writable_roots: &[PathBuf],
    ) -> ExecutionResult {
        let roots: WritableRoots = writable_roots.iter().cloned().collect();
        if roots.len() < writable_roots.len() {
            debug!(
                "Collapsed {} duplicate writable root(s)",
                writable_roots.len() - roots.len()
            );
        }
        let policy = SeatbeltPolicy::build(&roots);
        let report = policy.report();

        info!(
            "Running seatbelt with {} template params",
            policy.params().len()
        );

        match self.spawn_and_wait(&policy, command, config).await {
            Ok((status, stdout, stderr)) => ExecutionResult {
                exit_code: exit_code_of(status),
                stdout,
                stderr,
                roots: report,
            },
            Err(err) => {
                match &err {
                    SandboxError::Timeout { after, .. } => {
                        warn!("Command timed out after {} seconds.", after.as_secs_f64())
                    }
                    other => error!("{other}"),
                }
                ExecutionResult::from_error(err, report)
            }
        }
    }

    async fn spawn_and_wait(
        &self,
        policy: &SeatbeltPolicy,
        command: &[String],
        config: &ExecutionConfig,
    ) -> SandboxResult<(ExitStatus, String, String)> {
        if command.is_empty() {
            return Err(SandboxError::UnexpectedHostError {
                message: "empty command".to_string(),
                errno: None,
            });
        }

        let args = policy.launch_args(command);
        debug!("Executing command: {} {:?}", self.tool, args);

        let mut cmd = Command::new(&self.tool);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(ref env) = config.env {
            cmd.env_clear().envs(env);
        }

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e, config))?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let mut stdout_task = drain(child.stdout.take(), stdout_buf.clone());
        let mut stderr_task = drain(child.stderr.take(), stderr_buf.clone());

        // Output is complete only once both readers hit EOF, so the deadline
        // covers them as well as the child itself.
        let collect = async {
            let status = child.wait().await?;
            // A failed join only loses output, not the status.
            let _ = (&mut stdout_task).await;
            let _ = (&mut stderr_task).await;
            Ok::<_, std::io::Error>(status)
        };

        let status = match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(status) => status.map_err(SandboxError::host)?,
                Err(_elapsed) => {
                    // The child may have exited already, leaving a background
                    // process holding the pipes.
                    if let Ok(None) = child.try_wait() {
                        if let Err(e) = child.kill().await {
                            warn!("Failed to kill timed-out child: {e}");
                        }
                    }
                    tokio::join!(
                        finish_with_grace(stdout_task),
                        finish_with_grace(stderr_task)
                    );
                    return Err(SandboxError::Timeout {
                        after: limit,
                        stdout: take_text(&stdout_buf).await,
                        stderr: take_text(&stderr_buf).await,
                    });
                }
            },
            None => collect.await.map_err(SandboxError::host)?,
        };

        Ok((status, take_text(&stdout_buf).await, take_text(&stderr_buf).await))
    }

    /// `NotFound` from spawn means the front end is missing, unless the
    /// requested working directory is what does not exist.
    fn spawn_error(&self, err: std::io::Error, config: &ExecutionConfig) -> SandboxError {
        let cwd_missing = config.cwd.as_ref().is_some_and(|cwd| !cwd.is_dir());
        if err.kind() == std::io::ErrorKind::NotFound && !cwd_missing {
            SandboxError::ToolUnavailable {
                tool: self.tool.clone(),
            }
        } else {
            SandboxError::host(err)
        }
    }
}

/// Copies a child pipe into a shared buffer until EOF.
fn drain<R>(reader: Option<R>, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!("Pipe read failed: {e}");
                    break;
                }
            }
        }
    })
}

/// A grandchild may still hold the pipe open after the child is killed.
async fn finish_with_grace(task: JoinHandle<()>) {
    let abort = task.abort_handle();
    if tokio::time::timeout(READER_GRACE, task).await.is_err() {
        abort.abort();
    }
}

async fn take_text(buf: &Mutex<Vec<u8>>) -> String {
    let bytes = std::mem::take(&mut *buf.lock().await);
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // Killed by a signal: report it negated, like a subprocess return code.
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(EXIT_GENERIC_FAILURE)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_GENERIC_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    /// Writes a stand-in front end that drops everything up to `--` and
    /// runs the rest, so launch plumbing can be tested off macOS.
    #[cfg(unix)]
    fn fake_front_end(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-sandbox-exec");
        std::fs::write(
            &path,
            "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"--\" ]; then shift; break; fi\n  shift\ndone\nexec \"$@\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    // ── from_error ──────────────────────────────────────

    #[test]
    fn test_from_error_tool_unavailable() {
        let result = ExecutionResult::from_error(
            SandboxError::ToolUnavailable {
                tool: "sandbox-exec".to_string(),
            },
            RootReport::default(),
        );
        assert_eq!(result.exit_code, 127);
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr, "Error: Command 'sandbox-exec' not found in PATH.");
    }

    #[test]
    fn test_from_error_timeout_keeps_partial_output() {
        let result = ExecutionResult::from_error(
            SandboxError::Timeout {
                after: Duration::from_secs(2),
                stdout: "partial".to_string(),
                stderr: String::new(),
            },
            RootReport::default(),
        );
        assert_eq!(result.exit_code, 124);
        assert_eq!(result.stdout, "partial");
        assert_eq!(result.stderr, "Command timed out after 2 seconds.");
    }

    #[test]
    fn test_from_error_timeout_prefers_captured_stderr() {
        let result = ExecutionResult::from_error(
            SandboxError::Timeout {
                after: Duration::from_secs(2),
                stdout: String::new(),
                stderr: "warming up".to_string(),
            },
            RootReport::default(),
        );
        assert_eq!(result.stderr, "warming up");
    }

    #[test]
    fn test_from_error_unexpected_uses_errno() {
        let result = ExecutionResult::from_error(
            SandboxError::UnexpectedHostError {
                message: "permission denied".to_string(),
                errno: Some(13),
            },
            RootReport::default(),
        );
        assert_eq!(result.exit_code, 13);
        assert!(result.stderr.starts_with("An unexpected error occurred"));

        let result = ExecutionResult::from_error(
            SandboxError::UnexpectedHostError {
                message: "weird".to_string(),
                errno: None,
            },
            RootReport::default(),
        );
        assert_eq!(result.exit_code, 1);
    }

    // ── run ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_missing_front_end_yields_127() {
        let executor = SeatbeltExecutor::new("definitely-not-a-real-sandbox-tool");
        let result = executor
            .run(&cmd(&["ls"]), &ExecutionConfig::default(), &[])
            .await;
        assert_eq!(result.exit_code, EXIT_TOOL_MISSING);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.contains("definitely-not-a-real-sandbox-tool"));
    }

    #[tokio::test]
    async fn test_missing_root_does_not_fail_call() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let executor = SeatbeltExecutor::new("definitely-not-a-real-sandbox-tool");
        let result = executor
            .run(&cmd(&["ls"]), &ExecutionConfig::default(), &[missing.clone()])
            .await;
        assert_eq!(result.exit_code, EXIT_TOOL_MISSING);
        assert!(result.roots.granted.is_empty());
        assert_eq!(result.roots.skipped[0].path, missing);
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let result = SeatbeltExecutor::default()
            .run(&[], &ExecutionConfig::default(), &[])
            .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("empty command"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_cwd_is_not_reported_as_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SeatbeltExecutor::new(fake_front_end(dir.path()));
        let config = ExecutionConfig {
            cwd: Some(dir.path().join("no-such-dir")),
            ..Default::default()
        };
        let result = executor.run(&cmd(&["true"]), &config, &[]).await;
        assert_ne!(result.exit_code, EXIT_TOOL_MISSING);
        assert_ne!(result.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_args_pass_through_unescaped() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SeatbeltExecutor::new(fake_front_end(dir.path()));
        let result = executor
            .run(
                &cmd(&["printf", "%s|", "a b", "$HOME", "--"]),
                &ExecutionConfig::default(),
                &[],
            )
            .await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "a b|$HOME|--|");
        assert!(result.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_exit_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SeatbeltExecutor::new(fake_front_end(dir.path()));
        let result = executor
            .run(
                &cmd(&["sh", "-c", "echo oops >&2; exit 3"]),
                &ExecutionConfig::default(),
                &[],
            )
            .await;
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr, "oops\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cwd_and_env_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SeatbeltExecutor::new(fake_front_end(dir.path()));
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env.insert("GREETING".to_string(), "hi".to_string());
        let config = ExecutionConfig {
            cwd: Some(dir.path().to_path_buf()),
            env: Some(env),
            timeout: None,
        };
        let result = executor
            .run(&cmd(&["sh", "-c", "echo \"$GREETING\"; pwd -P"]), &config, &[])
            .await;
        assert_eq!(result.exit_code, 0);
        let real = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(result.stdout, format!("hi\n{}\n", real.display()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_yields_124_with_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SeatbeltExecutor::new(fake_front_end(dir.path()));
        let config = ExecutionConfig {
            timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let result = executor
            .run(&cmd(&["sh", "-c", "echo started; exec sleep 10"]), &config, &[])
            .await;
        assert_eq!(result.exit_code, EXIT_TIMEOUT);
        assert_eq!(result.stdout, "started\n");
        assert_eq!(result.stderr, "Command timed out after 0.3 seconds.");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_covers_background_process_holding_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SeatbeltExecutor::new(fake_front_end(dir.path()));
        let config = ExecutionConfig {
            timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let result = executor
            .run(&cmd(&["sh", "-c", "echo started; sleep 4 &"]), &config, &[])
            .await;
        assert_eq!(result.exit_code, EXIT_TIMEOUT);
        assert_eq!(result.stdout, "started\n");
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "run returned after {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fast_command_within_timeout_keeps_real_status() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SeatbeltExecutor::new(fake_front_end(dir.path()));
        let config = ExecutionConfig {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let result = executor
            .run(&cmd(&["sh", "-c", "echo done; exit 4"]), &config, &[])
            .await;
        assert_eq!(result.exit_code, 4);
        assert_eq!(result.stdout, "done\n");
    }

    #[cfg(target_os = "macos")]
    mod seatbelt {
        use super::*;

        #[tokio::test]
        async fn test_read_only_listing_succeeds() {
            let result = SeatbeltExecutor::default()
                .run(
                    &cmd(&["ls", "/private/tmp"]),
                    &ExecutionConfig {
                        cwd: Some(PathBuf::from("/")),
                        ..Default::default()
                    },
                    &[],
                )
                .await;
            assert_eq!(result.exit_code, 0);
            assert!(result.stderr.is_empty());
        }

        #[tokio::test]
        async fn test_write_denied_without_roots() {
            let dir = tempfile::tempdir().unwrap();
            let target = dir.path().join("f");
            let result = SeatbeltExecutor::default()
                .run(
                    &cmd(&["touch", &target.to_string_lossy()]),
                    &ExecutionConfig::default(),
                    &[],
                )
                .await;
            assert_ne!(result.exit_code, 0);
            assert!(!target.exists());
        }

        #[tokio::test]
        async fn test_write_allowed_inside_root() {
            let dir = tempfile::tempdir().unwrap();
            let sub = dir.path().join("nested");
            std::fs::create_dir(&sub).unwrap();
            let target = sub.join("f");
            let result = SeatbeltExecutor::default()
                .run(
                    &cmd(&["touch", &target.to_string_lossy()]),
                    &ExecutionConfig::default(),
                    &[dir.path().to_path_buf()],
                )
                .await;
            assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
            assert!(target.exists());
        }

        #[tokio::test]
        async fn test_write_denied_outside_root() {
            let allowed = tempfile::tempdir().unwrap();
            let other = tempfile::tempdir().unwrap();
            let target = other.path().join("f");
            let result = SeatbeltExecutor::default()
                .run(
                    &cmd(&["touch", &target.to_string_lossy()]),
                    &ExecutionConfig::default(),
                    &[allowed.path().to_path_buf()],
                )
                .await;
            assert_ne!(result.exit_code, 0);
            assert!(!target.exists());
        }

        #[tokio::test]
        async fn test_dev_null_is_writable() {
            let result = SeatbeltExecutor::default()
                .run(
                    &cmd(&["sh", "-c", "echo x > /dev/null"]),
                    &ExecutionConfig::default(),
                    &[],
                )
                .await;
            assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
        }
    }
}
