//! Per-user sandboxed execution.
//!
//! Each user gets an isolated working directory under the configured root.
//! Commands run via `tokio::process::Command` with `kill_on_drop` so a
//! timeout or cooperative cancellation reliably kills the child. Stdout
//! and stderr are each truncated to [`MAX_OUTPUT_BYTES`] (100 KB) to
//! prevent memory exhaustion from runaway commands.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{SandboxError, SandboxResult};

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Maximum output size in bytes (100 KB). Stdout and stderr are each
/// independently truncated to this limit.
const MAX_OUTPUT_BYTES: usize = 100 * 1024;

/// Tool names the sandbox runtime owns. The executor routes these here.
const SANDBOX_TOOLS: &[&str] = &[
    "execute_python",
    "run_shell",
    "install_package",
    "read_file",
    "write_file",
    "list_files",
];

/// Returns `true` if `name` is a sandbox-dispatched tool.
pub fn is_sandbox_tool(name: &str) -> bool {
    SANDBOX_TOOLS.contains(&name)
}

/// Configuration for the sandbox runtime.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Root directory under which per-user workdirs are created.
    pub root: PathBuf,
    /// Timeout applied to every command, in seconds.
    pub timeout_secs: u64,
    /// Interpreter used for `execute_python` (e.g. `python3`).
    pub python_bin: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/sandbox"),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            python_bin: "python3".to_owned(),
        }
    }
}

/// Structured result of a sandbox execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Captured stdout, truncated at 100 KB.
    pub stdout: String,
    /// Captured stderr, truncated at 100 KB.
    pub stderr: String,
    /// Process exit code, `-1` when terminated by signal.
    pub exit_code: i32,
}

impl ExecutionOutput {
    /// Whether the process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Render the output the way tool results are fed back to the LLM.
    pub fn to_tool_result(&self) -> String {
        if self.success() {
            if self.stdout.is_empty() {
                "(no output)".to_owned()
            } else {
                self.stdout.clone()
            }
        } else {
            format!(
                "Error: exit code {}\n{}",
                self.exit_code,
                if self.stderr.is_empty() {
                    &self.stdout
                } else {
                    &self.stderr
                }
            )
        }
    }
}

/// Per-user isolated execution runtime.
pub struct SandboxRuntime {
    config: SandboxConfig,
}

impl SandboxRuntime {
    /// Create a runtime rooted at `config.root`. The root directory is
    /// created eagerly so later per-user creation cannot race on it.
    pub fn new(config: SandboxConfig) -> SandboxResult<Self> {
        std::fs::create_dir_all(&config.root)?;
        Ok(Self { config })
    }

    /// Handle a sandbox tool call and render a result string for the LLM.
    ///
    /// Timeouts and failures are converted into `Error: ...` strings so
    /// the tool loop can feed them back to the model rather than aborting.
    pub async fn handle_tool_call(&self, user_id: &str, tool_name: &str, args: &Value) -> String {
        let result = match tool_name {
            "execute_python" => self.execute_python(user_id, args).await,
            "run_shell" => self.run_shell(user_id, args).await,
            "install_package" => self.install_package(user_id, args).await,
            "read_file" => return self.read_file_result(user_id, args),
            "write_file" => return self.write_file_result(user_id, args),
            "list_files" => return self.list_files_result(user_id),
            other => {
                return format!("Unknown tool: {other}");
            }
        };

        match result {
            Ok(output) => output.to_tool_result(),
            Err(e) => format!("Error: {e}"),
        }
    }

    /// Execute a Python snippet in the user's workdir.
    pub async fn execute_python(&self, user_id: &str, args: &Value) -> SandboxResult<ExecutionOutput> {
        let code = require_str(args, "code", "execute_python")?;
        let workdir = self.user_dir(user_id)?;

        // Write the snippet to a scratch file so tracebacks carry line numbers.
        let script = workdir.join(".snippet.py");
        tokio::fs::write(&script, code).await?;

        self.run_command(
            Command::new(&self.config.python_bin).arg(&script).current_dir(&workdir),
        )
        .await
    }

    /// Run a shell command in the user's workdir.
    pub async fn run_shell(&self, user_id: &str, args: &Value) -> SandboxResult<ExecutionOutput> {
        let command = require_str(args, "command", "run_shell")?;
        let workdir = self.user_dir(user_id)?;

        debug!(user_id, command, "sandbox shell command");

        self.run_command(
            Command::new("sh").arg("-c").arg(command).current_dir(&workdir),
        )
        .await
    }

    /// Install a Python package into the user's environment.
    pub async fn install_package(&self, user_id: &str, args: &Value) -> SandboxResult<ExecutionOutput> {
        let package = require_str(args, "package", "install_package")?;
        let workdir = self.user_dir(user_id)?;

        // Package names are passed as a single argv element, never through
        // a shell, so metacharacters cannot escape.
        self.run_command(
            Command::new(&self.config.python_bin)
                .args(["-m", "pip", "install", "--user"])
                .arg(package)
                .current_dir(&workdir),
        )
        .await
    }

    /// Read a file from the user's workdir.
    pub fn read_file(&self, user_id: &str, path: &str) -> SandboxResult<String> {
        let full = self.resolve_path(user_id, path)?;
        Ok(std::fs::read_to_string(full)?)
    }

    /// Write a file into the user's workdir.
    pub fn write_file(&self, user_id: &str, path: &str, content: &str) -> SandboxResult<()> {
        let full = self.resolve_path(user_id, path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, content)?;
        Ok(())
    }

    /// List files in the user's workdir.
    pub fn list_files(&self, user_id: &str) -> SandboxResult<Vec<(String, u64)>> {
        let dir = self.user_dir(user_id)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                entries.push((name, meta.len()));
            }
        }
        entries.sort();
        Ok(entries)
    }

    // ── tool-result rendering ────────────────────────────────────────

    fn read_file_result(&self, user_id: &str, args: &Value) -> String {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return "Error: missing required string field `path`".to_owned();
        };
        match self.read_file(user_id, path) {
            Ok(content) => content,
            Err(e) => format!("Error: {e}"),
        }
    }

    fn write_file_result(&self, user_id: &str, args: &Value) -> String {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return "Error: missing required string field `path`".to_owned();
        };
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        match self.write_file(user_id, path, content) {
            Ok(()) => format!("Wrote {} bytes to {path}", content.len()),
            Err(e) => format!("Error: {e}"),
        }
    }

    fn list_files_result(&self, user_id: &str) -> String {
        match self.list_files(user_id) {
            Ok(files) if files.is_empty() => "No files in sandbox.".to_owned(),
            Ok(files) => {
                let lines: Vec<String> = files
                    .into_iter()
                    .map(|(name, size)| {
                        if size < 1024 {
                            format!("- {name} ({size} bytes)")
                        } else {
                            format!("- {name} ({:.1} KB)", size as f64 / 1024.0)
                        }
                    })
                    .collect();
                format!("Sandbox files:\n{}", lines.join("\n"))
            }
            Err(e) => format!("Error: {e}"),
        }
    }

    // ── internals ────────────────────────────────────────────────────

    /// The user's workdir, created on first use.
    fn user_dir(&self, user_id: &str) -> SandboxResult<PathBuf> {
        // Flatten the id into a single path component.
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let dir = self.config.root.join(safe);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Resolve a user-supplied relative path, rejecting escapes.
    fn resolve_path(&self, user_id: &str, path: &str) -> SandboxResult<PathBuf> {
        if Path::new(path).is_absolute() || path.split('/').any(|part| part == "..") {
            return Err(SandboxError::InvalidPath {
                path: path.to_owned(),
            });
        }
        Ok(self.user_dir(user_id)?.join(path))
    }

    /// Spawn the prepared command and wait with the configured timeout.
    async fn run_command(&self, command: &mut Command) -> SandboxResult<ExecutionOutput> {
        let child = command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Process {
                reason: format!("failed to spawn process: {e}"),
            })?;

        // `wait_with_output` takes ownership, so on timeout the child is
        // dropped and killed via `kill_on_drop(true)`.
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.timeout_secs),
            child.wait_with_output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                let (stdout, _) = truncate_output(&output.stdout);
                let (stderr, _) = truncate_output(&output.stderr);
                debug!(exit_code, "sandbox command completed");
                Ok(ExecutionOutput {
                    stdout,
                    stderr,
                    exit_code,
                })
            }
            Ok(Err(e)) => Err(SandboxError::Process {
                reason: format!("process error: {e}"),
            }),
            Err(_) => {
                warn!(timeout_secs = self.config.timeout_secs, "sandbox command timed out");
                Err(SandboxError::Timeout {
                    seconds: self.config.timeout_secs,
                })
            }
        }
    }
}

/// Truncate raw command output to [`MAX_OUTPUT_BYTES`], converting to a
/// lossy UTF-8 string. Returns `(output_string, was_truncated)`.
fn truncate_output(raw: &[u8]) -> (String, bool) {
    if raw.len() <= MAX_OUTPUT_BYTES {
        (String::from_utf8_lossy(raw).into_owned(), false)
    } else {
        let truncated = &raw[..MAX_OUTPUT_BYTES];
        let mut s = String::from_utf8_lossy(truncated).into_owned();
        s.push_str("\n... [output truncated at 100 KB]");
        (s, true)
    }
}

fn require_str<'a>(args: &'a Value, field: &str, tool_name: &str) -> SandboxResult<&'a str> {
    args.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| SandboxError::InvalidParams {
            tool_name: tool_name.to_owned(),
            reason: format!("missing required string field `{field}`"),
        })
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runtime() -> (SandboxRuntime, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = SandboxRuntime::new(SandboxConfig {
            root: tmp.path().to_path_buf(),
            timeout_secs: 5,
            python_bin: "python3".to_owned(),
        })
        .unwrap();
        (runtime, tmp)
    }

    #[tokio::test]
    async fn shell_command_captures_output() {
        let (runtime, _tmp) = runtime();
        let out = runtime
            .run_shell("u1", &json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn shell_timeout_becomes_error_string() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = SandboxRuntime::new(SandboxConfig {
            root: tmp.path().to_path_buf(),
            timeout_secs: 1,
            python_bin: "python3".to_owned(),
        })
        .unwrap();

        let result = runtime
            .handle_tool_call("u1", "run_shell", &json!({"command": "sleep 10"}))
            .await;
        assert!(result.starts_with("Error:"));
        assert!(result.contains("timed out"));
    }

    #[tokio::test]
    async fn file_roundtrip_within_sandbox() {
        let (runtime, _tmp) = runtime();
        runtime.write_file("u1", "notes.txt", "contents").unwrap();
        assert_eq!(runtime.read_file("u1", "notes.txt").unwrap(), "contents");

        let files = runtime.list_files("u1").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "notes.txt");
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let (runtime, _tmp) = runtime();
        assert!(matches!(
            runtime.read_file("u1", "../other/secret"),
            Err(SandboxError::InvalidPath { .. })
        ));
        assert!(matches!(
            runtime.write_file("u1", "/etc/passwd", "x"),
            Err(SandboxError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let (runtime, _tmp) = runtime();
        runtime.write_file("alice", "a.txt", "alice's").unwrap();
        assert!(runtime.read_file("bob", "a.txt").is_err());
    }

    #[test]
    fn sandbox_tool_names() {
        assert!(is_sandbox_tool("execute_python"));
        assert!(is_sandbox_tool("run_shell"));
        assert!(!is_sandbox_tool("web_search"));
    }

    #[tokio::test]
    async fn missing_argument_is_error_string() {
        let (runtime, _tmp) = runtime();
        let result = runtime.handle_tool_call("u1", "run_shell", &json!({})).await;
        assert!(result.starts_with("Error:"));
    }
}
