// Standard library
use std::ffi::OsStr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use crate::error::{CoreError, Result};
use duct::cmd;
use tracing::debug;
use which::which;

/// Lines of output kept in error messages for failed commands.
const ERROR_CONTEXT_LINES: usize = 50;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Options applied to a captured command run.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Combined stdout/stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The trailing lines of output, used for error reporting.
    pub fn tail(&self) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(ERROR_CONTEXT_LINES);
        lines[start..].join("\n")
    }
}

fn render_command_line<A: AsRef<OsStr>>(command: &str, args: &[A]) -> String {
    let mut full = command.to_string();
    for arg in args {
        full.push(' ');
        full.push_str(&arg.as_ref().to_string_lossy());
    }
    full
}

/// Run a command to completion, capturing stderr and stdout together.
///
/// A non-zero exit is not an error here; callers inspect `exit_code`. When the
/// timeout elapses the child is killed and `CoreError::Timeout` is returned.
pub fn run_captured<A: AsRef<OsStr>>(
    command: &str,
    args: &[A],
    options: &CommandOptions,
) -> Result<CommandOutput> {
    let full_command = render_command_line(command, args);
    debug!(command = %full_command, "running command");

    let mut expression = cmd(command, args)
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked();
    if let Some(cwd) = &options.cwd {
        expression = expression.dir(cwd);
    }
    for (key, value) in &options.env {
        expression = expression.env(key, value);
    }

    let handle = expression.start().map_err(|e| {
        CoreError::Command(format!("Failed to start command '{}': {}", full_command, e))
    })?;

    let start = Instant::now();
    loop {
        if let Some(timeout) = options.timeout {
            if start.elapsed() >= timeout {
                let _ = handle.kill();
                return Err(CoreError::Timeout(format!(
                    "command exceeded {}s: {}",
                    timeout.as_secs_f64(),
                    full_command
                )));
            }
        }

        match handle.try_wait() {
            Ok(Some(output)) => {
                return Ok(CommandOutput {
                    exit_code: output.status.code(),
                    output: String::from_utf8_lossy(&output.stdout).into_owned(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(CoreError::Command(format!(
                    "Error waiting for command '{}': {}",
                    full_command, e
                )));
            }
        }
    }
}

/// Like [`run_captured`] but turns a non-zero exit into `CoreError::Command`.
pub fn run_checked<A: AsRef<OsStr>>(
    command: &str,
    args: &[A],
    options: &CommandOptions,
) -> Result<CommandOutput> {
    let output = run_captured(command, args, options)?;
    if !output.success() {
        return Err(CoreError::Command(format!(
            "exit code {:?}: {}\n\nOutput (last {} lines):\n{}",
            output.exit_code,
            render_command_line(command, args),
            ERROR_CONTEXT_LINES,
            output.tail()
        )));
    }
    Ok(output)
}

/// Checks if a command-line tool is available in the system's PATH.
pub fn is_tool_installed(tool_name: &str) -> bool {
    which(tool_name).is_ok()
}
