use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::ExitError;

/// Result of running a subprocess.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// True when the process was killed for exceeding its timeout.
    pub timed_out: bool,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Builder for running external tools (git and friends).
pub struct Tool {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    cwd: Option<PathBuf>,
}

impl Tool {
    /// Create a new tool invocation.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout: None,
            cwd: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    /// Set a timeout for the subprocess.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run the tool from `dir`.
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Run the tool, capturing stdout and stderr.
    ///
    /// A timeout is reported as `ExitError::Timeout`; use [`ShellRunner`] when
    /// partial output of a timed-out process matters.
    pub fn run(&self) -> anyhow::Result<RunOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }

        let output = run_with_timeout(&mut cmd, self.timeout, &self.program)?;
        if output.timed_out {
            return Err(ExitError::Timeout {
                tool: self.program.clone(),
                timeout_secs: self.timeout.map_or(0, |t| t.as_secs()),
            }
            .into());
        }
        Ok(output)
    }

    /// Run the tool and return an error if it fails.
    pub fn run_ok(&self) -> anyhow::Result<RunOutput> {
        let output = self.run()?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            }
            .into())
        }
    }
}

/// Output of a command run through a [`CommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_ok: bool,
    pub timed_out: bool,
}

impl CommandOutput {
    /// stdout followed by stderr, for excerpting.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Executes shell command lines for verification gates.
///
/// Failures are values, not errors: a command that cannot be spawned,
/// exits non-zero or times out yields `exit_ok == false`.
pub trait CommandRunner {
    fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> CommandOutput;
}

/// Runs command lines through `sh -c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> CommandOutput {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(cwd);

        match run_with_timeout(&mut cmd, Some(timeout), "sh") {
            Ok(output) => CommandOutput {
                exit_ok: output.success(),
                timed_out: output.timed_out,
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Err(e) => {
                tracing::warn!(command, error = %e, "failed to spawn command");
                CommandOutput {
                    stdout: String::new(),
                    stderr: format!("{e:#}"),
                    exit_ok: false,
                    timed_out: false,
                }
            }
        }
    }
}

/// Spawn `cmd` with piped output and wait for it, killing it after `timeout`.
///
/// Output is drained on reader threads so a chatty process cannot block on a
/// full pipe, and whatever was captured before a kill is still returned.
fn run_with_timeout(
    cmd: &mut Command,
    timeout: Option<Duration>,
    tool_name: &str,
) -> anyhow::Result<RunOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::Error::from(ExitError::ToolNotFound {
                tool: tool_name.to_string(),
            })
        } else {
            anyhow::Error::new(e).context(format!("spawning {tool_name}"))
        }
    })?;

    let stdout = Capture::start(child.stdout.take());
    let stderr = Capture::start(child.stderr.take());

    let (exit_code, timed_out) = wait_child(&mut child, timeout, tool_name)?;

    // A killed shell can leave grandchildren holding the pipes open, so after
    // a timeout take what has been read so far instead of joining.
    let (stdout, stderr) = if timed_out {
        thread::sleep(Duration::from_millis(100));
        (Capture::snapshot(stdout.as_ref()), Capture::snapshot(stderr.as_ref()))
    } else {
        (Capture::finish(stdout), Capture::finish(stderr))
    };

    Ok(RunOutput {
        stdout,
        stderr,
        exit_code,
        timed_out,
    })
}

fn wait_child(
    child: &mut Child,
    timeout: Option<Duration>,
    tool_name: &str,
) -> anyhow::Result<(i32, bool)> {
    let Some(timeout) = timeout else {
        let status = child
            .wait()
            .with_context(|| format!("waiting for {tool_name}"))?;
        return Ok((status.code().unwrap_or(-1), false));
    };

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok((status.code().unwrap_or(-1), false)),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok((-1, true));
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("waiting for {tool_name}")));
            }
        }
    }
}

/// Output pipe drained on a background thread into a shared buffer.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl Capture {
    fn start<R: Read + Send + 'static>(source: Option<R>) -> Option<Self> {
        let mut source = source?;
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut b) = sink.lock() {
                            b.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        });
        Some(Self { buf, handle })
    }

    fn finish(capture: Option<Self>) -> String {
        let Some(capture) = capture else {
            return String::new();
        };
        let Self { buf, handle } = capture;
        let _ = handle.join();
        buf.lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }

    fn snapshot(capture: Option<&Self>) -> String {
        capture
            .and_then(|c| c.buf.lock().ok().map(|b| String::from_utf8_lossy(&b).into_owned()))
            .unwrap_or_default()
    }
}
