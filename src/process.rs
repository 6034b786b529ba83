//! External command runner with timeouts and interrupt handling.
//!
//! Every tool invocation (git, the environment manager, the installer, the
//! resolver, the notebook runner, tar) goes through [`run`]. The child runs in
//! its own process group so a timeout or operator interrupt kills the whole
//! tree, and output is drained on reader threads so large outputs never block
//! the child on a full pipe.
use crate::interrupt;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Description of one child process to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            timeout,
        }
    }

    /// Build from a configured tool command line (which may carry its own
    /// leading arguments) followed by `args`.
    pub fn tool<S: AsRef<str>>(tool: &str, args: &[S], timeout: Duration) -> Result<Self> {
        let mut argv =
            shell_words::split(tool).with_context(|| format!("parse tool command: {tool}"))?;
        if argv.is_empty() {
            return Err(anyhow!("tool command is empty"));
        }
        argv.extend(args.iter().map(|arg| arg.as_ref().to_string()));
        Ok(Self::new(argv, timeout))
    }

    pub fn current_dir(mut self, cwd: &Path) -> Self {
        self.cwd = Some(cwd.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn display(&self) -> String {
        shell_words::join(&self.argv)
    }
}

/// Captured result of a finished (or killed) child.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub interrupted: bool,
    pub duration_ms: u128,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.interrupted && self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, the way a terminal would have shown them.
    pub fn combined_output(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }

    /// Short human description of why the command did not succeed.
    pub fn failure_reason(&self) -> String {
        if self.interrupted {
            "interrupted".to_string()
        } else if self.timed_out {
            format!("timed out after {} ms", self.duration_ms)
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "killed by signal".to_string(),
            }
        }
    }
}

/// Run a child process to completion, a timeout, or an operator interrupt.
///
/// Failure to spawn is an `Err`; every other outcome (including nonzero exit
/// and timeout) is reported through [`CommandOutcome`].
pub fn run(spec: &CommandSpec) -> Result<CommandOutcome> {
    let program = spec
        .argv
        .first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    if interrupt::requested() {
        return Ok(CommandOutcome {
            argv: spec.argv.clone(),
            exit_code: None,
            timed_out: false,
            interrupted: true,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    let mut cmd = Command::new(program);
    cmd.args(&spec.argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    tracing::debug!(command = %spec.display(), "spawn");
    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", spec.display()))?;
    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    let mut timed_out = false;
    let mut interrupted = false;
    let status = loop {
        if let Some(status) = child.try_wait().context("check child status")? {
            break status;
        }
        if start.elapsed() > spec.timeout {
            timed_out = true;
        } else if interrupt::requested() {
            interrupted = true;
        }
        if timed_out || interrupted {
            kill_group(child.id());
            let _ = child.kill();
            break child.wait().context("reap killed child")?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);
    let duration_ms = start.elapsed().as_millis();
    tracing::debug!(
        command = %spec.display(),
        exit_code = ?status.code(),
        timed_out,
        interrupted,
        duration_ms,
        "child finished"
    );

    Ok(CommandOutcome {
        argv: spec.argv.clone(),
        exit_code: status.code(),
        timed_out,
        interrupted,
        duration_ms,
        stdout,
        stderr,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn kill_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: signalling our own child's process group.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
