//! Execution wrapper for invoking host tooling.
//!
//! Keeps process integration isolated so the tool wrappers stay testable
//! (fake binaries, deterministic stdout parsing). Key material only ever
//! travels over stdin, never argv.

use cryptainer_core::error::{CryptainerError, CryptainerResult};
use std::env;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ToolCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> CryptainerResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        if input.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn()?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload)?;
                stdin.flush().ok();
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> CryptainerResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        if exit_status.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CryptainerError::System(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        }

        let stdout = stdout_handle
            .join()
            .map_err(|_| CryptainerError::System("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| CryptainerError::System("stderr reader thread panicked".into()))??;

        let status = exit_status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);

        Ok(Output {
            stdout,
            stderr,
            status,
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<CryptainerResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> CryptainerResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

/// Prefer stderr, fall back to stdout; tools disagree on where they complain.
pub(crate) fn output_diagnostic(output: &Output) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();
    if !stderr.is_empty() {
        stderr.to_string()
    } else {
        stdout.to_string()
    }
}

/// Whether the tool rejected the action verb itself (old util-linux or
/// cryptsetup releases), meaning a legacy spelling should be retried.
pub(crate) fn action_unsupported(output: &Output) -> bool {
    let diagnostic = output_diagnostic(output).to_ascii_lowercase();
    diagnostic.contains("unknown action")
        || diagnostic.contains("unknown command")
        || diagnostic.contains("invalid action")
        || diagnostic.contains("invalid command")
        || diagnostic.contains("unknown option")
}

/// Locate a tool, preferring explicit config, then `PATH`, then well-known
/// sbin locations.
pub(crate) fn resolve_binary(
    configured: Option<&str>,
    defaults: &[&str],
    name: &str,
) -> CryptainerResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|value| !value.is_empty()) {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(CryptainerError::InvalidConfig(format!(
            "{name} binary configured at {} but missing",
            candidate.display()
        )));
    }

    if let Some(path) = find_in_path(name) {
        return Ok(path);
    }

    for candidate in defaults {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    Err(CryptainerError::InvalidConfig(format!(
        "unable to locate {name} binary; tried PATH and {defaults:?}"
    )))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
