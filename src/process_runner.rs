//! External process execution with a hard deadline.
//!
//! Every toolchain call goes through [`ProcessRunner::run`]: the child is
//! spawned with piped output, polled until it exits or the deadline passes,
//! and a non-zero exit is turned into [`IcpError::Toolchain`] carrying the
//! captured stderr. There are no retries.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info_span, warn, Span};

use crate::error::{IcpError, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

enum ToolArg {
    Plain(OsString),
    Secret(SecretString),
}

/// Argument list for one toolchain invocation.
///
/// Secret arguments are passed to the child verbatim but rendered as
/// `pass:***` by `Display` and `Debug`.
#[derive(Default)]
pub struct ToolArgs {
    args: Vec<ToolArg>,
}

impl ToolArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(ToolArg::Plain(arg.as_ref().to_os_string()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(ToolArg::Plain(arg.as_ref().to_os_string()));
        }
        self
    }

    /// `flag <path>` pair.
    pub fn path(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).arg(path)
    }

    /// `flag pass:<password>` pair with the password kept secret.
    pub fn password(mut self, flag: &str, password: &SecretString) -> Self {
        self.args.push(ToolArg::Plain(OsString::from(flag)));
        self.args.push(ToolArg::Secret(SecretString::from(format!(
            "pass:{}",
            password.expose_secret()
        ))));
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn to_os_args(&self) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg {
                ToolArg::Plain(value) => value.clone(),
                ToolArg::Secret(secret) => OsString::from(secret.expose_secret()),
            })
            .collect()
    }
}

impl fmt::Display for ToolArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arg in &self.args {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match arg {
                ToolArg::Plain(value) => write!(f, "{}", value.to_string_lossy())?,
                ToolArg::Secret(_) => f.write_str("pass:***")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ToolArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ToolArgs({})", self)
    }
}

/// Captured result of a finished process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A running toolchain process.
pub struct ProcessHandle {
    operation: String,
    child: Child,
    started: Instant,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl ProcessHandle {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    fn collect(&mut self) -> (Vec<u8>, Vec<u8>) {
        let stdout = self
            .stdout
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let stderr = self
            .stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        (stdout, stderr)
    }

    /// Drop the reader threads without joining them. A descendant that
    /// outlived the child may still hold the pipes open.
    fn detach(&mut self) {
        self.stdout.take();
        self.stderr.take();
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// Spawns the external toolchain and waits for it with a deadline.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    span: Span,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        let program = program.into();
        let span = info_span!("process_runner", program = %program.display());
        Self {
            program,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            span,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the program with `args`; output is captured in the background.
    pub fn spawn(&self, operation: &str, args: &ToolArgs) -> Result<ProcessHandle> {
        let _entered = self.span.enter();
        debug!(operation, args = %args, "spawning toolchain");

        let mut child = Command::new(&self.program)
            .args(args.to_os_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| IcpError::Toolchain {
                operation: operation.to_string(),
                status: "not started".to_string(),
                stderr: format!("failed to start {}: {}", self.program.display(), e),
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        Ok(ProcessHandle {
            operation: operation.to_string(),
            child,
            started: Instant::now(),
            stdout,
            stderr,
        })
    }

    /// Poll `handle` until it exits, killing it once `timeout` has elapsed.
    pub fn wait(&self, mut handle: ProcessHandle, timeout: Duration) -> Result<ProcessOutput> {
        let _entered = self.span.enter();
        let deadline = handle.started + timeout;

        loop {
            let polled = handle
                .child
                .try_wait()
                .map_err(|e| IcpError::Toolchain {
                    operation: handle.operation.clone(),
                    status: "unknown".to_string(),
                    stderr: format!("failed to poll process: {}", e),
                })?;

            if let Some(status) = polled {
                let (stdout, stderr) = handle.collect();
                debug!(
                    operation = %handle.operation,
                    status = %status,
                    elapsed_ms = handle.started.elapsed().as_millis() as u64,
                    "toolchain finished"
                );
                return Ok(ProcessOutput {
                    status,
                    stdout,
                    stderr,
                });
            }

            if Instant::now() >= deadline {
                warn!(operation = %handle.operation, timeout_secs = timeout.as_secs(), "toolchain timed out, killing");
                let _ = handle.child.kill();
                let _ = handle.child.wait();
                handle.detach();
                return Err(IcpError::Timeout {
                    operation: handle.operation,
                    timeout,
                });
            }

            thread::sleep(self.poll_interval);
        }
    }

    /// Spawn, wait with the configured timeout and require a zero exit.
    pub fn run(&self, operation: &str, args: &ToolArgs) -> Result<ProcessOutput> {
        let handle = self.spawn(operation, args)?;
        let output = self.wait(handle, self.timeout)?;
        if !output.status.success() {
            let stderr = output.stderr_text();
            let _entered = self.span.enter();
            warn!(operation, status = %output.status, stderr = %stderr.trim_end(), "toolchain failed");
            return Err(IcpError::Toolchain {
                operation: operation.to_string(),
                status: output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |code| code.to_string()),
                stderr,
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn display_redacts_passwords() {
        let args = ToolArgs::new()
            .arg("ca")
            .path("-config", Path::new("/tmp/ca_ossl.cnf"))
            .password("-passin", &SecretString::from("hunter22"));
        let rendered = args.to_string();
        assert_eq!(rendered, "ca -config /tmp/ca_ossl.cnf -passin pass:***");
        assert!(!format!("{:?}", args).contains("hunter22"));
        assert_eq!(args.len(), 5);
        assert_eq!(args.to_os_args()[4], OsString::from("pass:hunter22"));
    }

    #[cfg(unix)]
    #[test]
    fn successful_run_captures_stdout() {
        let runner = ProcessRunner::new("sh", Duration::from_secs(10));
        let output = runner
            .run("echo", &ToolArgs::new().args(["-c", "printf hello"]))
            .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout_text(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_surfaces_stderr() {
        let runner = ProcessRunner::new("sh", Duration::from_secs(10));
        let err = runner
            .run(
                "failing step",
                &ToolArgs::new().args(["-c", "echo 'bad decrypt' >&2; exit 3"]),
            )
            .unwrap_err();
        match err {
            IcpError::Toolchain {
                operation,
                status,
                stderr,
            } => {
                assert_eq!(operation, "failing step");
                assert_eq!(status, "3");
                assert_eq!(stderr, "bad decrypt\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_the_process() {
        let runner = ProcessRunner::new("sh", Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(10));
        let started = Instant::now();
        let err = runner
            .run("sleep", &ToolArgs::new().args(["-c", "sleep 5"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn deadline_holds_when_a_grandchild_keeps_the_pipes() {
        let runner = ProcessRunner::new("sh", Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(10));
        let started = Instant::now();
        let err = runner
            .run("wrapper", &ToolArgs::new().args(["-c", "sleep 6; true"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn missing_program_is_a_toolchain_error() {
        let runner = ProcessRunner::new("/nonexistent/bin/openssl", Duration::from_secs(1));
        let err = runner.run("version", &ToolArgs::new().arg("version")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Toolchain);
        assert!(err.stderr().unwrap().contains("failed to start"));
    }
}
