//! Non-interactive invocation of external backup tools.
//!
//! Every adapter builds a [`ToolCommand`] instead of touching `std::process::Command`
//! directly, so secrets, timeouts and output draining are handled in one place.

use crate::orchestrator::redacted::RedactedString;
use crate::orchestrator::result_error::error::Error;
use crate::orchestrator::result_error::result::Result;
use crate::orchestrator::result_error::AddMsg;
use itertools::Itertools;
use std::ffi::{OsStr, OsString};
use std::fmt::{Display, Formatter};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    secret: Option<(String, RedactedString)>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

/// Captured result of a finished tool process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    fn new(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }

    /// stdout followed by stderr, some tools print their statistics on stderr
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

impl ToolCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            secret: None,
            current_dir: None,
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Passes a secret to the child through the variable `name`, never through argv.
    pub fn secret_env<S: Into<String>>(mut self, name: S, secret: Option<&RedactedString>) -> Self {
        self.secret = secret.map(|s| (name.into(), s.clone()));
        self
    }

    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));
        if let Some((name, secret)) = &self.secret {
            command.env(name, secret.expose());
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        own_process_group(&mut command);
        command
    }

    /// Runs the tool to completion and returns its output whatever the exit code.
    ///
    /// Fails only when the process cannot be started, waited on, or exceeds its timeout.
    pub fn output(&self) -> Result<ToolOutput> {
        tracing::debug!("Running {}", self);
        let mut child = self
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::from)
            .add_msg(format!("Failed to start {}", self.program_name()))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        // On timeout the readers are left behind, they end once the last pipe holder exits
        match wait_until(&mut child, self.deadline())? {
            Some(status) => Ok(ToolOutput::new(status, join_drain(stdout)?, join_drain(stderr)?)),
            None => Err(self.timed_out()),
        }
    }

    /// Like [`ToolCommand::output`] but a non-zero exit becomes [`Error::ToolFailed`].
    pub fn run(&self) -> Result<ToolOutput> {
        let output = self.output()?;
        if output.success {
            Ok(output)
        } else {
            tracing::error!("{} failed: {}", self.program_name(), output.stderr.trim());
            Err(Error::tool_failed(
                self.program_name(),
                output.code,
                output.stderr,
            ))
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    pub(crate) fn timed_out(&self) -> Error {
        let timeout = self.timeout.unwrap_or_default();
        tracing::error!("{} timed out after {:?}", self.program_name(), timeout);
        Error::tool_timed_out(self.program_name(), timeout)
    }
}

impl Display for ToolCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            self.program.display(),
            self.args.iter().map(|a| a.to_string_lossy()).join(" ")
        )?;
        if let Some(dir) = &self.current_dir {
            write!(f, " (in {})", dir.display())?;
        }
        Ok(())
    }
}

pub(crate) fn drain<R: Read + Send + 'static>(
    reader: Option<R>,
) -> Option<JoinHandle<std::io::Result<Vec<u8>>>> {
    reader.map(|mut r| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

pub(crate) fn join_drain(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>> {
    match handle {
        None => Ok(Vec::new()),
        Some(h) => h
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("output reader thread panicked")))
            .map_err(Error::from),
    }
}

/// Waits for `child`, killing it once `deadline` passes. `None` means it was killed.
pub(crate) fn wait_until(child: &mut Child, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return Ok(Some(child.wait()?));
    };

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            kill_and_reap(child);
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Puts the tool in a new process group so a timeout can take its helpers down with it.
#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// Must only be called before `child` is reaped, its pid is the group id.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!("killpg {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Best effort: the process may already be gone.
pub(crate) fn kill_and_reap(child: &mut Child) {
    kill_process_group(child);
    if let Err(e) = child.kill() {
        tracing::debug!("kill {} failed: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!("reaping {} failed: {}", child.id(), e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh").args(["-c", script])
    }

    #[test]
    fn test_output_captures_both_streams_and_exit_code() {
        let output = sh("echo out; echo err >&2; exit 3").output().unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.success);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[test]
    fn test_run_converts_non_zero_exit_into_tool_failed() {
        let err = sh("echo 'repository locked' >&2; exit 1").run().unwrap_err();
        match err {
            Error::ToolFailed { program, code, stderr } => {
                assert_eq!(program, "sh");
                assert_eq!(code, Some(1));
                assert_eq!(stderr.trim(), "repository locked");
            }
            e => panic!("Expected ToolFailed, got {e}"),
        }
    }

    #[test]
    fn test_secret_only_reaches_child_environment() {
        let secret = RedactedString::new("p4ssw0rd");
        let cmd = sh("printf %s \"$TEST_REPO_PASSWORD\"").secret_env("TEST_REPO_PASSWORD", Some(&secret));

        assert!(!cmd.to_string().contains("p4ssw0rd"));
        assert!(!format!("{:?}", cmd).contains("p4ssw0rd"));
        assert_eq!(cmd.run().unwrap().stdout, "p4ssw0rd");
    }

    #[test]
    fn test_plain_env_is_passed() {
        let output = sh("printf %s \"$RESTIC_REPOSITORY\"")
            .env("RESTIC_REPOSITORY", "/srv/repo")
            .run()
            .unwrap();
        assert_eq!(output.stdout, "/srv/repo");
    }

    #[test]
    fn test_current_dir_applies_to_child_only() {
        let dir = TempDir::new().unwrap();
        let before = std::env::current_dir().unwrap();
        let output = ToolCommand::new("pwd").current_dir(dir.path()).run().unwrap();

        let reported = std::fs::canonicalize(output.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn test_timeout_kills_the_tool() {
        let started = Instant::now();
        let err = sh("exec sleep 5")
            .timeout(Some(Duration::from_millis(100)))
            .output()
            .unwrap_err();

        assert!(matches!(err, Error::ToolTimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_holds_when_tool_leaves_a_child_behind() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("done");
        let started = Instant::now();
        let err = sh(&format!("sleep 1; touch '{}'; echo done", marker.display()))
            .timeout(Some(Duration::from_millis(100)))
            .output()
            .unwrap_err();

        assert!(matches!(err, Error::ToolTimedOut { .. }));
        assert!(started.elapsed() < Duration::from_millis(900), "{:?}", started.elapsed());

        // the whole group is killed, the shell never gets to run `touch`
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn test_missing_program_is_an_error_not_a_panic() {
        let err = ToolCommand::new("/nonexistent/restic").output().unwrap_err();
        assert!(err.to_string().contains("Failed to start restic"));
    }
}
