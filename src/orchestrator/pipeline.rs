//! Two cooperating processes run as one logical operation (`zfs send | zfs receive`).
//!
//! Both legs are always waited on and their stderr drained before `run` returns.
//! The operation succeeds only if every leg exits zero.

use crate::orchestrator::command::{drain, join_drain, kill_and_reap, wait_until, ToolCommand};
use crate::orchestrator::result_error::error::Error;
use crate::orchestrator::result_error::result::{convert_error_vec, Result};
use crate::orchestrator::result_error::AddMsg;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

/// Where the byte stream of the first stage ends up.
#[derive(Clone, Debug)]
pub enum PipelineSink {
    /// Redirect the stream into a file, created or truncated.
    File(PathBuf),
    /// Feed the stream into the stdin of a second process.
    Command(ToolCommand),
}

#[derive(Clone, Debug)]
pub struct SendReceivePipeline {
    send: ToolCommand,
    sink: PipelineSink,
}

impl SendReceivePipeline {
    pub fn new(send: ToolCommand, sink: PipelineSink) -> Self {
        Self { send, sink }
    }

    pub fn run(&self) -> Result<()> {
        match &self.sink {
            PipelineSink::File(path) => self.run_into_file(path),
            PipelineSink::Command(receive) => self.run_into_command(receive),
        }
    }

    fn run_into_file(&self, path: &Path) -> Result<()> {
        tracing::debug!("Running {} > {}", self.send, path.display());
        let file = File::create(path)
            .map_err(Error::from)
            .add_msg(format!("Failed to create stream target {}", path.display()))?;

        let mut send = self
            .send
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::from)
            .add_msg(format!("Failed to start {}", self.send.program_name()))?;

        let stderr = drain(send.stderr.take());
        match wait_until(&mut send, self.send.deadline())? {
            Some(status) => {
                let stderr = join_drain(stderr)?;
                convert_error_vec(leg_error(&self.send, status, stderr).into_iter().collect())
            }
            None => Err(self.send.timed_out()),
        }
    }

    fn run_into_command(&self, receive: &ToolCommand) -> Result<()> {
        tracing::debug!("Running {} | {}", self.send, receive);
        let mut send = self
            .send
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::from)
            .add_msg(format!("Failed to start {}", self.send.program_name()))?;
        let send_stderr = drain(send.stderr.take());

        // The receiving Command is dropped right after spawn so that the only read end
        // of the pipe lives in the receiver. The sender then sees EPIPE if it dies.
        let spawned = match send.stdout.take() {
            Some(stream) => {
                let mut command = receive.to_command();
                command
                    .stdin(Stdio::from(stream))
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
            }
            None => Err(std::io::Error::other("send stdout was not captured")),
        };

        let mut recv = match spawned {
            Ok(child) => child,
            Err(e) => {
                kill_and_reap(&mut send);
                let _ = join_drain(send_stderr);
                return Err(Error::from(e).add_msg(format!("Failed to start {}", receive.program_name())));
            }
        };
        let recv_stdout = drain(recv.stdout.take());
        let recv_stderr = drain(recv.stderr.take());

        let deadline = self.send.deadline().or_else(|| receive.deadline());
        let recv_status = wait_until(&mut recv, deadline);
        if !matches!(recv_status, Ok(Some(_))) {
            kill_and_reap(&mut send);
        }
        let send_status = wait_until(&mut send, deadline);

        let mut errors = Vec::new();
        match (send_status?, recv_status?) {
            (Some(send_status), Some(recv_status)) => {
                let send_stderr = join_drain(send_stderr);
                let recv_stderr = join_drain(recv_stderr);
                let _ = join_drain(recv_stdout);
                errors.extend(leg_error(&self.send, send_status, send_stderr?));
                errors.extend(leg_error(receive, recv_status, recv_stderr?));
            }
            // readers of a killed leg are not joined, a leftover helper may hold the pipe
            _ => errors.push(self.send.timed_out()),
        }

        convert_error_vec(errors).add_msg(format!(
            "{} | {} failed",
            self.send.program_name(),
            receive.program_name()
        ))
    }
}

fn leg_error(cmd: &ToolCommand, status: ExitStatus, stderr: Vec<u8>) -> Option<Error> {
    if status.success() {
        None
    } else {
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        tracing::error!("{} failed: {}", cmd.program_name(), stderr.trim());
        Some(Error::tool_failed(cmd.program_name(), status.code(), stderr))
    }
}
