// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::retry::Retryable;

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Sub-process runner used by the source-code scanners and the git
/// downloader.
///
/// Arguments are passed as a vector, never through a shell, and every run is
/// bounded by a timeout. A process that outlives its timeout is killed and
/// reported as [`ExecError::TimedOut`].
#[derive(Debug, Clone)]
pub struct Exec {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` killed after exceeding the {timeout:?} timeout")]
    TimedOut { program: String, timeout: Duration },
    #[error("`{program}` exited with status {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl Retryable for ExecError {
    fn is_retryable(&self) -> bool {
        // A timed out scanner may succeed on a quieter machine; a spawn
        // failure or a non-zero exit will not.
        matches!(self, ExecError::TimedOut { .. })
    }
}

impl Exec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(&self) -> Result<ExecOutput, ExecError> {
        debug!(program = %self.program, args = ?self.args, "spawning sub-process");
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(current_dir) = &self.current_dir {
            command.current_dir(current_dir);
        }
        let child = command.spawn().map_err(|source| ExecError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::TimedOut {
                program: self.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| ExecError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(ExecError::NonZeroExit {
                program: self.program.clone(),
                code: output.status.code(),
                stdout,
                stderr,
            });
        }
        Ok(ExecOutput { stdout, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let output = Exec::new("echo").arg("hello").run().await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_is_typed() {
        let error = Exec::new("false").run().await.unwrap_err();
        match error {
            ExecError::NonZeroExit { code, .. } => assert_eq!(code, Some(1)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_exec_times_out_and_kills() {
        let error = Exec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50))
            .run()
            .await
            .unwrap_err();
        match &error {
            ExecError::TimedOut { timeout, .. } => {
                assert_eq!(*timeout, Duration::from_millis(50))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_exec_spawn_failure() {
        let error = Exec::new("definitely-not-a-real-binary").run().await.unwrap_err();
        assert!(matches!(error, ExecError::Spawn { .. }));
    }
}
