//! External command execution
//!
//! The remote backends and archive extraction drive black-box tools
//! (`curl`, `gsutil`, `tar`). This module runs them and maps failures
//! onto `HoardError`, with an optional linear-backoff retry loop.

use crate::error::{HoardError, HoardResult};
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// A fully specified external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    /// Program name or path
    pub program: OsString,
    /// Arguments, in order
    pub args: Vec<OsString>,
    /// Working directory, if not inherited
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    /// Create a command for `program` with no arguments
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in `dir`
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Arguments as lossy strings, for matching and display
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Shell-like rendering used in logs and errors
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args_lossy());
        parts.join(" ")
    }

    /// Run to completion, failing on a non-zero exit
    pub async fn run(&self) -> HoardResult<std::process::Output> {
        debug!("Executing: {}", self.display());

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| HoardError::command_failed(self.display(), e))?;

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HoardError::command_exec(
                self.display(),
                output.status.code(),
                stderr.trim(),
            ))
        }
    }
}

/// How often and how patiently to retry a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Base delay; the wait before retry N is N * sleep
    pub sleep: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(retries: u32, sleep: Duration) -> Self {
        Self { retries, sleep }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before the given 1-based retry
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.sleep * retry
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
///
/// Only errors that are retryable and accepted by `is_transient` trigger
/// another attempt; the last error is returned unchanged.
pub async fn with_retries<T, F, Fut, P>(
    policy: RetryPolicy,
    what: &str,
    is_transient: P,
    mut op: F,
) -> HoardResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HoardResult<T>>,
    P: Fn(&HoardError) -> bool,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retry < policy.retries && e.is_retryable() && is_transient(&e) => {
                retry += 1;
                let delay = policy.delay_for(retry);
                warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    what, e, retry, policy.retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
