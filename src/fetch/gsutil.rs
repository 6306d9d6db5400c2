//! `gs://` sources through gsutil

use crate::error::{HoardError, HoardResult};
use crate::fetch::FetchBackend;
use crate::process::{with_retries, RetryPolicy, ToolCommand};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

/// Failures that will not go away on retry
const PERMANENT_ERRORS: &[&str] = &[
    "PreconditionException",
    "412 Precondition Failed",
    "CommandException: No URLs matched",
    "NotFoundException:",
    "One or more URLs matched no objects",
];

/// Interrupted resumable transfers and flaky TLS
const RESUMABLE_ERRORS: &[&str] = &[
    "Too many resumable download attempts failed without progress",
    "Too many resumable upload attempts failed without progress",
    "ResumableUploadException",
    "ResumableUploadAbortException",
    "ResumableDownloadException",
    "ssl.SSLError: The read operation timed out",
    "ssl.SSLError: ('The read operation timed out',)",
    "ssl.SSLError: _ssl.c:495: The handshake operation timed out",
    "Unable to find the server",
    "doesn't match cloud-supplied digest",
    "ssl.SSLError: [Errno 8]",
    "EOF occurred in violation of protocol",
    "AccessDeniedException",
];

/// Server-side and credential hiccups seen in practice
const TRANSIENT_ERRORS: &[&str] = &[
    "ServiceException: 5",
    "Failure: No JSON object could be decoded",
    "Oauth 2.0 User Account",
    "InvalidAccessKeyId",
    "socket.error: [Errno 104] Connection reset by peer",
    "Received bad request from server",
    "can't start new thread",
    "OSError: None",
    "cannot read from timed out object",
];

/// Copies objects out of Google Cloud Storage with gsutil
#[derive(Debug, Clone)]
pub struct GsutilBackend {
    program: OsString,
    retry: RetryPolicy,
}

impl GsutilBackend {
    /// Use `program` as the gsutil binary
    pub fn new(program: impl Into<OsString>, retry: RetryPolicy) -> Self {
        Self {
            program: program.into(),
            retry,
        }
    }

    /// The invocation that copies `url` to `dest`
    pub fn command(&self, url: &Url, dest: &Path) -> ToolCommand {
        ToolCommand::new(&self.program)
            .args(["-o", "Boto:num_retries=10", "cp", "-v", "--", url.as_str()])
            .arg(dest)
    }
}

/// Whether a failed gsutil run should be retried.
///
/// Runs killed by a signal report no exit code and are never retried.
pub fn is_transient(err: &HoardError) -> bool {
    let HoardError::CommandExecution {
        code: Some(_),
        stderr,
        ..
    } = err
    else {
        return false;
    };

    if PERMANENT_ERRORS.iter().any(|m| stderr.contains(m)) {
        return false;
    }
    if let Some(m) = RESUMABLE_ERRORS
        .iter()
        .chain(TRANSIENT_ERRORS)
        .find(|m| stderr.contains(*m))
    {
        warn!("gsutil reported a retryable error: {}", m);
        return true;
    }
    false
}

#[async_trait]
impl FetchBackend for GsutilBackend {
    fn name(&self) -> &'static str {
        "gsutil"
    }

    async fn fetch(&self, url: &Url, dest: &Path) -> HoardResult<()> {
        info!("Copying {}", url);
        with_retries(self.retry, &format!("copy of {}", url), is_transient, || {
            let cmd = self.command(url, dest);
            async move { cmd.run().await.map(|_| ()) }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn exec_err(stderr: &str) -> HoardError {
        HoardError::command_exec("gsutil cp", Some(1), stderr)
    }

    #[test]
    fn command_shape() {
        let backend = GsutilBackend::new("gsutil", RetryPolicy::default());
        let url = Url::parse("gs://bucket/dir/object").unwrap();
        let cmd = backend.command(&url, Path::new("/stage/content"));
        assert_eq!(
            cmd.args_lossy(),
            vec![
                "-o",
                "Boto:num_retries=10",
                "cp",
                "-v",
                "--",
                "gs://bucket/dir/object",
                "/stage/content"
            ]
        );
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&exec_err("ServiceException: 503 Backend Error")));
        assert!(is_transient(&exec_err(
            "ResumableDownloadException: Transfer failed"
        )));
        assert!(!is_transient(&exec_err(
            "CommandException: No URLs matched: gs://bucket/missing"
        )));
        assert!(!is_transient(&exec_err(
            "ResumableUploadAbortException: 412 Precondition Failed"
        )));
        assert!(!is_transient(&exec_err("something unexpected")));
        assert!(!is_transient(&HoardError::command_exec(
            "gsutil cp",
            None,
            "ServiceException: 503"
        )));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copies_via_tool() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = crate::fetch::fake_tool(dir.path(), "gsutil", r#"printf '%s' "$6" > "$7""#);
        let backend = GsutilBackend::new(tool, RetryPolicy::none());

        let dest = dir.path().join("out");
        backend
            .fetch(&Url::parse("gs://bucket/object").unwrap(), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "gs://bucket/object");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_object_not_retried() {
        let dir = tempfile::TempDir::new().unwrap();
        let counter = dir.path().join("attempts");
        let body = format!(
            r#"echo x >> "{}"
echo "CommandException: No URLs matched: $6" >&2
exit 1"#,
            counter.display()
        );
        let tool = crate::fetch::fake_tool(dir.path(), "gsutil", &body);
        let backend = GsutilBackend::new(tool, RetryPolicy::new(3, Duration::ZERO));

        let err = backend
            .fetch(
                &Url::parse("gs://bucket/missing").unwrap(),
                &dir.path().join("out"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No URLs matched"));
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 1);
    }
}
