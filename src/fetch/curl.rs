//! `http://`, `https://` and `ftp://` sources through curl

use crate::error::{HoardError, HoardResult};
use crate::fetch::FetchBackend;
use crate::process::{with_retries, RetryPolicy, ToolCommand};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use tracing::info;
use url::Url;

/// curl exit codes worth another attempt: resolve and connect failures,
/// partial transfers, timeouts, TLS handshake errors, empty or failed
/// receives
const TRANSIENT_EXIT_CODES: &[i32] = &[5, 6, 7, 18, 28, 35, 52, 56];

/// `--fail` exit code for HTTP errors
const HTTP_ERROR_EXIT_CODE: i32 = 22;

/// Downloads with curl, retrying transient network failures
#[derive(Debug, Clone)]
pub struct CurlBackend {
    program: OsString,
    retry: RetryPolicy,
}

impl CurlBackend {
    /// Use `program` as the curl binary
    pub fn new(program: impl Into<OsString>, retry: RetryPolicy) -> Self {
        Self {
            program: program.into(),
            retry,
        }
    }

    /// The invocation that downloads `url` to `dest`
    pub fn command(&self, url: &Url, dest: &Path) -> ToolCommand {
        ToolCommand::new(&self.program)
            .args([
                "--fail",
                "--location",
                "--silent",
                "--show-error",
                "--connect-timeout",
                "30",
                "-o",
            ])
            .arg(dest)
            .arg(url.as_str())
    }
}

/// Whether a failed curl run should be retried
pub fn is_transient(err: &HoardError) -> bool {
    match err {
        HoardError::CommandExecution {
            code: Some(code),
            stderr,
            ..
        } => {
            TRANSIENT_EXIT_CODES.contains(code)
                // Server-side 5xx behind --fail.
                || (*code == HTTP_ERROR_EXIT_CODE && stderr.contains("error: 5"))
        }
        _ => false,
    }
}

#[async_trait]
impl FetchBackend for CurlBackend {
    fn name(&self) -> &'static str {
        "curl"
    }

    async fn fetch(&self, url: &Url, dest: &Path) -> HoardResult<()> {
        info!("Downloading {}", url);
        with_retries(self.retry, &format!("download of {}", url), is_transient, || {
            let cmd = self.command(url, dest);
            async move { cmd.run().await.map(|_| ()) }
        })
        .await
    }
}
