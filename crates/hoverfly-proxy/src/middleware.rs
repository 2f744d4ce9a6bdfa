//! Middleware invocation.
//!
//! A middleware is a synchronous request/response transform. The default
//! implementation runs a command through `sh -c`, writes the JSON
//! [`Payload`] to its stdin and parses the transformed payload from stdout.

use crate::models::Payload;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Middleware failures
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    #[error("middleware is not configured")]
    NotConfigured,
    #[error("failed to run middleware: {0}")]
    Io(#[from] std::io::Error),
    #[error("middleware timed out after {0:?}")]
    Timeout(Duration),
    #[error("middleware exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("middleware returned invalid payload: {0}")]
    InvalidOutput(#[from] serde_json::Error),
    #[error("middleware did not return a response")]
    MissingResponse,
}

/// Request/response transform contract
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Identifier used in logs and error responses
    fn name(&self) -> &str;

    async fn transform(&self, payload: Payload) -> Result<Payload, MiddlewareError>;
}

/// Middleware backed by an external command
pub struct CommandMiddleware {
    command: String,
    timeout: Duration,
}

impl CommandMiddleware {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Middleware for CommandMiddleware {
    fn name(&self) -> &str {
        &self.command
    }

    async fn transform(&self, payload: Payload) -> Result<Payload, MiddlewareError> {
        let input = serde_json::to_vec(&payload)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        // stdin is closed once the payload is written so the command sees EOF
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&input).await {
                Ok(()) => Ok(()),
                // The command may legitimately ignore its input
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Middleware closed stdin before reading the payload");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        // Output is drained while the payload is still being written
        let run = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| MiddlewareError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(MiddlewareError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}
