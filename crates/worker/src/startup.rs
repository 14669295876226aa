//! Startup checks for worker hosts.
//!
//! A worker that registers and then discovers its tools are missing wastes a
//! claim and an attempt on some file; checking before registration keeps
//! broken hosts out of the rotation entirely.

use thiserror::Error;
use tokio::process::Command;

/// Error type for startup checks.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The tool could not be executed at all.
    #[error("{tool} is not available: {source}")]
    ToolMissing {
        tool: &'static str,
        source: std::io::Error,
    },

    /// The tool ran but reported failure.
    #[error("{tool} --version exited with {status}")]
    ToolFailed {
        tool: &'static str,
        status: std::process::ExitStatus,
    },
}

/// Verify one external tool answers `-version`.
async fn check_tool(tool: &'static str) -> Result<(), StartupError> {
    let status = Command::new(tool)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|source| StartupError::ToolMissing { tool, source })?;
    if !status.success() {
        return Err(StartupError::ToolFailed { tool, status });
    }
    Ok(())
}

/// Run all startup checks: the encoder and the inspector must both answer.
pub async fn run_startup_checks() -> Result<(), StartupError> {
    check_tool("ffmpeg").await?;
    check_tool("ffprobe").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let err = check_tool("definitely-not-a-real-binary-name").await.unwrap_err();
        assert!(matches!(err, StartupError::ToolMissing { .. }));
        let message = err.to_string();
        assert!(message.contains("definitely-not-a-real-binary-name"));
    }
}
