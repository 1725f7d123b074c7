//! Access token recovery from a task's startup output
//!
//! Notebook-style images print a line such as
//! `http://127.0.0.1:8888/lab?token=3f1c9ab0...` when they start. The token is
//! never stored here; it is re-extracted from the log whenever asked for.

use std::sync::OnceLock;
use std::time::Duration;

use futures::AsyncReadExt;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::gateway::{ClusterGateway, GatewayError};

/// Upper bound on bytes drained from a log stream
pub const MAX_LOG_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Reading logs of '{name}' did not finish within {timeout:?}")]
    LogTimeout { name: String, timeout: Duration },

    #[error("Failed to read logs: {0}")]
    Io(#[from] std::io::Error),
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"token=([A-Za-z0-9]+)").expect("token pattern is valid"))
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Return the first `token=<alphanumeric run>` value in `log_text`, or an
/// empty string when none is present.
pub fn extract_token(log_text: &str) -> String {
    token_pattern()
        .captures(log_text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

/// Drain the full log of a workload unit, bounded in time and size, then
/// extract the token from it.
pub async fn recover_token(
    gateway: &dyn ClusterGateway,
    unit: &str,
    timeout: Duration,
) -> Result<String, CredentialError> {
    let drain = async {
        let stream = gateway.stream_logs(unit).await?;
        let mut bytes = Vec::new();
        stream.take(MAX_LOG_BYTES).read_to_end(&mut bytes).await?;
        Ok::<_, CredentialError>(bytes)
    };

    let bytes = tokio::time::timeout(timeout, drain)
        .await
        .map_err(|_| CredentialError::LogTimeout {
            name: unit.to_string(),
            timeout,
        })??;

    let text = String::from_utf8_lossy(&bytes);
    let token = extract_token(&text);
    debug!(
        unit,
        log_bytes = bytes.len(),
        found = !token.is_empty(),
        "Scanned logs for access token"
    );
    Ok(token)
}
