use tracing::warn;

/// Error taxonomy shared by the collector pipeline, storage backends and the
/// query service. The kind decides retry and surfacing behavior: `Transient`
/// errors may be retried with bounded backoff, `Permanent` errors surface
/// immediately, `Validation` errors become 400 responses and `Config` errors
/// are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("response body exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },
}

impl MonitorError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MonitorError::Transient(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        MonitorError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        MonitorError::Config(msg.into())
    }
}

impl From<sqlx::Error> for MonitorError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            // Lock contention and pool exhaustion clear on their own.
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                MonitorError::Transient(e.to_string())
            }
            sqlx::Error::Database(db) => {
                let msg = db.message().to_lowercase();
                if msg.contains("locked") || msg.contains("busy") || msg.contains("deadlock") {
                    MonitorError::Transient(e.to_string())
                } else {
                    MonitorError::Permanent(e.to_string())
                }
            }
            _ => MonitorError::Permanent(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            MonitorError::Transient(e.to_string())
        } else {
            MonitorError::Permanent(e.to_string())
        }
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted => MonitorError::Transient(e.to_string()),
            _ => MonitorError::Permanent(e.to_string()),
        }
    }
}

/// Run `op` with up to `max_retries` additional attempts on retryable errors.
/// Backoff is a flat short sleep — storage contention on a monitoring tick
/// either clears within a couple hundred milliseconds or not at all.
pub async fn with_retries<T, F, Fut>(
    context: &str,
    max_retries: u32,
    mut op: F,
) -> Result<T, MonitorError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, MonitorError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(context, attempt, error = %e, "Retrying after transient error");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
