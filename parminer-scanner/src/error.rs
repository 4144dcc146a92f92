use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Server error {status} from {url}")]
    ServerStatus { url: String, status: u16 },

    #[error("Renderer failed: {0}")]
    Render(String),

    #[error("Renderer setup failed: {0}")]
    Setup(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Other error: {0}")]
    Other(String),
}

impl ScanError {
    /// Whether the failure is worth retrying: timeouts, 5xx and connection errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ScanError::Timeout(_) | ScanError::ServerStatus { .. } => true,
            ScanError::HttpError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }

    /// Short machine-friendly label used in report error entries.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::HttpError(_) => "http",
            ScanError::InvalidUrl(_) => "invalid_url",
            ScanError::Timeout(_) => "timeout",
            ScanError::ServerStatus { .. } => "server_status",
            ScanError::Render(_) => "render",
            ScanError::Setup(_) => "setup",
            ScanError::ParseError(_) => "parse",
            ScanError::JoinError(_) => "join",
            ScanError::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_is_transient() {
        let err = ScanError::ServerStatus {
            url: "http://example.com/".to_string(),
            status: 503,
        };
        assert!(err.is_transient());
        assert_eq!(err.kind(), "server_status");
    }

    #[test]
    fn invalid_url_is_not_transient() {
        assert!(!ScanError::InvalidUrl("nope".to_string()).is_transient());
    }
}
