use thiserror::Error;

/// Engine-wide error taxonomy. Each variant maps to a distinct recovery
/// policy: configuration errors are fatal at startup, transient network
/// errors back off and retry, venue rejections abandon the opportunity,
/// partial-fill hazards trigger rollback, critical hazards are logged and
/// left for manual reconciliation, data-integrity errors discard the
/// offending payload and continue.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("venue rejected order: {0}")]
    VenueRejection(String),

    #[error("partial fill hazard on {group_id}: {detail}")]
    PartialFillHazard { group_id: String, detail: String },

    #[error("CRITICAL: {0}")]
    CriticalHazard(String),

    #[error("data integrity error: {0}")]
    DataIntegrity(String),
}

impl EngineError {
    /// Transient errors are safe to retry after backoff; everything else
    /// follows its own recovery path.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientNetwork(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            EngineError::TransientNetwork(e.to_string())
        } else {
            EngineError::VenueRejection(e.to_string())
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
