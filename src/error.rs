use thiserror::Error;

/// Why a retrieval produced no content.
///
/// [`crate::retrieve::ContentRetriever::retrieve`] folds all of these into an
/// empty list; `try_retrieve` hands them to callers that need to tell an empty
/// catalog apart from an unreachable source.
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("spider error: {0}")]
    Spider(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("unsupported site: {0}")]
    Unsupported(String),

    #[error("unparseable response: {0}")]
    Parse(String),
}

impl RetrieveError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RetrieveError::Timeout(_))
    }
}
