use thiserror::Error;

/// Storage failures split into the two categories callers branch on:
/// `Unavailable` is retryable infrastructure trouble, `Invalid` means the
/// data itself was rejected and retrying cannot help.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage rejected data: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                rusqlite::ErrorCode::ConstraintViolation => StoreError::Invalid(err.to_string()),
                _ => StoreError::Unavailable(err.to_string()),
            },
            rusqlite::Error::ToSqlConversionFailure(_) | rusqlite::Error::FromSqlConversionFailure(..) => {
                StoreError::Invalid(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

impl From<postgres::Error> for StoreError {
    fn from(err: postgres::Error) -> Self {
        // SQLSTATE class 23 covers integrity constraint violations.
        let constraint = err
            .code()
            .map(|state| state.code().starts_with("23"))
            .unwrap_or(false);
        if constraint {
            StoreError::Invalid(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Malformed or incomplete result documents. Recorded per-item by the
/// sync orchestrator, never propagated out of a batch.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed result document: {0}")]
    Malformed(String),
    #[error("result document missing {0}")]
    Missing(&'static str),
}

impl From<roxmltree::Error> for ParseError {
    fn from(err: roxmltree::Error) -> Self {
        ParseError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_retryable_invalid_is_not() {
        assert!(StoreError::Unavailable("db locked".into()).is_retryable());
        assert!(!StoreError::Invalid("constraint".into()).is_retryable());
    }
}
