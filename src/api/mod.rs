pub mod repos;
pub mod search;
pub mod sync;

use axum::http::StatusCode;

use crate::error::Error;

/// Map an engine error onto the status code and message a client sees.
pub fn error_response(err: Error) -> (StatusCode, String) {
    let status = match &err {
        Error::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        Error::ConcurrentSyncRejected => StatusCode::CONFLICT,
        Error::SourceUnavailable(_) | Error::EmbeddingFailure(_) => StatusCode::BAD_GATEWAY,
        Error::IndexCorruption(_) | Error::Storage(_) => {
            tracing::error!("{} error: {err:#}", err.kind());
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::InvalidQuery("empty".into()), StatusCode::BAD_REQUEST),
            (Error::ConcurrentSyncRejected, StatusCode::CONFLICT),
            (Error::SourceUnavailable("down".into()), StatusCode::BAD_GATEWAY),
            (Error::EmbeddingFailure("timeout".into()), StatusCode::BAD_GATEWAY),
            (Error::IndexCorruption("orphan".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (anyhow::anyhow!("disk").into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(err).0, expected);
        }
    }

    #[test]
    fn test_message_is_error_display() {
        let (_, body) = error_response(Error::InvalidQuery("query is empty".into()));
        assert_eq!(body, "invalid query: query is empty");
    }
}
