use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sentra_core::error::{ApiError, codes};

/// Internal error type that converts to structured JSON responses.
/// Admission decisions never surface through here — denial is a policy
/// outcome, not an error; this covers origin and plumbing failures only.
#[derive(Debug)]
pub enum AppError {
    /// The origin could not be reached or returned a transport error (502)
    Origin(reqwest::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Origin(err) => {
                tracing::error!(error = %err, "origin request failed");
                (
                    StatusCode::BAD_GATEWAY,
                    ApiError {
                        error: codes::BAD_GATEWAY.to_string(),
                        message: "The origin service could not be reached".to_string(),
                        retry_after_seconds: None,
                        blocked: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}
