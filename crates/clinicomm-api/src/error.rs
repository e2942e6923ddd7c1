//! JSON error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clinicomm_common::Error;
use serde_json::json;
use tracing::error;

/// Core error rendered as `{"error": {"code", "message"}}`
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "Request failed");
        }

        let mut body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        if let Error::Render(names) = &self.0 {
            body["error"]["missing_variables"] = json!(names);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_status_codes() {
        let cases = [
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Render(vec!["price".into()]), StatusCode::UNPROCESSABLE_ENTITY),
            (Error::SchedulerUnavailable("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::InvalidTransition("sent".into()), StatusCode::CONFLICT),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).into_response().status(), expected);
        }
    }
}
