use axum::extract::rejection::JsonRejection;
use axum::extract::FromRequest;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use easel_core::ErrorKind;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] easel_core::Error),
    #[error("{0}")]
    Image(String),
    #[error(transparent)]
    Json(#[from] JsonRejection),
    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Engine(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::Unavailable => StatusCode::NOT_IMPLEMENTED,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Image(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Self::Engine(e) => e.tag(),
            Self::Image(_) => "invalid_image",
            Self::Json(_) => "invalid_body",
            Self::Encode(_) => "encode",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            Self::Json(rejection) => rejection.body_text(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            error!(%status, "{detail}");
        } else {
            warn!(%status, "{detail}");
        }
        let body = ErrorBody {
            error: self.tag(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}

/// `Json` whose rejections become 400 responses in the common error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (easel_core::Error::validation("bad"), StatusCode::BAD_REQUEST),
            (
                easel_core::Error::UnexpectedOutput("none".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                easel_core::Error::CapabilityUnavailable("face restoration".to_string()),
                StatusCode::NOT_IMPLEMENTED,
            ),
            (
                easel_core::Error::Generation(anyhow::anyhow!("out of memory")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }
}
