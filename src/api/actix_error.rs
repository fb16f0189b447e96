//! Actix Web error adapter for supervisor errors.

use crate::error::Error;
use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code)
            .content_type("application/json")
            .json(json!({
                "success": false,
                "error": self.to_string(),
                "code": status_code.as_u16()
            }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::ServerNotFound(_) => StatusCode::NOT_FOUND,
            Error::ServerDisabled(_) => StatusCode::CONFLICT,
            Error::AlreadyStarting(_) => StatusCode::CONFLICT,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::ScriptMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            Error::ConfigParse(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
