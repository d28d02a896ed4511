use actix_web::{error::InternalError, http::StatusCode, web, HttpResponse};
use serde_json::json;
use thiserror::Error;

/// Failures reported by the hosted data/auth service. Callers never retry.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Rejected(String),
}

impl From<mongodb::error::Error> for BackendError {
    fn from(err: mongodb::error::Error) -> Self {
        BackendError::Unavailable(err.to_string())
    }
}

pub fn error_body(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "error": message.into() }))
}

/// Answers malformed JSON bodies with a 400 in the same error shape.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _request| {
        let response = error_body(StatusCode::BAD_REQUEST, err.to_string());
        InternalError::from_response(err, response).into()
    })
}
