//! JSON response helpers for the `{"error": .., "message": ..}` envelope.
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

/// `{"error": error, "message": message}` with `status`.
pub fn json_error(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    json_response(
        status,
        json!({
            "error": error,
            "message": message.into(),
        }),
    )
}

pub fn json_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, "Not Found", message)
}

pub fn internal_error(message: impl Into<String>) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", message)
}

pub fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, "Bad Request", message)
}

pub fn unauthorized(message: impl Into<String>) -> Response {
    json_error(StatusCode::UNAUTHORIZED, "Unauthorized", message)
}

pub fn service_unavailable(message: impl Into<String>) -> Response {
    json_error(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable", message)
}

/// Ensure the response advertises JSON even when built by hand.
pub fn with_json_content_type(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn test_json_error_envelope() {
        let response = json_error(StatusCode::FORBIDDEN, "CORS policy violation", "Origin not allowed");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "CORS policy violation");
        assert_eq!(value["message"], "Origin not allowed");
    }

    #[test]
    fn test_not_found_status() {
        assert_eq!(not_found("missing").status(), StatusCode::NOT_FOUND);
    }
}
