use std::{any::Any, backtrace::Backtrace, panic::AssertUnwindSafe};

use async_trait::async_trait;
use axum::{extract::Request, http::StatusCode, response::Response};
use futures_util::FutureExt;
use serde::Deserialize;

use crate::{
    core::middleware::{Middleware, Next},
    utils::response::json_error,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryParams {
    /// Put the panic message into the response body
    pub expose_details: bool,
    /// Log a backtrace captured where the panic was caught
    pub stack_trace: bool,
}

impl Default for RecoveryParams {
    fn default() -> Self {
        Self {
            expose_details: false,
            stack_trace: true,
        }
    }
}

/// Turns a panic anywhere downstream into a 500 envelope.
pub struct RecoveryMiddleware {
    weight: i32,
    params: RecoveryParams,
}

impl RecoveryMiddleware {
    pub fn new(weight: i32, params: RecoveryParams) -> Self {
        Self { weight, params }
    }
}

#[async_trait]
impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match AssertUnwindSafe(next.run(req)).catch_unwind().await {
            Ok(response) => response,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                if self.params.stack_trace {
                    tracing::error!(
                        %method,
                        path,
                        backtrace = %Backtrace::force_capture(),
                        "Panic recovered: {}",
                        message
                    );
                } else {
                    tracing::error!(%method, path, "Panic recovered: {}", message);
                }
                let detail = if self.params.expose_details {
                    format!("An unexpected error occurred: {message}")
                } else {
                    "An unexpected error occurred".to_string()
                };
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", detail)
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
