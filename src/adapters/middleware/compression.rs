use std::io::Write;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use flate2::{
    Compression,
    write::{DeflateEncoder, GzEncoder},
};
use http_body_util::BodyExt;
use serde::Deserialize;

use crate::{
    core::middleware::{Middleware, Next},
    metrics,
    utils::response::internal_error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Brotli,
    Gzip,
    Deflate,
}

impl Algorithm {
    pub fn token(self) -> &'static str {
        match self {
            Algorithm::Brotli => "br",
            Algorithm::Gzip => "gzip",
            Algorithm::Deflate => "deflate",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "br" => Some(Algorithm::Brotli),
            "gzip" | "x-gzip" => Some(Algorithm::Gzip),
            "deflate" => Some(Algorithm::Deflate),
            _ => None,
        }
    }

    fn encode(self, data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
        match self {
            Algorithm::Brotli => {
                let mut writer =
                    brotli::CompressorWriter::new(Vec::new(), 4096, level.min(11), 22);
                writer.write_all(data)?;
                writer.flush()?;
                Ok(writer.into_inner())
            }
            Algorithm::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
                encoder.write_all(data)?;
                encoder.finish()
            }
            Algorithm::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level.min(9)));
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionParams {
    /// Smallest body worth compressing, in bytes
    pub threshold: usize,
    pub level: u32,
    /// Media types eligible for compression; a trailing `*` matches a prefix
    pub allowed_types: Vec<String>,
    /// Compressed output must save at least this fraction of the input
    pub min_ratio: f64,
    /// Server preference used when the client weighs codings equally
    pub algorithms: Vec<String>,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self {
            threshold: 1024,
            level: 6,
            allowed_types: [
                "application/json",
                "application/xml",
                "application/javascript",
                "text/*",
                "application/rss+xml",
                "application/atom+xml",
            ]
            .map(String::from)
            .to_vec(),
            min_ratio: 0.05,
            algorithms: ["br", "gzip", "deflate"].map(String::from).to_vec(),
        }
    }
}

pub struct CompressionMiddleware {
    weight: i32,
    params: CompressionParams,
    preference: Vec<Algorithm>,
}

impl CompressionMiddleware {
    pub fn new(weight: i32, params: CompressionParams) -> Self {
        let mut preference: Vec<Algorithm> = params
            .algorithms
            .iter()
            .filter_map(|a| Algorithm::parse(a))
            .collect();
        preference.dedup();
        if preference.is_empty() {
            preference = vec![Algorithm::Brotli, Algorithm::Gzip, Algorithm::Deflate];
        }
        Self {
            weight,
            params,
            preference,
        }
    }

    /// Highest-q coding the server supports; server preference breaks ties.
    pub fn negotiate(&self, accept_encoding: &str) -> Option<Algorithm> {
        let mut wildcard: Option<f32> = None;
        let mut weights: Vec<(Algorithm, f32)> = Vec::new();
        for item in accept_encoding.split(',') {
            let mut pieces = item.split(';');
            let coding = pieces.next().unwrap_or_default().trim();
            let q = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if coding == "*" {
                wildcard = Some(q);
            } else if let Some(algorithm) = Algorithm::parse(coding) {
                weights.push((algorithm, q));
            }
        }

        let mut best: Option<(Algorithm, f32)> = None;
        for algorithm in &self.preference {
            let q = weights
                .iter()
                .find(|(a, _)| a == algorithm)
                .map(|(_, q)| *q)
                .or(wildcard)
                .unwrap_or(0.0);
            if q > 0.0 && best.is_none_or(|(_, best_q)| q > best_q) {
                best = Some((*algorithm, q));
            }
        }
        best.map(|(algorithm, _)| algorithm)
    }

    fn type_allowed(&self, headers: &HeaderMap) -> bool {
        let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.params.allowed_types.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            match pattern.strip_suffix('*') {
                Some(prefix) => essence.starts_with(prefix),
                None => essence == pattern,
            }
        })
    }
}

#[async_trait]
impl Middleware for CompressionMiddleware {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let algorithm = req
            .headers()
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| self.negotiate(v));
        let response = next.run(req).await;
        let Some(algorithm) = algorithm else {
            return response;
        };

        let status = response.status();
        if status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || response.headers().contains_key(header::CONTENT_ENCODING)
            || !self.type_allowed(response.headers())
        {
            metrics::increment_compression(algorithm.token(), "skipped");
            return response;
        }

        let (mut parts, body) = response.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::error!("Failed to read response body for compression: {}", e);
                return internal_error("Failed to read response body");
            }
        };
        if bytes.len() < self.params.threshold {
            metrics::increment_compression(algorithm.token(), "skipped");
            return Response::from_parts(parts, Body::from(bytes));
        }

        let compressed = match algorithm.encode(&bytes, self.params.level) {
            Ok(compressed) => compressed,
            Err(e) => {
                tracing::warn!(algorithm = algorithm.token(), "Compression failed: {}", e);
                metrics::increment_compression(algorithm.token(), "error");
                return Response::from_parts(parts, Body::from(bytes));
            }
        };
        let saved = 1.0 - compressed.len() as f64 / bytes.len() as f64;
        if saved < self.params.min_ratio {
            metrics::increment_compression(algorithm.token(), "ineffective");
            return Response::from_parts(parts, Body::from(bytes));
        }

        metrics::increment_compression(algorithm.token(), "compressed");
        parts.headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(algorithm.token()),
        );
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(compressed.len()));
        parts
            .headers
            .append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        Response::from_parts(parts, Body::from(Bytes::from(compressed)))
    }
}
