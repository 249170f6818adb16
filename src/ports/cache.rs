use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    #[error("cache key is empty")]
    KeyEmpty,

    #[error("cache value invalid: {0}")]
    ValueInvalid(String),
}

/// A response stored by the cache stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    #[serde(with = "body_base64")]
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
}

impl CachedResponse {
    pub fn to_bytes(&self) -> Result<Bytes, CacheError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CacheError::ValueInvalid(e.to_string()))
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(raw).map_err(|e| CacheError::ValueInvalid(e.to_string()))
    }
}

mod body_base64 {
    use super::*;

    pub fn serialize<S: serde::Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Key/value cache with revision-based dependency invalidation.
///
/// `build_cache_key` folds the current revision of every dependency into the
/// key, so bumping a revision through `invalidate` makes older keys unreachable.
#[async_trait]
pub trait CacheProvider: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Store `value`; a zero `ttl` never expires.
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        dependencies: &[String],
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &str);

    /// Bump the revision of each dependency name and drop the keys registered on it.
    async fn invalidate(&self, dependencies: &[String]);

    fn revision(&self, dependency: &str) -> u64;

    fn set_revision(&self, dependency: &str, revision: u64);

    /// `path|dep|rev|...|meta_key:meta_value...` with metadata in key order.
    fn build_cache_key(
        &self,
        path: &str,
        dependencies: &[String],
        metadata: &BTreeMap<String, String>,
    ) -> String;
}
