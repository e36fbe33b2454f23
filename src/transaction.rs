// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Canonical transaction struct flowing through decode -> rules -> forward -> store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Request half of an intercepted exchange.
///
/// `body` is kept in memory so rules can match on it, but is skipped during
/// serialization; `body_length` is what captures carry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestInfo {
    pub method: String,
    /// The request target as received: absolute-form for proxy requests,
    /// origin-form on intercepted streams.
    pub target: String,
    /// The exact HTTP-version token from the request line, e.g. "HTTP/1.1".
    pub version: String,
    #[serde(
        serialize_with = "crate::serde_helpers::serialize_headers",
        deserialize_with = "crate::serde_helpers::deserialize_headers"
    )]
    pub headers: HeaderMap,
    #[serde(skip)]
    pub body: Bytes,
    pub body_length: u64,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: "HTTP/1.1".into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            body_length: 0,
        }
    }

    /// Path component of the target, used by rule matching.
    pub fn path(&self) -> &str {
        if let Some(rest) = self.target.strip_prefix("http://") {
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        } else if let Some(rest) = self.target.strip_prefix("https://") {
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        } else {
            &self.target
        }
    }
}

/// Response half; absent until the origin (or the pipeline) produced one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseInfo {
    pub status: u16,
    /// The exact HTTP-version token from the status line, e.g. "HTTP/1.1".
    pub version: String,
    #[serde(
        serialize_with = "crate::serde_helpers::serialize_headers",
        deserialize_with = "crate::serde_helpers::deserialize_headers"
    )]
    pub headers: HeaderMap,
    #[serde(skip)]
    pub body: Bytes,
    pub body_length: u64,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            version: "HTTP/1.1".into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            body_length: 0,
        }
    }
}

/// Terminal outcome of a transaction; exactly one per stored transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Blocked { rule: String },
    Modified { rule: String },
    Failed { error: String },
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Blocked { .. } => "blocked",
            Outcome::Modified { .. } => "modified",
            Outcome::Failed { .. } => "failed",
        }
    }
}

/// One complete client exchange, immutable once the response is recorded.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,

    pub client_addr: SocketAddr,
    /// Origin endpoint as "host:port".
    pub origin: String,

    pub request: RequestInfo,
    pub response: Option<ResponseInfo>,

    pub outcome: Outcome,
    pub duration_ms: u64,
}

impl Transaction {
    pub fn new(client_addr: SocketAddr, origin: impl Into<String>, request: RequestInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            client_addr,
            origin: origin.into(),
            request,
            response: None,
            outcome: Outcome::Passed,
            duration_ms: 0,
        }
    }

    /// Host part of the origin endpoint.
    pub fn origin_host(&self) -> &str {
        self.origin.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.origin)
    }
}
