// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! TOML configuration: listener, CA paths, passthrough hosts and the
//! initial rule set.

use crate::error::{ProxyError, Result};
use crate::rules::{Rule, RuleSet};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub limits: Limits,
    /// Initial rules; replaceable at runtime through the rule engine.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Timeouts and capacity bounds, all with serviceable defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// How long a persistent client connection may sit between requests.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// How long a new client gets to deliver its first request, tunnel
    /// preface and TLS handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_max_idle_per_origin")]
    pub max_idle_per_origin: usize,
    /// Largest request or response body the proxy will buffer; anything
    /// bigger is refused as a policy matter.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Transaction store window; oldest entries evicted beyond this.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_max_idle_per_origin() -> usize {
    8
}

fn default_max_body_bytes() -> usize {
    crate::codec::DEFAULT_MAX_BODY_BYTES
}

fn default_history_capacity() -> usize {
    1024
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_idle_per_origin: default_max_idle_per_origin(),
            max_body_bytes: default_max_body_bytes(),
            history_capacity: default_history_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default = "default_ca_cert")]
    pub ca_cert: PathBuf,
    #[serde(default = "default_ca_key")]
    pub ca_key: PathBuf,
    /// Hosts never intercepted: their CONNECT tunnels are relayed as-is
    /// even when the preface is TLS. Suffix-matched, like rule hosts.
    #[serde(default)]
    pub passthrough_hosts: Vec<String>,
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:8888".parse().unwrap()
}

fn default_ca_cert() -> PathBuf {
    PathBuf::from("prism-ca.crt")
}

fn default_ca_key() -> PathBuf {
    PathBuf::from("prism-ca.key")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert: default_ca_cert(),
            ca_key: default_ca_key(),
            passthrough_hosts: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            tls: TlsConfig::default(),
            limits: Limits::default(),
            rules: Vec::new(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| ProxyError::RuleEvaluation(format!("invalid configuration: {e}")))
    }

    /// Compile the configured rules; fails fast on bad patterns so the
    /// proxy never starts with a partially usable set.
    pub fn compiled_rules(&self) -> Result<RuleSet> {
        RuleSet::compile(self.rules.clone())
    }

    pub fn is_passthrough_host(&self, host: &str) -> bool {
        self.tls
            .passthrough_hosts
            .iter()
            .any(|suffix| host.ends_with(suffix.as_str()))
    }
}
