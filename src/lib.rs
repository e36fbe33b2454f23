// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP/1.1 proxy core.
//!
//! The proxy terminates TLS for intercepted hosts with certificates signed
//! by its own CA, decodes each exchange with byte-accurate framing, runs it
//! through an ordered rule engine, forwards it over pooled upstream
//! connections and records every transaction in a bounded store with a live
//! feed.

pub mod ca;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod forward;
pub mod intercept;
pub mod pipeline;
pub mod proxy;
pub mod rules;
pub mod serde_helpers;
pub mod store;
pub mod transaction;

#[cfg(test)]
pub mod test_helpers;
