// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Fixtures shared by unit tests.

use crate::transaction::{RequestInfo, Transaction};
use std::net::SocketAddr;

pub fn test_client_addr() -> SocketAddr {
    "127.0.0.1:54321".parse().unwrap()
}

/// A plain GET transaction against "example.test:80".
pub fn make_test_transaction() -> Transaction {
    make_tx_for("GET", "http://example.test/a", "example.test:80")
}

pub fn make_tx_for(method: &str, target: &str, origin: &str) -> Transaction {
    let request = RequestInfo::new(method, target);
    Transaction::new(test_client_addr(), origin, request)
}
