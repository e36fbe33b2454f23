// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Per-accepted-connection session metadata.

use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

/// Metadata associated with one accepted client connection.
///
/// Created when the listener accepts, carried through interception and every
/// message processed on the (possibly persistent) connection, dropped when
/// either side closes.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub established: Instant,
    /// Host the connection was intercepted for (CONNECT authority or SNI);
    /// `None` for plain proxy connections, which name a host per request.
    pub intercepted_host: Option<String>,
    /// Whether the client-facing leg was TLS-terminated by us.
    pub tls_terminated: bool,
}

impl ConnectionMetadata {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            established: Instant::now(),
            intercepted_host: None,
            tls_terminated: false,
        }
    }

    pub fn intercepted(remote_addr: SocketAddr, host: impl Into<String>) -> Self {
        Self {
            intercepted_host: Some(host.into()),
            tls_terminated: true,
            ..Self::new(remote_addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_connection_has_no_host() {
        let meta = ConnectionMetadata::new("127.0.0.1:9999".parse().unwrap());
        assert!(meta.intercepted_host.is_none());
        assert!(!meta.tls_terminated);
    }

    #[test]
    fn intercepted_connection_records_host() {
        let meta = ConnectionMetadata::intercepted("127.0.0.1:9999".parse().unwrap(), "example.test");
        assert_eq!(meta.intercepted_host.as_deref(), Some("example.test"));
        assert!(meta.tls_terminated);
    }
}
