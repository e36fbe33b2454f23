// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Upstream forwarder with a per-origin idle connection pool.
//!
//! Connections are keyed by (host, port, tls) and reused only when the
//! previous exchange ended cleanly with keep-alive. A pooled connection
//! that died while idle gets one retry on a fresh connection, but only for
//! idempotent methods.

use crate::codec::{self, HttpCodec};
use crate::error::{ProxyError, Result};
use crate::transaction::{RequestInfo, ResponseInfo};
use rustls::pki_types::ServerName;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_IDLE_PER_ORIGIN: usize = 8;
/// An idle connection older than this is assumed dead on the far side.
const POOL_IDLE_EXPIRY: Duration = Duration::from_secs(90);

/// Pool key. Scheme is part of the identity: a plaintext and a TLS
/// connection to the same endpoint are never interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl OriginKey {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    pub fn authority(&self) -> String {
        // IPv6 literals are re-bracketed so the authority parses back.
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for OriginKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.authority())
    }
}

/// Either side of the TLS decision, one read/write surface.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

type UpstreamCodec = HttpCodec<UpstreamStream>;

struct IdleConn {
    codec: UpstreamCodec,
    parked_at: Instant,
}

pub struct Forwarder {
    pool: Mutex<HashMap<OriginKey, VecDeque<IdleConn>>>,
    tls: TlsConnector,
    /// Requests actually written upstream. Blocked transactions never
    /// increment this.
    forwarded: AtomicU64,
    connect_timeout: Duration,
    response_timeout: Duration,
    max_idle_per_origin: usize,
    max_body_bytes: usize,
}

impl Forwarder {
    pub fn new() -> Result<Self> {
        Self::with_limits(
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_RESPONSE_TIMEOUT,
            DEFAULT_MAX_IDLE_PER_ORIGIN,
            codec::DEFAULT_MAX_BODY_BYTES,
        )
    }

    pub fn with_limits(
        connect_timeout: Duration,
        response_timeout: Duration,
        max_idle_per_origin: usize,
        max_body_bytes: usize,
    ) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            warn!(error = %err, "skipping unreadable native root certificate");
        }
        for cert in native.certs {
            // Individual bad roots are dropped, not fatal.
            let _ = roots.add(cert);
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            pool: Mutex::new(HashMap::new()),
            tls: TlsConnector::from(Arc::new(config)),
            forwarded: AtomicU64::new(0),
            connect_timeout,
            response_timeout,
            max_idle_per_origin,
            max_body_bytes,
        })
    }

    pub fn forward_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Forwards one request to the origin and reads the full response.
    ///
    /// A pooled connection found dead on first use gets one retry on a
    /// fresh connection for idempotent methods; non-idempotent methods fail
    /// immediately so the origin never sees a possible duplicate.
    pub async fn forward(&self, origin: &OriginKey, request: &RequestInfo) -> Result<ResponseInfo> {
        let (mut conn, reused) = match self.checkout(origin) {
            Some(conn) => (conn, true),
            None => (self.connect(origin).await?, false),
        };

        match self.exchange(&mut conn, origin, request).await {
            Ok(response) => {
                self.release(origin, conn, request, &response);
                Ok(response)
            }
            Err(err) if reused && is_idempotent(&request.method) && is_stale_error(&err) => {
                debug!(origin = %origin, error = %err, "pooled connection was stale, retrying once");
                let mut fresh = self.connect(origin).await?;
                let response = self.exchange(&mut fresh, origin, request).await?;
                self.release(origin, fresh, request, &response);
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    /// One-shot send that bypasses the pool entirely. Used for replaying a
    /// recorded request; the connection is dropped afterwards.
    pub async fn send_once(&self, origin: &OriginKey, request: &RequestInfo) -> Result<ResponseInfo> {
        let mut conn = self.connect(origin).await?;
        self.exchange(&mut conn, origin, request).await
    }

    async fn exchange(
        &self,
        conn: &mut UpstreamCodec,
        origin: &OriginKey,
        request: &RequestInfo,
    ) -> Result<ResponseInfo> {
        let wire = codec::encode_request(request);
        conn.write_all(&wire).await?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);

        let response = tokio::time::timeout(self.response_timeout, conn.read_response(&request.method))
            .await
            .map_err(|_| {
                ProxyError::UpstreamUnavailable(format!("{origin} did not answer in time"))
            })??;
        Ok(response)
    }

    async fn connect(&self, origin: &OriginKey) -> Result<UpstreamCodec> {
        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((origin.host.as_str(), origin.port)),
        )
        .await
        .map_err(|_| ProxyError::UpstreamUnavailable(format!("connect to {origin} timed out")))?
        .map_err(|e| ProxyError::UpstreamUnavailable(format!("connect to {origin} failed: {e}")))?;
        let _ = tcp.set_nodelay(true);

        let stream = if origin.tls {
            let server_name = ServerName::try_from(origin.host.clone())
                .map_err(|_| ProxyError::UpstreamTls(format!("invalid SNI host '{}'", origin.host)))?;
            let tls = self
                .tls
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProxyError::UpstreamTls(format!("handshake with {origin} failed: {e}")))?;
            UpstreamStream::Tls(Box::new(tls))
        } else {
            UpstreamStream::Plain(tcp)
        };
        Ok(HttpCodec::with_body_limit(stream, self.max_body_bytes))
    }

    fn checkout(&self, origin: &OriginKey) -> Option<UpstreamCodec> {
        let mut pool = match self.pool.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let idle = pool.get_mut(origin)?;
        // Most recently parked first: it is the most likely to still be
        // alive on the far side.
        while let Some(conn) = idle.pop_back() {
            if conn.parked_at.elapsed() < POOL_IDLE_EXPIRY {
                return Some(conn.codec);
            }
            // Expired while parked; drop and keep looking.
        }
        None
    }

    fn release(
        &self,
        origin: &OriginKey,
        conn: UpstreamCodec,
        request: &RequestInfo,
        response: &ResponseInfo,
    ) {
        // Only a cleanly framed keep-alive exchange leaves the connection
        // reusable; close-delimited bodies already drove the stream to EOF
        // and trip `saw_eof`.
        let reusable = !conn.saw_eof()
            && codec::keep_alive(&request.version, &request.headers)
            && codec::keep_alive(&response.version, &response.headers);
        if !reusable {
            return;
        }
        let mut pool = match self.pool.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.max_idle_per_origin == 0 {
            return;
        }
        let idle = pool.entry(origin.clone()).or_default();
        if idle.len() >= self.max_idle_per_origin {
            // Full bucket: the oldest idle connection is the least likely
            // to still be alive, so it makes room for the fresh one.
            idle.pop_front();
        }
        idle.push_back(IdleConn {
            codec: conn,
            parked_at: Instant::now(),
        });
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, origin: &OriginKey) -> usize {
        let pool = match self.pool.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pool.get(origin).map_or(0, VecDeque::len)
    }
}

/// Safe-to-retry methods per RFC 9110.
fn is_idempotent(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "GET" | "HEAD" | "OPTIONS" | "TRACE" | "PUT" | "DELETE"
    )
}

/// Errors consistent with the pooled peer having closed while idle.
fn is_stale_error(err: &ProxyError) -> bool {
    match err {
        ProxyError::Io(io) => matches!(
            io.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::UnexpectedEof
        ),
        ProxyError::MalformedMessage(msg) => msg.contains("before any response bytes"),
        _ => false,
    }
}
