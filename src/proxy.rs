// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Listener and per-connection dispatch.
//!
//! Plain requests go straight to the pipeline. A CONNECT gets its tunnel
//! established first, then the client's opening bytes pick the path:
//! TLS preface on a non-exempt host is terminated and piped through the
//! pipeline; anything else is relayed byte for byte.

use crate::codec::{self, HttpCodec};
use crate::config::Config;
use crate::connection::ConnectionMetadata;
use crate::error::{ProxyError, Result};
use crate::forward::OriginKey;
use crate::intercept::{self, Preface};
use crate::pipeline::{self, ProxyShared};
use crate::transaction::RequestInfo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Bind and serve until cancelled.
pub async fn run_proxy(config: Config, shared: Arc<ProxyShared>) -> Result<()> {
    let listener = TcpListener::bind(config.general.listen).await?;
    info!(listen = %config.general.listen, "proxy listening");
    run_proxy_with_limit(listener, Arc::new(config), shared, None).await
}

/// Accept loop. `limit` bounds the number of accepted connections, letting
/// tests drive a known workload and get a clean return.
pub async fn run_proxy_with_limit(
    listener: TcpListener,
    config: Arc<Config>,
    shared: Arc<ProxyShared>,
    limit: Option<usize>,
) -> Result<()> {
    let mut accepted = 0usize;
    loop {
        if let Some(limit) = limit {
            if accepted >= limit {
                return Ok(());
            }
        }
        let (stream, peer) = listener.accept().await?;
        accepted += 1;
        let config = config.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, config, shared).await {
                // Connection-scoped failure; the listener is unaffected.
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    shared: Arc<ProxyShared>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut client = HttpCodec::with_body_limit(stream, shared.max_body_bytes());

    // A fresh connection gets a bounded window to deliver its first
    // request; after that it is only an open file descriptor.
    let read = tokio::time::timeout(shared.handshake_timeout(), client.read_request()).await;
    let first = match read {
        Err(_) => {
            debug!(peer = %peer, "client sent no request before the handshake deadline");
            return Ok(());
        }
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => {
            let resp = pipeline::synthesize_error(&err);
            let _ = client.write_all(&codec::encode_response(&resp)).await;
            return Err(err);
        }
    };

    if first.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, peer, first, config, shared).await
    } else {
        let conn = ConnectionMetadata::new(peer);
        pipeline::run_session(client, Some(first), conn, None, shared).await
    }
}

async fn handle_connect(
    mut client: HttpCodec<TcpStream>,
    peer: SocketAddr,
    request: RequestInfo,
    config: Arc<Config>,
    shared: Arc<ProxyShared>,
) -> Result<()> {
    let (host, port) = split_connect_authority(&request.target)?;
    client.write_all(CONNECT_ESTABLISHED).await?;

    // Bytes the codec read past the CONNECT head belong to the tunnel.
    let (mut stream, leftover) = client.into_parts();
    let peeked = tokio::time::timeout(
        shared.handshake_timeout(),
        intercept::peek_preface(&mut stream, leftover),
    )
    .await
    .map_err(|_| ProxyError::Handshake("tunnel preface not delivered in time".into()))??;

    match intercept::classify_preface(&peeked) {
        Preface::Tls { sni } => {
            let effective_host = sni.unwrap_or_else(|| host.clone());
            if config.is_passthrough_host(&effective_host) {
                debug!(host = %effective_host, "passthrough host, relaying TLS unmodified");
                return relay(stream, &host, port, peeked).await;
            }
            debug!(peer = %peer, host = %effective_host, "terminating TLS");
            let tls = tokio::time::timeout(
                shared.handshake_timeout(),
                intercept::terminate_tls(shared.ca.clone(), &effective_host, peeked, stream),
            )
            .await
            .map_err(|_| ProxyError::Handshake("inbound handshake timed out".into()))??;
            let conn = ConnectionMetadata::intercepted(peer, effective_host.clone());
            let origin = OriginKey::new(host, port, true);
            pipeline::run_session(
                HttpCodec::with_body_limit(tls, shared.max_body_bytes()),
                None,
                conn,
                Some(origin),
                shared,
            )
            .await
        }
        Preface::Passthrough => {
            debug!(peer = %peer, host = %host, "non-TLS tunnel preface, relaying");
            relay(stream, &host, port, peeked).await
        }
    }
}

async fn relay(client: TcpStream, host: &str, port: u16, peeked: bytes::Bytes) -> Result<()> {
    let upstream = TcpStream::connect((host, port)).await.map_err(|e| {
        ProxyError::UpstreamUnavailable(format!("tunnel connect to {host}:{port} failed: {e}"))
    })?;
    let _ = upstream.set_nodelay(true);
    match intercept::tunnel(client, upstream, peeked).await {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!(host, port, error = %err, "tunnel relay failed");
            Err(err)
        }
    }
}

fn split_connect_authority(target: &str) -> Result<(String, u16)> {
    let bad_port = || {
        ProxyError::MalformedMessage(format!("CONNECT target '{target}' has an invalid port"))
    };
    let no_port =
        || ProxyError::MalformedMessage(format!("CONNECT target '{target}' lacks a port"));

    // Bracketed IPv6 literal, port mandatory after the bracket.
    if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            ProxyError::MalformedMessage(format!(
                "CONNECT target '{target}' has an unterminated IPv6 literal"
            ))
        })?;
        let port = after.strip_prefix(':').ok_or_else(no_port)?;
        if host.is_empty() {
            return Err(ProxyError::MalformedMessage(
                "CONNECT target has an empty host".into(),
            ));
        }
        return Ok((host.to_string(), port.parse::<u16>().map_err(|_| bad_port())?));
    }
    if target.matches(':').count() > 1 {
        return Err(ProxyError::MalformedMessage(format!(
            "IPv6 host in CONNECT target '{target}' must be bracketed"
        )));
    }

    let (host, port) = target.rsplit_once(':').ok_or_else(no_port)?;
    let port = port.parse::<u16>().map_err(|_| bad_port())?;
    if host.is_empty() {
        return Err(ProxyError::MalformedMessage(
            "CONNECT target has an empty host".into(),
        ));
    }
    Ok((host.to_string(), port))
}
