// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Per-connection transaction pipeline.
//!
//! One session owns one client-facing codec and loops request by request:
//! decode, evaluate rules, forward (or not), evaluate response rules, record
//! the transaction, reply. Every evaluated request produces exactly one
//! store entry, whatever its outcome. Errors synthesize a response and end
//! the connection; the next client request starts a clean session.

use crate::ca::CertificateAuthority;
use crate::codec::{self, HttpCodec};
use crate::connection::ConnectionMetadata;
use crate::error::{ProxyError, Result};
use crate::forward::{Forwarder, OriginKey};
use crate::rules::{self, Action, RuleEngine, Verdict};
use crate::store::TransactionStore;
use crate::transaction::{Outcome, RequestInfo, ResponseInfo, Transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Path where the proxy serves its own root certificate.
pub const CA_EXPORT_PATH: &str = "/_prism/ca.pem";

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a session currently is; logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Decoding,
    Evaluating,
    Forwarding,
    Completed,
    Closed,
}

/// State shared by every session of one proxy instance.
pub struct ProxyShared {
    pub ca: Arc<CertificateAuthority>,
    pub rules: RuleEngine,
    pub forwarder: Forwarder,
    pub store: TransactionStore,
    idle_timeout: Duration,
    handshake_timeout: Duration,
    max_body_bytes: usize,
}

impl ProxyShared {
    pub fn new(ca: Arc<CertificateAuthority>, rules: RuleEngine) -> Result<Self> {
        Ok(Self {
            ca,
            rules,
            forwarder: Forwarder::new()?,
            store: TransactionStore::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_body_bytes: codec::DEFAULT_MAX_BODY_BYTES,
        })
    }

    pub fn from_config(
        ca: Arc<CertificateAuthority>,
        rules: RuleEngine,
        config: &crate::config::Config,
    ) -> Result<Self> {
        let limits = &config.limits;
        Ok(Self {
            ca,
            rules,
            forwarder: Forwarder::with_limits(
                Duration::from_millis(limits.connect_timeout_ms),
                Duration::from_millis(limits.response_timeout_ms),
                limits.max_idle_per_origin,
                limits.max_body_bytes,
            )?,
            store: TransactionStore::with_capacity(limits.history_capacity),
            idle_timeout: Duration::from_millis(limits.idle_timeout_ms),
            handshake_timeout: Duration::from_millis(limits.handshake_timeout_ms),
            max_body_bytes: limits.max_body_bytes,
        })
    }

    /// Deadline for a new client's first request, tunnel preface and TLS
    /// handshake.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }
}

/// Drive one client connection until it closes or errors out.
///
/// `tunnel_origin` is `Some` for sessions running inside an intercepted
/// CONNECT tunnel; plain sessions derive the origin per request from the
/// absolute-form target or Host header.
pub async fn run_session<S>(
    mut client: HttpCodec<S>,
    first: Option<RequestInfo>,
    conn: ConnectionMetadata,
    tunnel_origin: Option<OriginKey>,
    shared: Arc<ProxyShared>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = first;
    loop {
        trace_state(&conn, SessionState::Decoding);
        let request = match pending.take() {
            Some(request) => request,
            None => {
                let read = tokio::time::timeout(shared.idle_timeout, client.read_request()).await;
                match read {
                    Err(_) => {
                        debug!(conn = %conn.id, "idle timeout between requests");
                        trace_state(&conn, SessionState::Closed);
                        return Ok(());
                    }
                    Ok(Ok(Some(request))) => request,
                    // Clean EOF at a message boundary: client is done.
                    Ok(Ok(None)) => {
                        trace_state(&conn, SessionState::Closed);
                        return Ok(());
                    }
                    Ok(Err(err)) => {
                        warn!(conn = %conn.id, error = %err, "unreadable request");
                        let resp = synthesize_error(&err);
                        let _ = client.write_all(&codec::encode_response(&resp)).await;
                        return Err(err);
                    }
                }
            }
        };

        if request.method.eq_ignore_ascii_case("GET") && request.path() == CA_EXPORT_PATH {
            let resp = ca_export_response(&shared.ca);
            client.write_all(&codec::encode_response(&resp)).await?;
            continue;
        }

        let (origin, mut request) = match resolve_origin(request, tunnel_origin.as_ref()) {
            Ok(pair) => pair,
            Err(err) => {
                let resp = synthesize_error(&err);
                let _ = client.write_all(&codec::encode_response(&resp)).await;
                return Err(err);
            }
        };
        // Read the client's connection intent before the hop-by-hop strip
        // removes the header it lives in.
        let close_after = !codec::keep_alive(&request.version, &request.headers);
        codec::strip_hop_by_hop(&mut request.headers);

        let started = Instant::now();
        let mut tx = Transaction::new(conn.remote_addr, origin.authority(), request);

        let response = execute(&mut client, &conn, &mut tx, &origin, &shared).await;
        tx.duration_ms = started.elapsed().as_millis() as u64;
        trace_state(&conn, SessionState::Completed);

        let failed = matches!(tx.outcome, Outcome::Failed { .. });
        let mut wire_response = response;
        if close_after || failed {
            wire_response
                .headers
                .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
        }

        debug!(
            conn = %conn.id,
            method = %tx.request.method,
            origin = %tx.origin,
            outcome = tx.outcome.kind(),
            status = wire_response.status,
            "transaction complete"
        );
        tx.response = Some(wire_response.clone());
        shared.store.append(tx);

        client
            .write_all(&codec::encode_response(&wire_response))
            .await?;

        if failed || close_after || !codec::keep_alive(&wire_response.version, &wire_response.headers)
        {
            trace_state(&conn, SessionState::Closed);
            return Ok(());
        }
    }
}

fn trace_state(conn: &ConnectionMetadata, state: SessionState) {
    tracing::trace!(conn = %conn.id, state = ?state, "session state");
}

/// Forward while watching the client socket. A client that disconnects
/// mid-exchange aborts the upstream work; the in-flight connection is
/// dropped, never returned to the pool.
async fn forward_watching<S>(
    client: &mut HttpCodec<S>,
    forwarder: &Forwarder,
    origin: &OriginKey,
    request: &RequestInfo,
) -> Result<ResponseInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = forwarder.forward(origin, request) => result,
        _ = client.wait_for_close() => Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "client disconnected during upstream exchange",
        ))),
    }
}

/// Evaluate and (unless blocked) forward one request, settling the outcome.
async fn execute<S>(
    client: &mut HttpCodec<S>,
    conn: &ConnectionMetadata,
    tx: &mut Transaction,
    origin: &OriginKey,
    shared: &ProxyShared,
) -> ResponseInfo
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    trace_state(conn, SessionState::Evaluating);
    let rules = shared.rules.snapshot();
    let verdict = rules.evaluate_request(tx);

    match verdict.action {
        Action::Block => {
            let rule = verdict.rule.unwrap_or_default();
            info!(rule = %rule, origin = %tx.origin, "request blocked");
            tx.outcome = Outcome::Blocked { rule: rule.clone() };
            blocked_response(&rule)
        }
        Action::Modify(transform) => {
            let rule = verdict.rule.unwrap_or_default();
            let request = match rules::apply_request_transform(&tx.request, &transform) {
                Ok(request) => request,
                Err(err) => return fail(tx, err),
            };
            tx.request = request;
            trace_state(conn, SessionState::Forwarding);
            match forward_watching(client, &shared.forwarder, origin, &tx.request).await {
                Ok(upstream) => {
                    let mut response = match rules::apply_response_transform(&upstream, &transform)
                    {
                        Ok(response) => response,
                        Err(err) => return fail(tx, err),
                    };
                    codec::strip_hop_by_hop(&mut response.headers);
                    tx.outcome = Outcome::Modified { rule };
                    response
                }
                Err(err) => fail(tx, err),
            }
        }
        Action::Pass => {
            trace_state(conn, SessionState::Forwarding);
            match forward_watching(client, &shared.forwarder, origin, &tx.request).await {
                Ok(mut upstream) => {
                    codec::strip_hop_by_hop(&mut upstream.headers);
                    // Response-phase rules: status predicates could not be
                    // decided before the origin answered.
                    if let Some(Verdict {
                        rule: Some(rule),
                        action: Action::Modify(transform),
                    }) = rules.evaluate_response(tx, &upstream)
                    {
                        match rules::apply_response_transform(&upstream, &transform) {
                            Ok(response) => {
                                tx.outcome = Outcome::Modified { rule };
                                return response;
                            }
                            Err(err) => return fail(tx, err),
                        }
                    }
                    tx.outcome = Outcome::Passed;
                    upstream
                }
                Err(err) => fail(tx, err),
            }
        }
    }
}

fn fail(tx: &mut Transaction, err: ProxyError) -> ResponseInfo {
    warn!(origin = %tx.origin, error = %err, "transaction failed");
    tx.outcome = Outcome::Failed {
        error: err.kind().to_string(),
    };
    synthesize_error(&err)
}

/// Derive the upstream origin and rewrite the target to origin-form.
fn resolve_origin(
    mut request: RequestInfo,
    tunnel_origin: Option<&OriginKey>,
) -> Result<(OriginKey, RequestInfo)> {
    if let Some(origin) = tunnel_origin {
        // Inside a tunnel the target is already origin-form.
        return Ok((origin.clone(), request));
    }

    let target = request.target.clone();
    if let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        let tls = target.starts_with("https://");
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = split_authority(authority, if tls { 443 } else { 80 })?;
        request.target = path.to_string();
        return Ok((OriginKey::new(host, port, tls), request));
    }

    // Origin-form target on a plain connection: Host header decides.
    let host_header = request
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            ProxyError::MalformedMessage("origin-form request without Host header".into())
        })?;
    let (host, port) = split_authority(&host_header, 80)?;
    Ok((OriginKey::new(host, port, false), request))
}

fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let bad_port =
        || ProxyError::MalformedMessage(format!("invalid port in authority '{authority}'"));

    // RFC 3986: an IPv6 literal is bracketed, the port follows the bracket.
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            ProxyError::MalformedMessage(format!(
                "unterminated IPv6 literal in authority '{authority}'"
            ))
        })?;
        return match after.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), port.parse::<u16>().map_err(|_| bad_port())?)),
            None if after.is_empty() => Ok((host.to_string(), default_port)),
            None => Err(bad_port()),
        };
    }
    if authority.matches(':').count() > 1 {
        // Bare IPv6 without brackets: no way to tell host from port.
        return Err(ProxyError::MalformedMessage(format!(
            "IPv6 host in authority '{authority}' must be bracketed"
        )));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse::<u16>().map_err(|_| bad_port())?)),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn blocked_response(rule: &str) -> ResponseInfo {
    let mut resp = ResponseInfo::new(403);
    resp.headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp.body = bytes::Bytes::from(format!("request blocked by rule '{rule}'\n"));
    resp.body_length = resp.body.len() as u64;
    resp
}

pub(crate) fn synthesize_error(err: &ProxyError) -> ResponseInfo {
    let mut resp = ResponseInfo::new(err.synthesized_status());
    resp.headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp.headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("close"),
    );
    resp.body = bytes::Bytes::from(format!("{}: {err}\n", err.kind()));
    resp.body_length = resp.body.len() as u64;
    resp
}

fn ca_export_response(ca: &CertificateAuthority) -> ResponseInfo {
    let mut resp = ResponseInfo::new(200);
    resp.headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/x-pem-file"),
    );
    resp.body = bytes::Bytes::from(ca.ca_cert_pem().into_bytes());
    resp.body_length = resp.body.len() as u64;
    resp
}
