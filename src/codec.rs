// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! HTTP/1.1 message codec with exact framing control.
//!
//! Each `read_*` call consumes precisely the bytes of one logical message
//! (head plus content-length body, chunked body, or close-delimited response
//! body) and leaves the stream positioned at the next message boundary, so
//! persistent connections can be decoded message by message. `encode_*`
//! produces wire-exact output whose `content-length` always matches the
//! emitted body; chunked bodies are decoded on read and re-emitted
//! length-delimited.

use crate::error::ProxyError;
use crate::transaction::{RequestInfo, ResponseInfo};
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderMap;
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a message head (request/status line plus headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Default upper bound on a decoded body; configurable per codec.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const MAX_HEADERS: usize = 100;

/// Buffered codec over one byte stream.
pub struct HttpCodec<S> {
    stream: S,
    buf: BytesMut,
    saw_eof: bool,
    max_body_bytes: usize,
}

impl<S> HttpCodec<S> {
    pub fn new(stream: S) -> Self {
        Self::with_body_limit(stream, DEFAULT_MAX_BODY_BYTES)
    }

    /// Codec with an explicit body buffering limit. A declared or decoded
    /// body past the limit is rejected as `PayloadTooLarge`.
    pub fn with_body_limit(stream: S, max_body_bytes: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            saw_eof: false,
            max_body_bytes,
        }
    }

    /// True once the underlying stream reported EOF; a connection in this
    /// state can never be reused.
    pub fn saw_eof(&self) -> bool {
        self.saw_eof
    }

    /// Give the raw stream back together with any bytes read past the last
    /// consumed message. Used when a CONNECT takes over the transport.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.stream, self.buf.freeze())
    }
}

impl<S: AsyncRead + Unpin> HttpCodec<S> {
    async fn fill(&mut self) -> Result<usize, ProxyError> {
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            self.saw_eof = true;
        }
        Ok(n)
    }

    /// Resolve once the peer closes (or errors out) its write side. Bytes
    /// that arrive in the meantime stay buffered for the next `read_*`.
    pub async fn wait_for_close(&mut self) {
        while !self.saw_eof {
            if self.fill().await.is_err() {
                return;
            }
        }
    }

    /// Decode one request. `Ok(None)` means the stream ended cleanly at a
    /// message boundary (client done with a persistent connection).
    pub async fn read_request(&mut self) -> Result<Option<RequestInfo>, ProxyError> {
        let head = loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parser = httparse::Request::new(&mut headers);
            match parser.parse(&self.buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let method = parser
                        .method
                        .ok_or_else(|| malformed("request line missing method"))?
                        .to_string();
                    let target = parser
                        .path
                        .ok_or_else(|| malformed("request line missing target"))?
                        .to_string();
                    let version = version_token(parser.version)?;
                    let header_map = to_header_map(parser.headers)?;
                    break (head_len, method, target, version, header_map);
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > MAX_HEAD_BYTES {
                        return Err(malformed("request head exceeds size limit"));
                    }
                    if self.fill().await? == 0 {
                        if self.buf.is_empty() {
                            return Ok(None);
                        }
                        return Err(malformed("connection closed mid request head"));
                    }
                }
                Err(e) => return Err(malformed(&format!("invalid request head: {e}"))),
            }
        };
        let (head_len, method, target, version, mut headers) = head;
        let _ = self.buf.split_to(head_len);

        let body = match body_framing(&headers)? {
            BodyFraming::Chunked => self.read_chunked_body().await?,
            BodyFraming::Length(len) => self.read_exact_body(len).await?,
            BodyFraming::None => Bytes::new(),
        };
        normalize_framing_headers(&mut headers, &body);

        Ok(Some(RequestInfo {
            method,
            target,
            version,
            body_length: body.len() as u64,
            body,
            headers,
        }))
    }

    /// Decode one response to a request issued with `request_method`.
    pub async fn read_response(&mut self, request_method: &str) -> Result<ResponseInfo, ProxyError> {
        let head = loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parser = httparse::Response::new(&mut headers);
            match parser.parse(&self.buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let status = parser
                        .code
                        .ok_or_else(|| malformed("status line missing code"))?;
                    let version = version_token(parser.version)?;
                    let header_map = to_header_map(parser.headers)?;
                    break (head_len, status, version, header_map);
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > MAX_HEAD_BYTES {
                        return Err(malformed("response head exceeds size limit"));
                    }
                    if self.fill().await? == 0 {
                        // An empty buffer means the peer died while idle,
                        // not mid-message; the forwarder may retry that.
                        return Err(if self.buf.is_empty() {
                            malformed("connection closed before any response bytes")
                        } else {
                            malformed("connection closed mid response head")
                        });
                    }
                }
                Err(e) => return Err(malformed(&format!("invalid response head: {e}"))),
            }
        };
        let (head_len, status, version, mut headers) = head;
        let _ = self.buf.split_to(head_len);

        let body = if !response_has_body(request_method, status) {
            // A HEAD (or 204/304) response carries no body, but its
            // content-length describes the entity it stands for; leave
            // the advertised value untouched.
            headers.remove(TRANSFER_ENCODING);
            Bytes::new()
        } else {
            let body = match body_framing(&headers)? {
                BodyFraming::Chunked => self.read_chunked_body().await?,
                BodyFraming::Length(len) => self.read_exact_body(len).await?,
                // Close-delimited: legal only for responses.
                BodyFraming::None => self.read_until_eof().await?,
            };
            normalize_framing_headers(&mut headers, &body);
            body
        };

        Ok(ResponseInfo {
            status,
            version,
            body_length: body.len() as u64,
            body,
            headers,
        })
    }

    async fn read_exact_body(&mut self, len: usize) -> Result<Bytes, ProxyError> {
        if len > self.max_body_bytes {
            return Err(too_large(len, self.max_body_bytes));
        }
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(malformed("connection closed mid body"));
            }
        }
        Ok(self.buf.split_to(len).freeze())
    }

    async fn read_chunked_body(&mut self) -> Result<Bytes, ProxyError> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let size_str = line
                .split(';')
                .next()
                .map(str::trim)
                .unwrap_or_default();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| malformed("invalid chunk size"))?;
            if body.len() + size > self.max_body_bytes {
                return Err(too_large(body.len() + size, self.max_body_bytes));
            }
            if size == 0 {
                // Trailer section: zero or more header lines, then CRLF.
                loop {
                    let trailer = self.read_line().await?;
                    if trailer.is_empty() {
                        return Ok(body.freeze());
                    }
                }
            }
            let chunk = self.read_exact_body(size + 2).await?;
            if &chunk[size..] != b"\r\n" {
                return Err(malformed("chunk data missing CRLF terminator"));
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    async fn read_line(&mut self) -> Result<String, ProxyError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos + 2);
                return String::from_utf8(line[..pos].to_vec())
                    .map_err(|_| malformed("non-UTF8 chunk framing line"));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(malformed("chunk framing line exceeds size limit"));
            }
            if self.fill().await? == 0 {
                return Err(malformed("connection closed mid chunk framing"));
            }
        }
    }

    async fn read_until_eof(&mut self) -> Result<Bytes, ProxyError> {
        loop {
            if self.buf.len() > self.max_body_bytes {
                return Err(too_large(self.buf.len(), self.max_body_bytes));
            }
            if self.fill().await? == 0 {
                return Ok(self.buf.split_to(self.buf.len()).freeze());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> HttpCodec<S> {
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

fn malformed(msg: &str) -> ProxyError {
    ProxyError::MalformedMessage(msg.to_string())
}

fn too_large(size: usize, limit: usize) -> ProxyError {
    ProxyError::PayloadTooLarge(format!("body of {size} bytes exceeds the {limit} byte limit"))
}

fn version_token(version: Option<u8>) -> Result<String, ProxyError> {
    match version {
        Some(0) => Ok("HTTP/1.0".to_string()),
        Some(1) => Ok("HTTP/1.1".to_string()),
        _ => Err(malformed("unsupported HTTP version")),
    }
}

fn to_header_map(headers: &[httparse::Header<'_>]) -> Result<HeaderMap, ProxyError> {
    let mut hm = HeaderMap::new();
    for h in headers {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| malformed("invalid header name"))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|_| malformed("invalid header value"))?;
        hm.append(name, value);
    }
    Ok(hm)
}

/// Determine how the body of a decoded message is delimited.
///
/// `Transfer-Encoding` wins over `Content-Length`; multiple conflicting
/// `Content-Length` values are a framing violation (request smuggling
/// territory), as are transfer codings other than a final `chunked`.
fn body_framing(headers: &HeaderMap) -> Result<BodyFraming, ProxyError> {
    if let Some(te) = headers.get(TRANSFER_ENCODING) {
        let te = te
            .to_str()
            .map_err(|_| malformed("non-ASCII transfer-encoding"))?;
        let last = te
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .last()
            .unwrap_or_default();
        if !last.eq_ignore_ascii_case("chunked") {
            return Err(malformed("unsupported transfer coding"));
        }
        if headers.contains_key(CONTENT_LENGTH) {
            return Err(malformed("both transfer-encoding and content-length present"));
        }
        return Ok(BodyFraming::Chunked);
    }

    let mut seen: Option<usize> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let s = value
            .to_str()
            .map_err(|_| malformed("non-ASCII content-length"))?;
        // A single header line may itself carry a comma-joined list.
        for part in s.split(',') {
            let n: usize = part
                .trim()
                .parse()
                .map_err(|_| malformed("invalid content-length"))?;
            match seen {
                Some(prev) if prev != n => {
                    return Err(malformed("conflicting content-length values"))
                }
                _ => seen = Some(n),
            }
        }
    }
    Ok(match seen {
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::None,
    })
}

/// After decoding, the stored message is always length-delimited: drop any
/// transfer coding and pin `content-length` to the actual body size so the
/// decoded form re-encodes without ambiguity.
fn normalize_framing_headers(headers: &mut HeaderMap, body: &Bytes) {
    let had_length_marker =
        headers.remove(TRANSFER_ENCODING).is_some() || headers.contains_key(CONTENT_LENGTH);
    if !body.is_empty() || had_length_marker {
        headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&body.len().to_string())
                .unwrap_or(HeaderValue::from_static("0")),
        );
    }
}

/// RFC 7230 section 3.3.3: these responses never carry a body.
fn response_has_body(request_method: &str, status: u16) -> bool {
    if request_method.eq_ignore_ascii_case("HEAD") || request_method.eq_ignore_ascii_case("CONNECT")
    {
        return false;
    }
    !matches!(status, 100..=199 | 204 | 304)
}

/// Serialize a request exactly as it will cross the wire.
pub fn encode_request(req: &RequestInfo) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + req.body.len());
    out.extend_from_slice(
        format!("{} {} {}\r\n", req.method, req.target, req.version).as_bytes(),
    );
    let emit_length = !req.body.is_empty() || req.headers.contains_key(CONTENT_LENGTH);
    write_headers(
        &mut out,
        &req.headers,
        emit_length.then(|| HeaderValue::from(req.body.len())),
    );
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out.freeze()
}

/// Serialize a response exactly as it will cross the wire.
pub fn encode_response(resp: &ResponseInfo) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + resp.body.len());
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            resp.version,
            resp.status,
            reason_phrase(resp.status)
        )
        .as_bytes(),
    );
    let bodyless = matches!(resp.status, 100..=199 | 204 | 304);
    let content_length = if bodyless {
        None
    } else if resp.body.is_empty() {
        // An empty body with a retained header means the header describes
        // an entity that never crosses the wire (a HEAD response); the
        // advertised value must survive re-encoding.
        Some(
            resp.headers
                .get(CONTENT_LENGTH)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from(0usize)),
        )
    } else {
        Some(HeaderValue::from(resp.body.len()))
    };
    write_headers(&mut out, &resp.headers, content_length);
    out.extend_from_slice(b"\r\n");
    if !bodyless {
        out.extend_from_slice(&resp.body);
    }
    out.freeze()
}

fn write_headers(out: &mut BytesMut, headers: &HeaderMap, content_length: Option<HeaderValue>) {
    for (name, value) in headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if let Some(value) = content_length {
        out.extend_from_slice(b"content-length: ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Whether the connection may carry another message after this one.
pub fn keep_alive(version: &str, headers: &HeaderMap) -> bool {
    let tokens = connection_tokens(headers.get(CONNECTION));
    if tokens.contains("close") {
        return false;
    }
    if tokens.contains("keep-alive") {
        return true;
    }
    version == "HTTP/1.1"
}

// Parse a Connection header value into a lowercased set of tokens.
fn connection_tokens(val: Option<&HeaderValue>) -> HashSet<String> {
    let mut set = HashSet::new();
    if let Some(v) = val {
        if let Ok(s) = v.to_str() {
            for token in s.split(',') {
                let trimmed = token.trim().to_ascii_lowercase();
                if !trimmed.is_empty() {
                    set.insert(trimmed);
                }
            }
        }
    }
    set
}

/// RFC 7230 section 6.1: hop-by-hop headers must not be forwarded.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Strip hop-by-hop headers (static list plus any the Connection header
/// names) before a message crosses to the other leg.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named = connection_tokens(headers.get(CONNECTION));
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let lower = name.as_str().to_ascii_lowercase();
            HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || named.contains(&lower)
        })
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}
