// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Transport interception after a CONNECT is accepted.
//!
//! The first bytes the client sends inside the tunnel decide everything:
//! a TLS ClientHello is terminated with a CA-signed leaf, anything else is
//! relayed verbatim. The peeked bytes are replayed into whichever path wins,
//! so the client sees an unmodified stream either way.

use crate::ca::CertificateAuthority;
use crate::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// What the peeked tunnel preface turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preface {
    /// TLS handshake record; SNI present when the client sent one.
    Tls { sni: Option<String> },
    /// Not TLS. The tunnel is relayed without interpretation.
    Passthrough,
}

/// Classify the first bytes a client sends inside an accepted tunnel.
///
/// A TLS record starts with content type 0x16 (handshake) and major
/// version 0x03. Everything else, including cleartext HTTP inside a
/// CONNECT, is passthrough.
pub fn classify_preface(prefix: &[u8]) -> Preface {
    if prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 {
        Preface::Tls {
            sni: extract_sni(prefix),
        }
    } else {
        Preface::Passthrough
    }
}

/// Best-effort SNI host from a raw ClientHello. `None` on anything that
/// does not parse; the CONNECT authority covers that case.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    // Record header: type (1) + version (2) + length (2).
    if data.len() < 5 || data[0] != 0x16 {
        return None;
    }
    let handshake = &data[5..];
    // Handshake header: type (1) + length (3); 0x01 is ClientHello.
    if handshake.len() < 4 || handshake[0] != 0x01 {
        return None;
    }
    let hello = &handshake[4..];
    if hello.len() < 38 {
        return None;
    }

    // Version (2) + random (32).
    let mut offset = 34;
    let session_id_len = *hello.get(offset)? as usize;
    offset += 1 + session_id_len;

    if offset + 2 > hello.len() {
        return None;
    }
    let cipher_suites_len = u16::from_be_bytes([hello[offset], hello[offset + 1]]) as usize;
    offset += 2 + cipher_suites_len;

    let compression_len = *hello.get(offset)? as usize;
    offset += 1 + compression_len;

    if offset + 2 > hello.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([hello[offset], hello[offset + 1]]) as usize;
    offset += 2;
    let extensions_end = offset + extensions_len;
    if extensions_end > hello.len() {
        return None;
    }

    while offset + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([hello[offset], hello[offset + 1]]);
        let ext_len = u16::from_be_bytes([hello[offset + 2], hello[offset + 3]]) as usize;
        offset += 4;

        if ext_type == 0x0000 {
            // server_name extension: list length (2), then entries of
            // name_type (1) + name length (2) + name.
            let sni = hello.get(offset..offset + ext_len)?;
            let mut pos = 2;
            while pos + 3 <= sni.len() {
                let name_type = sni[pos];
                let name_len = u16::from_be_bytes([sni[pos + 1], sni[pos + 2]]) as usize;
                pos += 3;
                if name_type == 0x00 && pos + name_len <= sni.len() {
                    if let Ok(host) = std::str::from_utf8(&sni[pos..pos + name_len]) {
                        return Some(host.to_string());
                    }
                }
                pos += name_len;
            }
        }
        offset += ext_len;
    }
    None
}

/// Stream adapter that replays already-peeked bytes before the real stream.
#[derive(Debug)]
pub struct Prefixed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Prefixed<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Per-handshake leaf resolver. Prefers the ClientHello SNI; a client that
/// sent none gets a leaf for the CONNECT authority host.
pub struct LeafResolver {
    ca: Arc<CertificateAuthority>,
    fallback_host: String,
}

impl LeafResolver {
    pub fn new(ca: Arc<CertificateAuthority>, fallback_host: impl Into<String>) -> Self {
        Self {
            ca,
            fallback_host: fallback_host.into(),
        }
    }
}

impl std::fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafResolver")
            .field("fallback_host", &self.fallback_host)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.fallback_host.clone());
        match self.ca.issue_leaf(&host) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(host, error = %err, "leaf issuance failed during handshake");
                None
            }
        }
    }
}

/// Terminate the client side of an intercepted tunnel.
///
/// `peeked` is whatever was read to classify the preface; it is replayed so
/// rustls sees the complete ClientHello.
pub async fn terminate_tls<S>(
    ca: Arc<CertificateAuthority>,
    fallback_host: &str,
    peeked: Bytes,
    stream: S,
) -> Result<tokio_rustls::server::TlsStream<Prefixed<S>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let resolver = Arc::new(LeafResolver::new(ca, fallback_host));
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let acceptor = TlsAcceptor::from(Arc::new(config));
    acceptor
        .accept(Prefixed::new(peeked, stream))
        .await
        .map_err(|e| ProxyError::Handshake(e.to_string()))
}

/// Relay a non-TLS tunnel verbatim. `peeked` is forwarded upstream first so
/// no client bytes are lost to classification.
pub async fn tunnel<C, U>(mut client: C, mut upstream: U, peeked: Bytes) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if !peeked.is_empty() {
        upstream.write_all(&peeked).await?;
    }
    let (to_upstream, to_client) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(to_upstream, to_client, "tunnel closed");
    Ok((to_upstream + peeked.len() as u64, to_client))
}

/// Read the client's first bytes inside an accepted tunnel, starting from
/// anything already consumed off the socket. Classification needs the full
/// three-byte record prefix, so short first segments are read past until
/// enough bytes arrive or the client closes.
pub async fn peek_preface<S: AsyncRead + Unpin>(stream: &mut S, initial: Bytes) -> Result<Bytes> {
    let mut buf = BytesMut::from(&initial[..]);
    while buf.len() < 3 {
        if stream.read_buf(&mut buf).await? == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rustls::pki_types::ServerName;
    use tokio::io::AsyncReadExt;

    #[rstest]
    #[case::tls12_hello(&[0x16, 0x03, 0x01, 0x00, 0x10], Preface::Tls { sni: None })]
    #[case::tls13_hello(&[0x16, 0x03, 0x03, 0x01, 0x00], Preface::Tls { sni: None })]
    #[case::http_get(b"GET / HTTP/1.1\r\n", Preface::Passthrough)]
    #[case::ssh_banner(b"SSH-2.0-OpenSSH", Preface::Passthrough)]
    #[case::too_short(&[0x16], Preface::Passthrough)]
    #[case::wrong_version(&[0x16, 0x02, 0x01], Preface::Passthrough)]
    fn preface_classification(#[case] prefix: &[u8], #[case] expected: Preface) {
        assert_eq!(classify_preface(prefix), expected);
    }

    /// Minimal but structurally valid ClientHello carrying one SNI entry.
    fn synthetic_client_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list length
        sni_ext.push(0x00); // name_type host_name
        sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(name);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0x0000u16.to_be_bytes()); // server_name
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // client version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id length
        hello.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
        hello.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
        hello.push(1); // compression methods length
        hello.push(0x00); // null compression
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![0x01]; // client_hello
        let len = (hello.len() as u32).to_be_bytes();
        handshake.extend_from_slice(&len[1..]); // 3-byte length
        handshake.extend_from_slice(&hello);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn sni_extracted_from_client_hello() {
        let record = synthetic_client_hello("secure.example.test");
        assert_eq!(extract_sni(&record).as_deref(), Some("secure.example.test"));
        assert_eq!(
            classify_preface(&record),
            Preface::Tls {
                sni: Some("secure.example.test".into())
            }
        );
    }

    #[test]
    fn truncated_hello_yields_no_sni() {
        let record = synthetic_client_hello("secure.example.test");
        for cut in [3, 6, 40, record.len() - 4] {
            assert_eq!(extract_sni(&record[..cut]), None);
        }
    }

    /// Yields one stored segment per read, then EOF; models a peer whose
    /// first bytes arrive split across TCP segments.
    struct SegmentedReader {
        segments: std::collections::VecDeque<Vec<u8>>,
    }

    impl AsyncRead for SegmentedReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            if let Some(mut segment) = this.segments.pop_front() {
                let n = segment.len().min(buf.remaining());
                buf.put_slice(&segment[..n]);
                if n < segment.len() {
                    segment.drain(..n);
                    this.segments.push_front(segment);
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn preface_split_across_segments_still_classified_as_tls() {
        let record = synthetic_client_hello("split.example.test");
        let (head, tail) = record.split_at(2);
        let mut stream = SegmentedReader {
            segments: [head.to_vec(), tail.to_vec()].into(),
        };
        let peeked = peek_preface(&mut stream, Bytes::new()).await.unwrap();
        assert!(peeked.len() >= 3);
        assert!(matches!(classify_preface(&peeked), Preface::Tls { .. }));
    }

    #[tokio::test]
    async fn short_peeked_leftover_is_extended_before_classifying() {
        let record = synthetic_client_hello("split.example.test");
        let (head, tail) = record.split_at(2);
        let mut stream = SegmentedReader {
            segments: [tail.to_vec()].into(),
        };
        let peeked = peek_preface(&mut stream, Bytes::copy_from_slice(head))
            .await
            .unwrap();
        assert!(matches!(classify_preface(&peeked), Preface::Tls { .. }));
    }

    #[tokio::test]
    async fn eof_inside_short_prefix_is_passthrough() {
        let mut stream = SegmentedReader {
            segments: [vec![0x16]].into(),
        };
        let peeked = peek_preface(&mut stream, Bytes::new()).await.unwrap();
        assert_eq!(classify_preface(&peeked), Preface::Passthrough);
    }

    #[tokio::test]
    async fn prefixed_stream_replays_before_inner() {
        let inner: &[u8] = b" world";
        let mut stream = Prefixed::new(Bytes::from_static(b"hello"), inner);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn tunnel_forwards_peeked_bytes_first() {
        let (client, mut client_far) = tokio::io::duplex(1024);
        let (upstream, mut upstream_far) = tokio::io::duplex(1024);

        let relay = tokio::spawn(tunnel(client, upstream, Bytes::from_static(b"peeked-")));

        let mut received = vec![0u8; 7];
        upstream_far.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"peeked-");

        upstream_far.write_all(b"reply").await.unwrap();
        drop(upstream_far);
        let mut back = String::new();
        client_far.read_to_string(&mut back).await.unwrap();
        assert_eq!(back, "reply");
        drop(client_far);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn terminate_tls_presents_sni_matching_leaf() {
        let ca = CertificateAuthority::ephemeral().unwrap();
        let (client_side, server_side) = tokio::io::duplex(16 * 1024);

        let server_ca = ca.clone();
        let server = tokio::spawn(async move {
            let mut tls = terminate_tls(server_ca, "fallback.test", Bytes::new(), server_side)
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            tls.write_all(b"pong").await.unwrap();
            tls.shutdown().await.unwrap();
        });

        // Client trusts exactly the proxy's root.
        let mut roots = rustls::RootCertStore::empty();
        let pem = ca.ca_cert_pem();
        for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from("secure.example.test").unwrap();

        let mut tls = connector.connect(name, client_side).await.unwrap();
        tls.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        tls.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_failure_maps_to_handshake_error() {
        let ca = CertificateAuthority::ephemeral().unwrap();
        let (client_side, server_side) = tokio::io::duplex(1024);

        let server = tokio::spawn(async move {
            terminate_tls(ca, "fallback.test", Bytes::new(), server_side).await
        });

        // Garbage instead of a ClientHello.
        let mut client = client_side;
        client.write_all(b"definitely not tls").await.unwrap();
        drop(client);

        let err = server.await.unwrap().expect_err("handshake must fail");
        assert_eq!(err.kind(), "HandshakeError");
    }
}
