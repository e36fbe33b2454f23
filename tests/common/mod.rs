// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

use anyhow::Result;
use prism_proxy::ca::CertificateAuthority;
use prism_proxy::codec::HttpCodec;
use prism_proxy::config::Config;
use prism_proxy::pipeline::ProxyShared;
use prism_proxy::proxy;
use prism_proxy::rules::{Rule, RuleEngine, RuleSet};
use prism_proxy::transaction::ResponseInfo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

pub struct TestProxy {
    pub addr: SocketAddr,
    pub shared: Arc<ProxyShared>,
    pub server: tokio::task::JoinHandle<prism_proxy::error::Result<()>>,
}

/// Spawn a proxy on an ephemeral port that accepts `connections` clients
/// and then returns, so tests get a clean join.
pub async fn spawn_proxy(rules: Vec<Rule>, connections: usize) -> Result<TestProxy> {
    spawn_proxy_with_config(Config::default(), rules, connections).await
}

pub async fn spawn_proxy_with_config(
    config: Config,
    rules: Vec<Rule>,
    connections: usize,
) -> Result<TestProxy> {
    let ca = CertificateAuthority::ephemeral()?;
    let engine = RuleEngine::new(RuleSet::compile(rules)?);
    let shared = Arc::new(ProxyShared::from_config(ca, engine, &config)?);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(proxy::run_proxy_with_limit(
        listener,
        Arc::new(config),
        shared.clone(),
        Some(connections),
    ));
    Ok(TestProxy {
        addr,
        shared,
        server,
    })
}

/// One absolute-form request over a fresh proxy connection.
pub async fn proxy_get(proxy_addr: SocketAddr, url: &str) -> Result<ResponseInfo> {
    let mut client = connect(proxy_addr).await?;
    let response = send_get(&mut client, url).await?;
    Ok(response)
}

pub async fn connect(proxy_addr: SocketAddr) -> Result<HttpCodec<TcpStream>> {
    Ok(HttpCodec::new(TcpStream::connect(proxy_addr).await?))
}

pub async fn send_get(client: &mut HttpCodec<TcpStream>, url: &str) -> Result<ResponseInfo> {
    let host = url
        .strip_prefix("http://")
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or_default();
    let wire = format!("GET {url} HTTP/1.1\r\nhost: {host}\r\n\r\n");
    client.write_all(wire.as_bytes()).await?;
    Ok(client.read_response("GET").await?)
}
