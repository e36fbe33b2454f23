// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use prism_proxy::ca::CertificateAuthority;
use prism_proxy::config::Config;
use prism_proxy::pipeline::ProxyShared;
use prism_proxy::proxy;
use prism_proxy::rules::RuleEngine;

#[derive(Parser, Debug)]
#[command(name = "prism-proxy")]
struct Args {
    /// Listen address, overrides the config file, e.g. 127.0.0.1:8888
    #[arg(long)]
    listen: Option<String>,

    /// Optional TOML config path (listener, CA paths, rules)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut config = if let Some(path) = &args.config {
        Config::load(path).await.unwrap_or_else(|e| {
            warn!(path = %path.display(), %e, "failed to load config, using defaults");
            Config::default()
        })
    } else {
        Config::default()
    };
    if let Some(listen) = &args.listen {
        config.general.listen = listen.parse()?;
    }

    // Bad rule patterns are a startup failure, not a per-request surprise.
    let rules = config.compiled_rules()?;
    let ca = CertificateAuthority::load_or_generate(&config.tls.ca_cert, &config.tls.ca_key).await?;
    let shared = Arc::new(ProxyShared::from_config(ca, RuleEngine::new(rules), &config)?);

    let server = proxy::run_proxy(config, shared);

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(%e, "server error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
