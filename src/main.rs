mod config;
mod tcp_proxy;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use config::Config;

use reqwest::Url;

use anyhow::{Context, Result};
use asset_host_proxy::RewriteEngine;
use clap::{ArgAction, Parser};
use log::{debug, info, trace};

use crate::tcp_proxy::RewriteProxy;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Proxy HTTP traffic to a backend, moving asset URLs in HTML and CSS responses from the public domain to the origin domain.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLineConf {
    /// TOML config file.
    #[clap(short, long, value_name = "/path/to/config.toml", conflicts_with_all(&["upstream", "listen", "source_domain", "target_domain"]))]
    config: Option<PathBuf>,

    /// URL of the backend server whose responses are rewritten.
    #[clap(short = 'u', long, value_name = "URL", required_unless_present("config"), value_parser = Url::parse)]
    upstream: Option<Url>,

    /// IP address & port where to bind proxy (default: 127.0.0.1:8080).
    #[clap(short = 'l', long, value_name = "IP:PORT", value_parser)]
    listen: Option<SocketAddr>,

    /// Domain to look for in asset URLs.
    #[clap(short = 's', long, value_name = "DOMAIN", required_unless_present("config"))]
    source_domain: Option<String>,

    /// Domain asset URLs are moved to.
    #[clap(short = 't', long, value_name = "DOMAIN", required_unless_present("config"))]
    target_domain: Option<String>,

    /// TCP connect timeout for proxy connections to the upstream, in seconds.
    #[clap(long, value_name = "SECONDS")]
    proxy_timeout: Option<u64>,

    /// TCP read/write timeout for active proxy streams, in seconds.
    #[clap(long, value_name = "SECONDS")]
    stream_timeout: Option<u64>,

    /// Verbosity level. The more v, the more verbose.
    #[clap(short, long, action=ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommandLineConf::parse();

    let config = Config::try_from(args)?;

    init_logging(config.verbose)?;

    println!("asset-host-proxy v{}", VERSION);

    let upstream = config::sockaddr_from_url(&config.upstream)?;

    let engine = RewriteEngine::new(config.source, config.target, Arc::new(config.rules))
        .context("Invalid source/target domain pair")?;

    debug!(target: "assetproxy", "Upstream: '{}', rules: {}, verbosity: {}",
           config.upstream, engine.rules().rules().len(), config.verbose);

    let proxy = RewriteProxy::new(Arc::new(engine), config.proxy_timeout, config.stream_timeout);

    let _tcp_proxy_thread = proxy
        .start(upstream, config.listen)
        .with_context(|| format!("Unable to bind proxy addr {}", config.listen))?;

    trace!(target: "assetproxy", "server: {}", upstream);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;

    info!(target: "assetproxy", "Shutting down");

    Ok(())
}

fn init_logging(verbosity: log::LevelFilter) -> Result<log::LevelFilter> {
    fern::Dispatch::new().
        format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        }).
        // by default only accept warning messages from libraries so we don't spam
        level(log::LevelFilter::Warn).
        // but accept Info and Debug and Trace for our app.
        level_for("assetproxy", verbosity).
        chain(std::io::stdout()).
        apply().
            context("Failed to configure logging.")?;

    Ok(verbosity)
}
