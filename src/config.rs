use anyhow::{anyhow, Context, Result};
use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs as _},
    time,
};

use asset_host_proxy::{Domain, RewriteRule, RuleTable};
use reqwest::Url;
use serde::Deserialize;

use crate::CommandLineConf;

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    upstream: Option<String>,
    listen: Option<String>,
    source_domain: Option<String>,
    target_domain: Option<String>,
    verbose: Option<u8>,
    proxy_timeout: Option<u64>,
    stream_timeout: Option<u64>,
    rules: Option<Vec<RewriteRule>>,
}

pub struct Config {
    pub upstream: Url,
    pub listen: SocketAddr,
    pub source: Domain,
    pub target: Domain,
    pub rules: RuleTable,
    pub verbose: log::LevelFilter,
    pub proxy_timeout: time::Duration,
    pub stream_timeout: time::Duration,
}

impl TryFrom<CommandLineConf> for Config {
    type Error = anyhow::Error;

    fn try_from(conf: CommandLineConf) -> std::result::Result<Self, Self::Error> {
        get_config(conf)
    }
}

fn get_config(args: CommandLineConf) -> Result<Config> {
    let config_as_file = args
        .config
        .as_ref()
        .map(|file| fs::read_to_string(file).context("Could not open/read config file."))
        .transpose()?;

    match config_as_file {
        Some(config_file) => config_from_toml(&config_file),
        None => config_from_args(args),
    }
}

fn config_from_toml(config_file: &str) -> Result<Config> {
    let raw_config: RawConfig =
        toml::from_str(config_file).context("failed to parse config file.")?;

    let upstream = raw_config
        .upstream
        .ok_or(anyhow!("Missing upstream URL"))
        .and_then(|s| Url::parse(&s).context("Bad upstream URL."))?;

    let listen: Option<SocketAddr> = raw_config
        .listen
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("Bad listen address")?;

    let rules = match raw_config.rules {
        Some(rules) => RuleTable::new(rules).context("Invalid [[rules]] table")?,
        None => RuleTable::default(),
    };

    build(
        upstream,
        listen,
        raw_config.source_domain,
        raw_config.target_domain,
        rules,
        raw_config.verbose,
        raw_config.proxy_timeout,
        raw_config.stream_timeout,
    )
}

fn config_from_args(args: CommandLineConf) -> Result<Config> {
    let upstream = args.upstream.ok_or(anyhow!("Missing upstream URL"))?;

    build(
        upstream,
        args.listen,
        args.source_domain,
        args.target_domain,
        RuleTable::default(),
        Some(args.verbose),
        args.proxy_timeout,
        args.stream_timeout,
    )
}

#[allow(clippy::too_many_arguments)]
fn build(
    upstream: Url,
    listen: Option<SocketAddr>,
    source_domain: Option<String>,
    target_domain: Option<String>,
    rules: RuleTable,
    verbose: Option<u8>,
    proxy_timeout: Option<u64>,
    stream_timeout: Option<u64>,
) -> Result<Config> {
    let source = source_domain
        .ok_or(anyhow!("Missing source domain"))
        .and_then(|s| Domain::parse(&s).context("Bad source domain."))?;

    let target = target_domain
        .ok_or(anyhow!("Missing target domain"))
        .and_then(|s| Domain::parse(&s).context("Bad target domain."))?;

    let listen = match listen {
        Some(addr) => addr,
        None => DEFAULT_LISTEN.parse()?,
    };

    let verbose = verbose.map_or(log::LevelFilter::Warn, |v| match v {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    });

    // Default: 10 seconds TCP connect timeout to the upstream
    let proxy_timeout = proxy_timeout
        .map(time::Duration::from_secs)
        .unwrap_or(time::Duration::from_secs(10));

    // Default: 300 seconds (5 minutes) TCP stream read/write timeout
    let stream_timeout = stream_timeout
        .map(time::Duration::from_secs)
        .unwrap_or(time::Duration::from_secs(300));

    Ok(Config {
        upstream,
        listen,
        source,
        target,
        rules,
        verbose,
        proxy_timeout,
        stream_timeout,
    })
}

pub fn sockaddr_from_url(url: &Url) -> Result<SocketAddr> {
    let host = url
        .host()
        .ok_or_else(|| anyhow!("URL has no host: {}", url))?;

    let port: u16 = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("URL has no port and unknown scheme: {}", url))?;

    let address = format!("{}:{}", host, port);

    let addresses: Vec<SocketAddr> = address
        .to_socket_addrs()
        .with_context(|| format!("Couldn't resolve or build socket address from URL: {}", url))?
        .collect();

    addresses
        .first()
        .copied()
        .ok_or_else(|| anyhow!("No valid socket address resolved for URL: {}", url))
}
