// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use proxenet::ca::CertificateAuthority;
use proxenet::config::{ChainKind, Config, InterceptMode};
use proxenet::hooks::EngineSet;
use proxenet::runtime::ProxyRuntime;
use proxenet::{logging, proxy};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "proxenet", version, about = "Interception proxy with ordered traffic hooks")]
struct Args {
    /// Optional TOML config path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8008
    #[arg(short, long)]
    listen: Option<String>,

    /// Maximum number of concurrent sessions
    #[arg(short, long)]
    threads: Option<usize>,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory scanned for hook files
    #[arg(long)]
    hooks_dir: Option<PathBuf>,

    /// Forward through an HTTP proxy (host:port)
    #[arg(long, conflicts_with_all = ["socks4", "socks4a"])]
    proxy: Option<String>,

    /// Forward through a SOCKS4 proxy (host:port)
    #[arg(long, conflicts_with = "socks4a")]
    socks4: Option<String>,

    /// Forward through a SOCKS4a proxy (host:port)
    #[arg(long)]
    socks4a: Option<String>,

    /// Tunnel every CONNECT instead of splitting TLS
    #[arg(long)]
    no_intercept: bool,

    /// Only intercept hosts matching this glob
    #[arg(long, conflicts_with = "intercept_except")]
    intercept_only: Option<String>,

    /// Intercept every host except those matching this glob
    #[arg(long)]
    intercept_except: Option<String>,

    /// Path of the control socket
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Create missing CA certificate and keys before starting
    #[arg(long)]
    generate_ca: bool,
}

impl Args {
    /// Command line values win over the config file.
    fn apply(&self, cfg: &mut Config) {
        if let Some(listen) = &self.listen {
            cfg.general.listen = listen.clone();
        }
        if let Some(threads) = self.threads {
            cfg.general.threads = threads;
        }
        cfg.general.verbose = cfg.general.verbose.max(self.verbose);
        if let Some(dir) = &self.hooks_dir {
            cfg.hooks.dir = dir.clone();
        }
        let chain = [
            (&self.proxy, ChainKind::Http),
            (&self.socks4, ChainKind::Socks4),
            (&self.socks4a, ChainKind::Socks4a),
        ];
        if let Some((addr, kind)) = chain
            .into_iter()
            .find_map(|(addr, kind)| addr.as_ref().map(|a| (a, kind)))
        {
            cfg.upstream.proxy = Some(addr.clone());
            cfg.upstream.kind = kind;
        }
        if self.no_intercept {
            cfg.tls.intercept = false;
        }
        if let Some(pattern) = &self.intercept_only {
            cfg.tls.intercept_mode = InterceptMode::Only;
            cfg.tls.intercept_pattern = pattern.clone();
        }
        if let Some(pattern) = &self.intercept_except {
            cfg.tls.intercept_mode = InterceptMode::Except;
            cfg.tls.intercept_pattern = pattern.clone();
        }
        if let Some(path) = &self.control_socket {
            cfg.general.control_socket = path.clone();
        }
    }
}

fn load_config(args: &Args) -> Config {
    match &args.config {
        Some(p) => Config::load_from_path(p).unwrap_or_else(|e| {
            warn!(path = %p.display(), error = %format!("{:#}", e), "failed to load config, using defaults");
            Config::default()
        }),
        None => Config::default(),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = logging::init(args.verbose)?;

    let mut cfg = load_config(&args);
    args.apply(&mut cfg);
    cfg.validate()?;
    if cfg.general.verbose > args.verbose {
        log.set_level(cfg.general.verbose)?;
    }

    if args.generate_ca
        && CertificateAuthority::bootstrap(&cfg.tls.ca_cert, &cfg.tls.ca_key, &cfg.tls.certs_key)?
    {
        info!(cert = %cfg.tls.ca_cert.display(), "CA material generated");
    }

    let rt = Arc::new(ProxyRuntime::new(cfg, EngineSet::bundled(), Some(log))?);

    let signal_rt = rt.clone();
    ctrlc::set_handler(move || {
        info!("signal received, shutting down");
        signal_rt.request_shutdown();
    })?;

    proxy::run_proxy(rt)
}
