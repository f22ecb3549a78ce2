// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Hard upper bound on concurrent sessions; the slot bitmask is a `u64`.
pub const MAX_THREADS: usize = 64;
pub const MAX_VERBOSE_LEVEL: u8 = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Listen address, e.g. 127.0.0.1:8008 or [::1]:8008
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Session pool capacity
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub verbose: u8,

    /// Path of the control plane Unix socket
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Seconds a session may stay idle before it is closed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_listen() -> String {
    "127.0.0.1:8008".to_string()
}

fn default_threads() -> usize {
    10
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/tmp/proxenet-control-socket")
}

fn default_idle_timeout() -> u64 {
    5
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            threads: default_threads(),
            verbose: 0,
            control_socket: default_control_socket(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterceptMode {
    /// Intercept only hosts matching the pattern
    #[default]
    Only,
    /// Intercept every host except those matching the pattern
    Except,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Split TLS on CONNECT. When false every CONNECT is tunnelled.
    #[serde(default = "default_true")]
    pub intercept: bool,
    #[serde(default = "default_ca_cert")]
    pub ca_cert: PathBuf,
    #[serde(default = "default_ca_key")]
    pub ca_key: PathBuf,
    /// Key shared by every minted leaf certificate
    #[serde(default = "default_certs_key")]
    pub certs_key: PathBuf,
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,
    #[serde(default)]
    pub intercept_mode: InterceptMode,
    #[serde(default = "default_pattern")]
    pub intercept_pattern: String,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Origins (glob) that receive the client certificate
    #[serde(default = "default_pattern")]
    pub client_domain: String,
}

fn default_true() -> bool {
    true
}

fn default_ca_cert() -> PathBuf {
    PathBuf::from("keys/proxenet.crt")
}

fn default_ca_key() -> PathBuf {
    PathBuf::from("keys/proxenet.key")
}

fn default_certs_key() -> PathBuf {
    PathBuf::from("keys/certs/proxenet-leaf.key")
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("keys/certs")
}

fn default_pattern() -> String {
    "*".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            intercept: true,
            ca_cert: default_ca_cert(),
            ca_key: default_ca_key(),
            certs_key: default_certs_key(),
            certs_dir: default_certs_dir(),
            intercept_mode: InterceptMode::default(),
            intercept_pattern: default_pattern(),
            client_cert: None,
            client_key: None,
            client_domain: default_pattern(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HooksConfig {
    #[serde(default = "default_hooks_dir")]
    pub dir: PathBuf,
}

fn default_hooks_dir() -> PathBuf {
    PathBuf::from("hooks")
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            dir: default_hooks_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    #[default]
    Http,
    Socks4,
    Socks4a,
}

impl std::fmt::Display for ChainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChainKind::Http => "http",
            ChainKind::Socks4 => "socks4",
            ChainKind::Socks4a => "socks4a",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpstreamConfig {
    /// Forwarding proxy as host:port
    pub proxy: Option<String>,
    #[serde(default)]
    pub kind: ChainKind,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub hooks: HooksConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    ///
    /// ```toml
    /// [general]
    /// listen = "127.0.0.1:8008"
    /// threads = 10
    ///
    /// [tls]
    /// intercept_mode = "except"
    /// intercept_pattern = "*.internal"
    ///
    /// [upstream]
    /// proxy = "127.0.0.1:9050"
    /// kind = "socks4a"
    /// ```
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let s = std::fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read config {}", path_ref.display()))?;
        let cfg: Self = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.threads == 0 || self.general.threads > MAX_THREADS {
            bail!(
                "general.threads must be between 1 and {}, got {}",
                MAX_THREADS,
                self.general.threads
            );
        }
        if self.general.verbose > MAX_VERBOSE_LEVEL {
            bail!(
                "general.verbose must be at most {}, got {}",
                MAX_VERBOSE_LEVEL,
                self.general.verbose
            );
        }
        if self.general.idle_timeout_secs == 0 || self.general.idle_timeout_secs > 60 {
            bail!(
                "general.idle_timeout_secs must be between 1 and 60, got {}",
                self.general.idle_timeout_secs
            );
        }
        glob::Pattern::new(&self.tls.intercept_pattern).with_context(|| {
            format!("invalid intercept pattern '{}'", self.tls.intercept_pattern)
        })?;
        glob::Pattern::new(&self.tls.client_domain)
            .with_context(|| format!("invalid client domain '{}'", self.tls.client_domain))?;
        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            bail!("tls.client_cert and tls.client_key must be set together");
        }
        if let Some(proxy) = &self.upstream.proxy {
            crate::http::split_host_port(proxy, 0)
                .filter(|(_, port)| *port != 0)
                .with_context(|| format!("upstream.proxy must be host:port, got '{}'", proxy))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use uuid::Uuid;

    fn write_tmp(contents: &str) -> anyhow::Result<PathBuf> {
        let tmp = std::env::temp_dir().join(format!("proxenet_cfg_test_{}.toml", Uuid::new_v4()));
        std::fs::write(&tmp, contents)?;
        Ok(tmp)
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.general.threads, 10);
        assert_eq!(cfg.general.idle_timeout_secs, 5);
        assert!(cfg.tls.intercept);
        assert_eq!(cfg.tls.intercept_pattern, "*");
        assert!(cfg.upstream.proxy.is_none());
    }

    #[test]
    fn load_empty_file_uses_defaults() -> anyhow::Result<()> {
        let tmp = write_tmp("")?;
        let cfg = Config::load_from_path(&tmp)?;
        assert_eq!(cfg.general.listen, "127.0.0.1:8008");
        assert_eq!(cfg.hooks.dir, PathBuf::from("hooks"));
        std::fs::remove_file(&tmp)?;
        Ok(())
    }

    #[test]
    fn load_toml_file() -> anyhow::Result<()> {
        let tmp = write_tmp(
            r#"[general]
listen = "[::1]:3128"
threads = 4
verbose = 2

[tls]
intercept_mode = "except"
intercept_pattern = "*.bank.example"

[hooks]
dir = "/srv/hooks"

[upstream]
proxy = "127.0.0.1:9050"
kind = "socks4a"
"#,
        )?;
        let cfg = Config::load_from_path(&tmp)?;
        assert_eq!(cfg.general.listen, "[::1]:3128");
        assert_eq!(cfg.general.threads, 4);
        assert_eq!(cfg.general.verbose, 2);
        assert_eq!(cfg.tls.intercept_mode, InterceptMode::Except);
        assert_eq!(cfg.hooks.dir, PathBuf::from("/srv/hooks"));
        assert_eq!(cfg.upstream.kind, ChainKind::Socks4a);
        std::fs::remove_file(&tmp)?;
        Ok(())
    }

    #[rstest]
    #[case("[general]\nthreads = 0\n", "general.threads")]
    #[case("[general]\nthreads = 65\n", "general.threads")]
    #[case("[general]\nverbose = 9\n", "general.verbose")]
    #[case("[general]\nidle_timeout_secs = 0\n", "idle_timeout_secs")]
    #[case("[tls]\nintercept_pattern = \"[\"\n", "intercept pattern")]
    #[case("[tls]\nclient_cert = \"c.pem\"\n", "set together")]
    #[case("[upstream]\nproxy = \"nohost\"\n", "upstream.proxy")]
    fn invalid_configs_are_rejected(
        #[case] toml: &str,
        #[case] needle: &str,
    ) -> anyhow::Result<()> {
        let tmp = write_tmp(toml)?;
        let res = Config::load_from_path(&tmp);
        std::fs::remove_file(&tmp)?;
        let err = match res {
            Ok(_) => panic!("expected error for {:?}", toml),
            Err(e) => format!("{:#}", e),
        };
        assert!(err.contains(needle), "{} does not mention {}", err, needle);
        Ok(())
    }

    #[test]
    fn unknown_chain_kind_is_a_parse_error() -> anyhow::Result<()> {
        let tmp = write_tmp("[upstream]\nproxy = \"p:1\"\nkind = \"socks5\"\n")?;
        assert!(Config::load_from_path(&tmp).is_err());
        std::fs::remove_file(&tmp)?;
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        let p = std::env::temp_dir().join(format!("proxenet_missing_{}.toml", Uuid::new_v4()));
        assert!(Config::load_from_path(&p).is_err());
    }
}
