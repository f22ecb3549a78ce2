// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Setting up a session's legs: TLS split on CONNECT, raw tunnels for hosts
//! left alone, and plain upstream connections for absolute-URI requests.

use crate::ca::CertificateAuthority;
use crate::config::{InterceptMode, TlsConfig};
use crate::connection::Leg;
use crate::http::{self, AbsoluteUri, RequestLine, Scheme};
use crate::runtime::ProxyRuntime;
use crate::session::{Session, Target};
use crate::upstream;
use anyhow::{Context, Result, anyhow, bail};
use glob::{MatchOptions, Pattern};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, ServerConfig, ServerConnection,
    SignatureScheme, StreamOwned,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Which hosts get their TLS split and their traffic hooked.
#[derive(Debug, Clone)]
pub struct InterceptRules {
    enabled: bool,
    mode: InterceptMode,
    pattern: Pattern,
}

impl InterceptRules {
    pub fn new(enabled: bool, mode: InterceptMode, pattern: &str) -> Result<Self> {
        let pattern = Pattern::new(pattern)
            .with_context(|| format!("invalid intercept pattern '{}'", pattern))?;
        Ok(Self {
            enabled,
            mode,
            pattern,
        })
    }

    pub fn from_config(tls: &TlsConfig) -> Result<Self> {
        Self::new(tls.intercept, tls.intercept_mode, &tls.intercept_pattern)
    }

    /// Whether traffic for `host` goes through the hooks.
    pub fn matches(&self, host: &str) -> bool {
        let hit = self.pattern.matches_with(host, MATCH);
        match self.mode {
            InterceptMode::Only => hit,
            InterceptMode::Except => !hit,
        }
    }

    /// Whether a CONNECT to `host` is split rather than tunnelled.
    pub fn should_split(&self, host: &str) -> bool {
        self.enabled && self.matches(host)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn describe(&self) -> String {
        let mode = match self.mode {
            InterceptMode::Only => "only",
            InterceptMode::Except => "except",
        };
        format!("{} '{}'", mode, self.pattern.as_str())
    }
}

/// Accepts any origin certificate: the upstream leg is not validated.
#[derive(Debug)]
struct NoCertVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS configuration for both sides of a split, with server configs cached per host.
pub struct TlsEngine {
    provider: Arc<CryptoProvider>,
    ca: Option<Arc<CertificateAuthority>>,
    upstream: Arc<ClientConfig>,
    upstream_with_cert: Option<Arc<ClientConfig>>,
    client_domain: Pattern,
    server_configs: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl TlsEngine {
    /// Without a CA the engine can still open upstream TLS legs, but cannot
    /// impersonate origins.
    pub fn new(ca: Option<Arc<CertificateAuthority>>, tls: &TlsConfig) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let upstream = Arc::new(client_config(&provider, None)?);
        let upstream_with_cert = match (&tls.client_cert, &tls.client_key) {
            (Some(cert), Some(key)) => {
                let certs = load_certs(cert)?;
                let key = load_key(key)?;
                info!(cert = %cert.display(), domain = %tls.client_domain, "upstream client certificate loaded");
                Some(Arc::new(client_config(&provider, Some((certs, key)))?))
            }
            _ => None,
        };
        let client_domain = Pattern::new(&tls.client_domain)
            .with_context(|| format!("invalid client domain '{}'", tls.client_domain))?;
        Ok(Self {
            provider,
            ca,
            upstream,
            upstream_with_cert,
            client_domain,
            server_configs: RwLock::new(HashMap::new()),
        })
    }

    pub fn authority(&self) -> Option<&Arc<CertificateAuthority>> {
        self.ca.as_ref()
    }

    /// Server config presenting the leaf certificate for `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        {
            let cache = self
                .server_configs
                .read()
                .map_err(|e| anyhow!("TLS config cache poisoned: {}", e))?;
            if let Some(cfg) = cache.get(host) {
                debug!(%host, "server config cache hit");
                return Ok(cfg.clone());
            }
        }

        let ca = self
            .ca
            .as_ref()
            .ok_or_else(|| anyhow!("no certificate authority loaded, cannot intercept {}", host))?;
        let cert_path = ca.obtain_certificate(host)?;
        let certs = load_certs(&cert_path)?;
        let mut cfg = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, ca.leaf_key_der())
            .with_context(|| format!("leaf certificate for {} does not match the leaf key", host))?;
        cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
        let cfg = Arc::new(cfg);

        let mut cache = self
            .server_configs
            .write()
            .map_err(|e| anyhow!("TLS config cache poisoned: {}", e))?;
        Ok(cache.entry(host.to_string()).or_insert(cfg).clone())
    }

    /// Client config for `host`, carrying the client certificate when its domain matches.
    pub fn client_config(&self, host: &str) -> Arc<ClientConfig> {
        match &self.upstream_with_cert {
            Some(cfg) if self.client_domain.matches_with(host, MATCH) => cfg.clone(),
            _ => self.upstream.clone(),
        }
    }

    /// TLS handshake towards the origin over `tcp`, the proxy acting as client.
    pub fn connect_origin(&self, host: &str, mut tcp: TcpStream) -> Result<Leg> {
        let name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid TLS server name {:?}", host))?;
        let mut conn = ClientConnection::new(self.client_config(host), name)?;
        tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        tcp.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .with_context(|| format!("TLS handshake with origin {} failed", host))?;
        }
        while conn.wants_write() {
            conn.write_tls(&mut tcp)?;
        }
        tcp.set_read_timeout(None)?;
        tcp.set_write_timeout(None)?;
        debug!(%host, version = ?conn.protocol_version(), "origin TLS established");
        Ok(Leg::TlsClient(Box::new(StreamOwned::new(conn, tcp))))
    }

    /// TLS handshake with the client over `tcp`, impersonating `host`.
    ///
    /// On failure the socket is handed back so the caller closes it.
    pub fn accept_client(
        &self,
        host: &str,
        mut tcp: TcpStream,
    ) -> std::result::Result<Leg, (TcpStream, anyhow::Error)> {
        let cfg = match self.server_config(host) {
            Ok(cfg) => cfg,
            Err(e) => return Err((tcp, e)),
        };
        let mut conn = match ServerConnection::new(cfg) {
            Ok(conn) => conn,
            Err(e) => return Err((tcp, e.into())),
        };
        let result = (|| -> Result<()> {
            tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
            tcp.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;
            while conn.is_handshaking() {
                conn.complete_io(&mut tcp)
                    .with_context(|| format!("TLS handshake with client for {} failed", host))?;
            }
            // session tickets queued by the last flight
            while conn.wants_write() {
                conn.write_tls(&mut tcp)?;
            }
            tcp.set_read_timeout(None)?;
            tcp.set_write_timeout(None)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                debug!(%host, version = ?conn.protocol_version(), "client TLS established");
                Ok(Leg::TlsServer(Box::new(StreamOwned::new(conn, tcp))))
            }
            Err(e) => Err((tcp, e)),
        }
    }
}

fn client_config(
    provider: &Arc<CryptoProvider>,
    client_auth: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerifier(provider.clone())));
    let mut cfg = match client_auth {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .context("invalid upstream client certificate")?,
        None => builder.with_no_client_auth(),
    };
    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(cfg)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {:?}", path))?;
    if certs.is_empty() {
        bail!("no certificate found in {:?}", path);
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse key in {:?}", path))?
        .ok_or_else(|| anyhow!("no private key found in {:?}", path))
}

/// What the first client message turned the session into.
#[derive(Debug, PartialEq, Eq)]
pub enum Established {
    /// Both TLS legs are up; the CONNECT message was consumed.
    Intercepted,
    /// CONNECT answered; bytes now flow untouched in both directions.
    Tunnel,
    /// Not a CONNECT: the upstream is open and this message still has to
    /// be relayed.
    Passthrough(Vec<u8>),
}

/// Build the session's legs from the first client message.
///
/// Any leg opened before a failure is left in the session, which closes it.
pub fn establish(rt: &ProxyRuntime, session: &mut Session, first: &[u8]) -> Result<Established> {
    let line = RequestLine::parse(first).context("malformed request line")?;
    if line.is_connect() {
        let (host, port) = http::connect_target(&line)
            .with_context(|| format!("bad CONNECT target {:?}", line.target))?;
        if rt.rules().should_split(&host) {
            intercept(rt, session, &host, port, first)?;
            Ok(Established::Intercepted)
        } else {
            tunnel(rt, session, &host, port, first)?;
            Ok(Established::Tunnel)
        }
    } else {
        let message = open_for_request(rt, session, first)?;
        Ok(Established::Passthrough(message))
    }
}

fn intercept(
    rt: &ProxyRuntime,
    session: &mut Session,
    host: &str,
    port: u16,
    request: &[u8],
) -> Result<()> {
    info!(session = %session.id(), %host, port, "intercepting");
    let tcp = upstream::open_tunnel(rt.route(), host, port, Some(request))?;
    session.upstream = Some(rt.tls().connect_origin(host, tcp)?);

    session.answer_connect()?;

    let client = session.take_client_tcp()?;
    match rt.tls().accept_client(host, client) {
        Ok(leg) => session.client = Some(leg),
        Err((tcp, e)) => {
            session.client = Some(Leg::Plain(tcp));
            return Err(e);
        }
    }
    session.is_ssl = true;
    session.hooks_enabled = true;
    session.target = Some(Target {
        scheme: Scheme::Https,
        host: host.to_string(),
        port,
    });
    Ok(())
}

fn tunnel(
    rt: &ProxyRuntime,
    session: &mut Session,
    host: &str,
    port: u16,
    request: &[u8],
) -> Result<()> {
    info!(session = %session.id(), %host, port, "tunnelling without interception");
    let tcp = upstream::open_tunnel(rt.route(), host, port, Some(request))?;
    session.upstream = Some(Leg::Plain(tcp));
    session.answer_connect()?;
    session.tunnel = true;
    session.hooks_enabled = false;
    session.target = Some(Target {
        scheme: Scheme::Https,
        host: host.to_string(),
        port,
    });
    Ok(())
}

/// Open the upstream a plaintext request goes to and return the bytes to send.
///
/// Direct sessions need an absolute URI, which is rewritten to origin form.
/// Through an HTTP forwarding proxy the request is sent as received.
pub(crate) fn open_for_request(
    rt: &ProxyRuntime,
    session: &mut Session,
    request: &[u8],
) -> Result<Vec<u8>> {
    if rt.route().is_http_chain() {
        let host = RequestLine::parse(request)
            .and_then(|l| AbsoluteUri::parse(l.target))
            .map(|u| u.host)
            .unwrap_or_default();
        let tcp = upstream::open_plain(rt.route(), &host, 0)?;
        session.upstream = Some(Leg::Plain(tcp));
        session.hooks_enabled = rt.rules().matches(&host);
        return Ok(request.to_vec());
    }

    let (uri, rewritten) =
        http::to_origin_form(request).context("request is not an absolute-URI HTTP request")?;
    debug!(session = %session.id(), host = %uri.host, port = uri.port, scheme = ?uri.scheme, "opening upstream");
    let tcp = upstream::open_plain(rt.route(), &uri.host, uri.port)?;
    let leg = match uri.scheme {
        Scheme::Http => Leg::Plain(tcp),
        Scheme::Https => rt.tls().connect_origin(&uri.host, tcp)?,
    };
    session.upstream = Some(leg);
    session.hooks_enabled = rt.rules().matches(&uri.host);
    if !session.hooks_enabled {
        warn!(session = %session.id(), host = %uri.host, "host excluded by intercept rules, hooks skipped");
    }
    session.target = Some(Target {
        scheme: uri.scheme,
        host: uri.host,
        port: uri.port,
    });
    Ok(rewritten)
}
