// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use proxenet::ca::CertificateAuthority;
use proxenet::config::Config;
use proxenet::hooks::EngineSet;
use proxenet::proxy::Proxy;
use proxenet::runtime::ProxyRuntime;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

/// Scratch directory holding CA material, hooks and the control socket.
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(prefix: &str) -> anyhow::Result<Self> {
        let root = std::env::temp_dir().join(format!("{}_{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("hooks"))?;
        Ok(Self { root })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Config listening on an ephemeral port with every path in this workspace.
    pub fn config(&self, intercept: bool) -> anyhow::Result<Config> {
        let mut cfg = Config::default();
        cfg.general.listen = "127.0.0.1:0".to_string();
        cfg.general.idle_timeout_secs = 2;
        cfg.general.control_socket = self.path("control.sock");
        cfg.hooks.dir = self.path("hooks");
        cfg.tls.intercept = intercept;
        cfg.tls.ca_cert = self.path("ca.crt");
        cfg.tls.ca_key = self.path("ca.key");
        cfg.tls.certs_key = self.path("leaf.key");
        cfg.tls.certs_dir = self.path("certs");
        if intercept {
            CertificateAuthority::bootstrap(&cfg.tls.ca_cert, &cfg.tls.ca_key, &cfg.tls.certs_key)?;
        }
        Ok(cfg)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub rt: Arc<ProxyRuntime>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl RunningProxy {
    /// Request shutdown and wait for the dispatcher to join every session.
    pub fn stop(mut self) -> anyhow::Result<()> {
        self.rt.request_shutdown();
        match self.handle.take() {
            Some(h) => h.join().map_err(|_| anyhow::anyhow!("dispatcher panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            self.rt.request_shutdown();
            let _ = h.join();
        }
    }
}

/// Bind the proxy, let `setup` register hooks, then dispatch on a thread.
pub fn start_proxy<F>(cfg: Config, setup: F) -> anyhow::Result<RunningProxy>
where
    F: FnOnce(&ProxyRuntime) -> anyhow::Result<()>,
{
    let rt = Arc::new(ProxyRuntime::new(cfg, EngineSet::new(), None)?);
    setup(&rt)?;
    let proxy = Proxy::bind(rt.clone())?;
    let addr = proxy.local_addr()?;
    let handle = thread::spawn(move || proxy.run());
    Ok(RunningProxy {
        addr,
        rt,
        handle: Some(handle),
    })
}

/// Read until `needle` shows up or the peer closes.
pub fn read_until<R: Read>(stream: &mut R, needle: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    while !out.windows(needle.len()).any(|w| w == needle) {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

/// Plain HTTP origin answering one request with [`RESPONSE`]. The thread
/// returns the request head it received.
pub fn plain_origin() -> anyhow::Result<(SocketAddr, JoinHandle<anyhow::Result<Vec<u8>>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || -> anyhow::Result<Vec<u8>> {
        let (mut stream, _) = listener.accept()?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let head = read_until(&mut stream, b"\r\n\r\n")?;
        stream.write_all(RESPONSE)?;
        Ok(head)
    });
    Ok((addr, handle))
}

/// TLS origin with a self-signed certificate for `localhost`.
pub fn tls_origin() -> anyhow::Result<(SocketAddr, JoinHandle<anyhow::Result<Vec<u8>>>)> {
    let key = rcgen::KeyPair::generate()?;
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])?.self_signed(&key)?;
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(cert.der().to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )?;
    let config = Arc::new(config);

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || -> anyhow::Result<Vec<u8>> {
        let (tcp, _) = listener.accept()?;
        tcp.set_read_timeout(Some(Duration::from_secs(5)))?;
        let conn = rustls::ServerConnection::new(config)?;
        let mut tls = rustls::StreamOwned::new(conn, tcp);
        let head = read_until(&mut tls, b"\r\n\r\n")?;
        tls.write_all(RESPONSE)?;
        tls.conn.send_close_notify();
        tls.flush()?;
        Ok(head)
    });
    Ok((addr, handle))
}

/// Client config trusting only the proxy's CA certificate.
pub fn trusting_client(ca_cert: &Path) -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let pem = std::fs::read(ca_cert)?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        roots.add(cert?)?;
    }
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn connect(addr: SocketAddr) -> anyhow::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    Ok(stream)
}
