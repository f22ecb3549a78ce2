// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Opening the origin-facing leg, directly or through a forwarding proxy.

use crate::config::{ChainKind, UpstreamConfig};
use crate::error::ChainError;
use crate::http;
use crate::socks;
use anyhow::{Context, Result, bail};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CHAIN_REPLY: usize = 8192;

/// Where origin connections go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Chain {
        kind: ChainKind,
        host: String,
        port: u16,
    },
}

impl Route {
    pub fn from_config(cfg: &UpstreamConfig) -> Result<Self> {
        let Some(proxy) = &cfg.proxy else {
            return Ok(Route::Direct);
        };
        let (host, port) = http::split_host_port(proxy, 0)
            .filter(|(_, port)| *port != 0)
            .with_context(|| format!("forwarding proxy must be host:port, got '{}'", proxy))?;
        Ok(Route::Chain {
            kind: cfg.kind,
            host,
            port,
        })
    }

    /// Plaintext requests go to an HTTP forwarding proxy untouched.
    pub fn is_http_chain(&self) -> bool {
        matches!(
            self,
            Route::Chain {
                kind: ChainKind::Http,
                ..
            }
        )
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Direct => f.write_str("direct"),
            Route::Chain { kind, host, port } => write!(f, "{}://{}:{}", kind, host, port),
        }
    }
}

/// TCP connection to the first reachable address of `host:port`.
pub fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}:{}", host, port))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%addr, error = %e, "failed to set TCP_NODELAY on origin socket");
                }
                debug!(%host, port, %addr, "connected");
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => {
            Err(anyhow::Error::from(e).context(format!("failed to connect to {}:{}", host, port)))
        }
        None => bail!("no address found for {}:{}", host, port),
    }
}

/// A stream carrying raw bytes to `host:port`, ready for TLS or tunnelling.
///
/// Through an HTTP chain the client's own CONNECT message is forwarded when
/// given, otherwise one is written for it.
pub fn open_tunnel(
    route: &Route,
    host: &str,
    port: u16,
    connect_request: Option<&[u8]>,
) -> Result<TcpStream> {
    match route {
        Route::Direct => connect_tcp(host, port),
        Route::Chain {
            kind: ChainKind::Http,
            host: proxy_host,
            port: proxy_port,
        } => {
            let stream = connect_tcp(proxy_host, *proxy_port)?;
            let synthesized;
            let request = match connect_request {
                Some(r) => r,
                None => {
                    synthesized = connect_line(host, port);
                    synthesized.as_bytes()
                }
            };
            http_connect(&stream, request)?;
            info!(%host, port, proxy = %route, "tunnel opened through forwarding proxy");
            Ok(stream)
        }
        Route::Chain {
            kind,
            host: proxy_host,
            port: proxy_port,
        } => {
            let stream = connect_tcp(proxy_host, *proxy_port)?;
            with_timeout(&stream, |mut s| {
                socks::connect(&mut s, host, port, *kind == ChainKind::Socks4a)
            })
            .with_context(|| format!("SOCKS handshake with {} failed", route))?;
            info!(%host, port, proxy = %route, "tunnel opened through SOCKS proxy");
            Ok(stream)
        }
    }
}

/// The stream a plaintext request is written to. An HTTP forwarding proxy
/// receives the request as the client sent it.
pub fn open_plain(route: &Route, host: &str, port: u16) -> Result<TcpStream> {
    match route {
        Route::Chain {
            kind: ChainKind::Http,
            host: proxy_host,
            port: proxy_port,
        } => connect_tcp(proxy_host, *proxy_port),
        _ => open_tunnel(route, host, port, None),
    }
}

fn connect_line(host: &str, port: u16) -> String {
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority)
}

/// Run `f` on the stream with read and write timeouts set, clearing them afterwards.
fn with_timeout<T>(stream: &TcpStream, f: impl FnOnce(&TcpStream) -> Result<T>) -> Result<T> {
    stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
    stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;
    let out = f(stream);
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    out
}

fn http_connect(stream: &TcpStream, request: &[u8]) -> Result<()> {
    let reply = with_timeout(stream, |mut s| {
        s.write_all(request)?;
        read_reply_head(&mut s)
    })?;
    if !http::is_chain_accepted(&reply) {
        return Err(ChainError::Refused(http::status_line(&reply)).into());
    }
    Ok(())
}

fn read_reply_head<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let mut reply = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            if reply.is_empty() {
                return Err(ChainError::Truncated.into());
            }
            break;
        }
        reply.extend_from_slice(&chunk[..n]);
        if reply.windows(4).any(|w| w == b"\r\n\r\n") || reply.len() >= MAX_CHAIN_REPLY {
            break;
        }
    }
    Ok(reply)
}
