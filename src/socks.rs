// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! SOCKS4 and SOCKS4a CONNECT handshake.
//!
//! Request: `VN(1) | CD(1) | DSTPORT(2) | DSTIP(4) | USERID | NUL`, with
//! SOCKS4a using `DSTIP = 0.0.0.x` and appending `HOSTNAME | NUL`.

use crate::error::ChainError;
use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use tracing::debug;

const SOCKS_VERSION: u8 = 0x04;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_REQUEST_MAXLEN: usize = 1024;

pub const GRANTED: u8 = 0x5a;
pub const REJECTED: u8 = 0x5b;
pub const REJECTED_NO_IDENTD: u8 = 0x5c;
pub const REJECTED_USERID: u8 = 0x5d;

fn userid(host: &str, port: u16) -> String {
    format!("proxenet:{}:{}", host, port)
}

/// Build a SOCKS4 CONNECT request for an IPv4 destination.
pub fn socks4_request(ip: Ipv4Addr, port: u16, userid: &str) -> Vec<u8> {
    let mut req = Vec::with_capacity(9 + userid.len());
    req.push(SOCKS_VERSION);
    req.push(SOCKS_CMD_CONNECT);
    req.extend_from_slice(&port.to_be_bytes());
    req.extend_from_slice(&ip.octets());
    req.extend_from_slice(userid.as_bytes());
    req.push(0);
    req
}

/// Build a SOCKS4a CONNECT request letting the server resolve `host`.
pub fn socks4a_request(host: &str, port: u16, userid: &str) -> Result<Vec<u8>> {
    let len = 8 + userid.len() + 1 + host.len() + 1;
    if len > SOCKS_REQUEST_MAXLEN {
        anyhow::bail!("SOCKS4a hostname too long ({} bytes)", host.len());
    }
    let mut req = Vec::with_capacity(len);
    req.push(SOCKS_VERSION);
    req.push(SOCKS_CMD_CONNECT);
    req.extend_from_slice(&port.to_be_bytes());
    req.extend_from_slice(&[0, 0, 0, 0xff]);
    req.extend_from_slice(userid.as_bytes());
    req.push(0);
    req.extend_from_slice(host.as_bytes());
    req.push(0);
    Ok(req)
}

fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", host))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(ChainError::NoIpv4(host.to_string()).into())
}

fn describe(code: u8) -> &'static str {
    match code {
        REJECTED => "request rejected or failed",
        REJECTED_NO_IDENTD => "SOCKS server cannot connect to identd on the client",
        REJECTED_USERID => "client program and identd report different user ids",
        _ => "unknown reply code",
    }
}

/// Run the CONNECT sequence over an already-open connection to the SOCKS server.
pub fn connect<S: Read + Write>(
    stream: &mut S,
    host: &str,
    port: u16,
    socks4a: bool,
) -> Result<()> {
    let uid = userid(host, port);
    let req = if socks4a {
        socks4a_request(host, port, &uid)?
    } else {
        socks4_request(resolve_ipv4(host, port)?, port, &uid)
    };
    stream
        .write_all(&req)
        .context("failed to send SOCKS request")?;
    stream.flush()?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            anyhow::Error::from(ChainError::Truncated)
        } else {
            anyhow::Error::from(e).context("failed to read SOCKS reply")
        }
    })?;

    match reply[1] {
        GRANTED => {
            debug!(%host, port, socks4a, "SOCKS CONNECT granted");
            Ok(())
        }
        code => Err(anyhow::Error::from(ChainError::Socks(code)).context(describe(code))),
    }
}
