// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

mod common;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use proxenet::config::InterceptMode;
use proxenet::hooks::FnHook;
use proxenet::http::CONNECT_ESTABLISHED;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};

/// CONNECT to `localhost:port` through the proxy and finish the TLS
/// handshake with the minted certificate, without sending any request.
fn open_split(
    proxy: SocketAddr,
    port: u16,
    ca_cert: &Path,
) -> anyhow::Result<StreamOwned<ClientConnection, TcpStream>> {
    let mut tcp = common::connect(proxy)?;
    write!(tcp, "CONNECT localhost:{p} HTTP/1.1\r\nHost: localhost:{p}\r\n\r\n", p = port)?;
    let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
    tcp.read_exact(&mut reply)?;
    assert_eq!(reply, CONNECT_ESTABLISHED);

    let client = common::trusting_client(ca_cert)?;
    let conn = ClientConnection::new(client, ServerName::try_from("localhost")?)?;
    let mut tls = StreamOwned::new(conn, tcp);
    while tls.conn.is_handshaking() {
        tls.conn.complete_io(&mut tls.sock)?;
    }
    Ok(tls)
}

#[test]
fn connect_is_split_with_a_minted_certificate() -> anyhow::Result<()> {
    let ws = common::Workspace::new("proxenet_connect_split")?;
    let cfg = ws.config(true)?;
    let ca_cert = cfg.tls.ca_cert.clone();
    let (origin, origin_handle) = common::tls_origin()?;

    let proxy = common::start_proxy(cfg, |rt| {
        rt.hooks().register("mark", 1, Box::new(FnHook::request_header("X-Hook-1: seen")))?;
        Ok(())
    })?;

    let mut tcp = common::connect(proxy.addr)?;
    let authority = format!("localhost:{}", origin.port());
    write!(tcp, "CONNECT {a} HTTP/1.1\r\nHost: {a}\r\n\r\n", a = authority)?;

    // the reply must arrive in full before any TLS byte
    let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
    tcp.read_exact(&mut reply)?;
    assert_eq!(reply, CONNECT_ESTABLISHED);

    let client = common::trusting_client(&ca_cert)?;
    let conn = rustls::ClientConnection::new(client, ServerName::try_from("localhost")?)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);
    tls.write_all(b"GET /secret HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let response = common::read_until(&mut tls, b"hello")?;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));

    let head = origin_handle
        .join()
        .map_err(|_| anyhow::anyhow!("origin panicked"))??;
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("GET /secret HTTP/1.1\r\n"));
    assert!(head.contains("X-Hook-1: seen\r\n"));

    assert_eq!(proxy.rt.certificates_minted(), 1);
    assert!(ws.path("certs").join("localhost.crt").exists());
    proxy.stop()
}

#[test]
fn excluded_host_is_tunnelled_untouched() -> anyhow::Result<()> {
    let ws = common::Workspace::new("proxenet_connect_tunnel")?;
    let mut cfg = ws.config(true)?;
    cfg.tls.intercept_mode = InterceptMode::Except;
    cfg.tls.intercept_pattern = "127.0.0.*".to_string();
    let (origin, origin_handle) = common::plain_origin()?;

    let proxy = common::start_proxy(cfg, |rt| {
        rt.hooks().register("mark", 1, Box::new(FnHook::request_header("X-Hook-1: seen")))?;
        Ok(())
    })?;

    let mut tcp = common::connect(proxy.addr)?;
    write!(tcp, "CONNECT {a} HTTP/1.1\r\nHost: {a}\r\n\r\n", a = origin)?;
    let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
    tcp.read_exact(&mut reply)?;
    assert_eq!(reply, CONNECT_ESTABLISHED);

    let request = b"GET /raw HTTP/1.1\r\nHost: anywhere\r\n\r\n";
    tcp.write_all(request)?;
    let response = common::read_until(&mut tcp, b"hello")?;
    assert_eq!(response, common::RESPONSE);

    let head = origin_handle
        .join()
        .map_err(|_| anyhow::anyhow!("origin panicked"))??;
    assert_eq!(head, request);
    assert_eq!(proxy.rt.certificates_minted(), 0);
    proxy.stop()
}

#[test]
fn unreachable_origin_gets_an_error_page() -> anyhow::Result<()> {
    let ws = common::Workspace::new("proxenet_connect_refused")?;
    let cfg = ws.config(true)?;
    // grab a port nobody listens on
    let closed = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;

    let proxy = common::start_proxy(cfg, |_| Ok(()))?;
    let mut tcp = common::connect(proxy.addr)?;
    write!(tcp, "CONNECT {a} HTTP/1.1\r\nHost: {a}\r\n\r\n", a = closed)?;
    let mut page = Vec::new();
    tcp.read_to_end(&mut page)?;
    assert!(page.starts_with(b"HTTP/1.0 502 Bad Gateway\r\n"));
    proxy.stop()
}

#[test]
fn late_first_request_is_relayed_after_origin_tickets() -> anyhow::Result<()> {
    let ws = common::Workspace::new("proxenet_connect_late")?;
    let cfg = ws.config(true)?;
    let ca_cert = cfg.tls.ca_cert.clone();
    let (origin, origin_handle) = common::tls_origin()?;
    let proxy = common::start_proxy(cfg, |_| Ok(()))?;

    let mut tls = open_split(proxy.addr, origin.port(), &ca_cert)?;
    // origin session tickets reach the proxy while the client is silent
    thread::sleep(Duration::from_millis(700));

    let sent = Instant::now();
    tls.write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let response = common::read_until(&mut tls, b"hello")?;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(sent.elapsed() < Duration::from_secs(3));

    let head = origin_handle
        .join()
        .map_err(|_| anyhow::anyhow!("origin panicked"))??;
    assert!(String::from_utf8_lossy(&head).starts_with("GET /slow HTTP/1.1\r\n"));
    proxy.stop()
}

#[test]
fn client_takes_proxy_tickets_before_requesting() -> anyhow::Result<()> {
    let ws = common::Workspace::new("proxenet_connect_tickets")?;
    let cfg = ws.config(true)?;
    let ca_cert = cfg.tls.ca_cert.clone();
    let (origin, origin_handle) = common::tls_origin()?;
    let proxy = common::start_proxy(cfg, |_| Ok(()))?;

    let mut tls = open_split(proxy.addr, origin.port(), &ca_cert)?;
    tls.sock.set_read_timeout(Some(Duration::from_millis(300)))?;
    let mut records = 0;
    loop {
        match tls.conn.read_tls(&mut tls.sock) {
            Ok(0) => anyhow::bail!("proxy closed the tunnel"),
            Ok(_) => {
                records += 1;
                let state = tls.conn.process_new_packets()?;
                assert_eq!(state.plaintext_bytes_to_read(), 0);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    assert!(records > 0, "no post-handshake records from the proxy");
    tls.sock.set_read_timeout(Some(Duration::from_secs(5)))?;
    thread::sleep(Duration::from_millis(300));

    let sent = Instant::now();
    tls.write_all(b"GET /after HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let response = common::read_until(&mut tls, b"hello")?;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(sent.elapsed() < Duration::from_secs(3));

    let head = origin_handle
        .join()
        .map_err(|_| anyhow::anyhow!("origin panicked"))??;
    assert!(String::from_utf8_lossy(&head).starts_with("GET /after HTTP/1.1\r\n"));
    proxy.stop()
}
