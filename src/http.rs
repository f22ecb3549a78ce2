// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! The little HTTP the relay needs: request lines, targets and error pages.
//!
//! Payloads are otherwise treated as opaque bytes.

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// First line of an HTTP request, split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub version: &'a str,
    /// Length of the line including its terminator
    pub len: usize,
}

impl<'a> RequestLine<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        let end = buf.iter().position(|b| *b == b'\n')?;
        let line = std::str::from_utf8(&buf[..end]).ok()?;
        let line = line.strip_suffix('\r').unwrap_or(line);
        let mut parts = line.split_ascii_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        let version = parts.next()?;
        if parts.next().is_some() || !version.starts_with("HTTP/") {
            return None;
        }
        Some(Self {
            method,
            target,
            version,
            len: end + 1,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// An absolute-form request target such as `http://host:8080/path?q`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path and query, always starting with `/`
    pub path: String,
}

impl AbsoluteUri {
    pub fn parse(uri: &str) -> Option<Self> {
        let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(uri, "http://") {
            (Scheme::Http, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(uri, "https://") {
            (Scheme::Https, rest)
        } else {
            return None;
        };
        let split = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, path) = rest.split_at(split);
        if authority.is_empty() || authority.contains('@') {
            return None;
        }
        let (host, port) = split_host_port(authority, scheme.default_port())?;
        let path = if path.is_empty() {
            "/".to_string()
        } else if path.starts_with('?') {
            format!("/{}", path)
        } else {
            path.to_string()
        };
        Some(Self {
            scheme,
            host,
            port,
            path,
        })
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals (`[::1]:443`).
/// Brackets are removed from the returned host.
pub fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if rest.len() == close + 1 => default_port,
            None => return None,
        };
        if host.is_empty() {
            return None;
        }
        return Some((host.to_string(), port));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse().ok()?),
        None => (authority, default_port),
    };
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some((host.to_string(), port))
}

/// Target of a `CONNECT host:port` request line.
pub fn connect_target(line: &RequestLine<'_>) -> Option<(String, u16)> {
    if !line.is_connect() {
        return None;
    }
    split_host_port(line.target, 443)
}

/// Rewrite an absolute-form request to origin-form, keeping headers and body.
///
/// Returns `None` when the request line is not a well-formed absolute-URI request.
pub fn to_origin_form(buf: &[u8]) -> Option<(AbsoluteUri, Vec<u8>)> {
    let line = RequestLine::parse(buf)?;
    if line.is_connect() {
        return None;
    }
    let uri = AbsoluteUri::parse(line.target)?;
    let head = format!("{} {} {}\r\n", line.method, uri.path, line.version);
    let mut out = Vec::with_capacity(buf.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&buf[line.len..]);
    Some((uri, out))
}

/// True when a forwarding proxy accepted our CONNECT.
pub fn is_chain_accepted(reply: &[u8]) -> bool {
    reply.starts_with(b"HTTP/1.0 200") || reply.starts_with(b"HTTP/1.1 200")
}

/// Status line of a reply, for error reporting.
pub fn status_line(reply: &[u8]) -> String {
    let end = reply
        .iter()
        .position(|b| *b == b'\r' || *b == b'\n')
        .unwrap_or(reply.len());
    String::from_utf8_lossy(&reply[..end]).into_owned()
}

/// Complete HTTP response carrying the generic HTML error page.
pub fn error_page(message: &str) -> Vec<u8> {
    let body = format!(
        "<html><head><title>proxenet: ERROR!</title></head><body>\
         <h1>Error</h1>proxenet encountered an error when loading your page<br><br>\
         The following message was returned:<br>\
         <div style=\"border: 1px solid black; padding: 5px; font-family: monospace\">\
         <br>{}</div></body></html>",
        escape_html(message)
    );
    let mut out = format!(
        "HTTP/1.0 502 Bad Gateway\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
