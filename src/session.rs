// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! One accepted client connection and its relay loop.
//!
//! A session moves `Init -> Establishing -> Relaying -> Closed`. Requests
//! and responses strictly alternate: a request takes a transaction id that
//! is released once its response has been relayed.

use crate::connection::{ConnectionMetadata, Incoming, Leg, wait_readable};
use crate::hooks::Direction;
use crate::http::{self, Scheme};
use crate::interception::{self, Established};
use crate::runtime::ProxyRuntime;
use anyhow::{Context, Result, anyhow};
use std::borrow::Cow;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Establishing,
    Relaying,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    ClientClosed,
    UpstreamClosed,
    IdleTimeout,
}

/// Origin the upstream leg points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

/// Called once for every leg the session closes.
pub type CloseObserver = Box<dyn Fn(Side) + Send>;

pub struct Session {
    meta: ConnectionMetadata,
    slot: usize,
    state: SessionState,
    pub(crate) client: Option<Leg>,
    pub(crate) upstream: Option<Leg>,
    pub(crate) target: Option<Target>,
    pub(crate) is_ssl: bool,
    pub(crate) tunnel: bool,
    pub(crate) hooks_enabled: bool,
    transaction: Option<u64>,
    last_transaction: u64,
    answered: bool,
    on_close: Option<CloseObserver>,
}

impl Session {
    pub fn new(client: TcpStream, slot: usize) -> Result<Self> {
        let remote = client.peer_addr().context("client socket has no peer")?;
        if let Err(e) = client.set_nodelay(true) {
            debug!(%remote, error = %e, "failed to set TCP_NODELAY on client socket");
        }
        Ok(Self {
            meta: ConnectionMetadata::new(remote),
            slot,
            state: SessionState::Init,
            client: Some(Leg::Plain(client)),
            upstream: None,
            target: None,
            is_ssl: false,
            tunnel: false,
            hooks_enabled: false,
            transaction: None,
            last_transaction: 0,
            answered: false,
            on_close: None,
        })
    }

    pub fn with_close_observer(mut self, observer: CloseObserver) -> Self {
        self.on_close = Some(observer);
        self
    }

    pub fn id(&self) -> Uuid {
        self.meta.id
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.meta
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ssl(&self) -> bool {
        self.is_ssl
    }

    /// Run the session to completion, log how it ended and close it.
    pub fn serve(mut self, rt: &ProxyRuntime) {
        rt.record_session();
        debug!(session = %self.id(), slot = self.slot, peer = %self.meta.remote_addr, "session started");
        match self.run(rt) {
            Ok(exit) => debug!(
                session = %self.id(),
                ?exit,
                elapsed_ms = self.meta.established.elapsed().as_millis() as u64,
                "session ended"
            ),
            Err(e) => warn!(session = %self.id(), error = %format!("{:#}", e), "session ended with error"),
        }
    }

    /// Relay until either side closes, the session idles out or an error
    /// occurs. Both legs are closed on every path.
    pub fn run(&mut self, rt: &ProxyRuntime) -> Result<Exit> {
        let result = self.relay(rt);
        self.close();
        result
    }

    fn relay(&mut self, rt: &ProxyRuntime) -> Result<Exit> {
        let idle = rt.idle_timeout();
        loop {
            let (client_ready, upstream_ready) = self.wait(idle)?;
            if !client_ready && !upstream_ready {
                debug!(session = %self.id(), state = ?self.state, "idle timeout");
                return Ok(Exit::IdleTimeout);
            }
            if client_ready && let Some(exit) = self.client_to_origin(rt)? {
                return Ok(exit);
            }
            if upstream_ready && let Some(exit) = self.origin_to_client(rt)? {
                return Ok(exit);
            }
        }
    }

    /// Readiness of (client, upstream). Input a TLS leg already holds
    /// counts as ready without waiting.
    fn wait(&mut self, timeout: Duration) -> Result<(bool, bool)> {
        let client_buffered = self.client.as_mut().is_some_and(|l| l.has_pending_input());
        let upstream_buffered = self.upstream.as_mut().is_some_and(|l| l.has_pending_input());
        if client_buffered || upstream_buffered {
            return Ok((client_buffered, upstream_buffered));
        }

        let client = self.client.as_ref().context("client leg is gone")?;
        let ready = match &self.upstream {
            Some(up) => wait_readable(&[client.as_fd(), up.as_fd()], timeout)?,
            None => wait_readable(&[client.as_fd()], timeout)?,
        };
        Ok((
            ready.first().copied().unwrap_or(false),
            ready.get(1).copied().unwrap_or(false),
        ))
    }

    fn client_leg(&mut self) -> Result<&mut Leg> {
        self.client.as_mut().ok_or_else(|| anyhow!("client leg is gone"))
    }

    fn upstream_leg(&mut self) -> Result<&mut Leg> {
        self.upstream.as_mut().ok_or_else(|| anyhow!("upstream leg is gone"))
    }

    fn client_to_origin(&mut self, rt: &ProxyRuntime) -> Result<Option<Exit>> {
        let message = match self.client_leg()?.read_message().context("client read failed")? {
            Incoming::Message(message) => message,
            Incoming::Nothing => return Ok(None),
            Incoming::Closed => return Ok(Some(Exit::ClientClosed)),
        };
        trace!(session = %self.id(), len = message.len(), "client message");

        if self.upstream.is_none() {
            self.state = SessionState::Establishing;
            let established = match interception::establish(rt, self, &message) {
                Ok(est) => est,
                Err(e) => {
                    self.report_error(&e);
                    return Err(e);
                }
            };
            self.state = SessionState::Relaying;
            if let Established::Passthrough(first) = established {
                self.forward_request(rt, &first)?;
            }
            return Ok(None);
        }

        if self.tunnel {
            self.upstream_leg()?.send(&message).context("write to origin failed")?;
            return Ok(None);
        }

        if self.transaction.is_none() && self.needs_absolute_uri(rt) {
            let (uri, rewritten) = http::to_origin_form(&message)
                .context("request is not an absolute-URI HTTP request")?;
            let retarget = self
                .target
                .as_ref()
                .is_some_and(|t| {
                    t.scheme != uri.scheme || t.host != uri.host || t.port != uri.port
                });
            if retarget {
                info!(session = %self.id(), host = %uri.host, port = uri.port, "request for another origin, reconnecting");
                self.close_upstream();
                let first = interception::open_for_request(rt, self, &message)?;
                return self.forward_request(rt, &first).map(|_| None);
            }
            return self.forward_request(rt, &rewritten).map(|_| None);
        }

        self.forward_request(rt, &message).map(|_| None)
    }

    /// Direct plaintext sessions must see an absolute URI on every new request.
    fn needs_absolute_uri(&self, rt: &ProxyRuntime) -> bool {
        !self.is_ssl && !rt.route().is_http_chain()
    }

    fn forward_request(&mut self, rt: &ProxyRuntime, payload: &[u8]) -> Result<()> {
        let txid = *self.transaction.get_or_insert_with(|| rt.next_transaction_id());
        let out = if self.hooks_enabled {
            rt.hooks().apply(Direction::Request, txid, payload)?
        } else {
            Cow::Borrowed(payload)
        };
        trace!(session = %self.id(), txid, len = out.len(), "forwarding request");
        self.upstream_leg()?.send(&out).context("write to origin failed")?;
        Ok(())
    }

    fn origin_to_client(&mut self, rt: &ProxyRuntime) -> Result<Option<Exit>> {
        let message = match self.upstream_leg()?.read_message().context("origin read failed")? {
            Incoming::Message(message) => message,
            Incoming::Nothing => {
                trace!(session = %self.id(), "origin sent no application data");
                return Ok(None);
            }
            Incoming::Closed => return Ok(Some(Exit::UpstreamClosed)),
        };

        if self.tunnel {
            self.client_leg()?.send(&message).context("write to client failed")?;
            return Ok(None);
        }

        // later bursts of a response keep the id of the request they answer
        let txid = self.transaction.unwrap_or(self.last_transaction);
        let out = if self.hooks_enabled {
            rt.hooks().apply(Direction::Response, txid, &message)?
        } else {
            Cow::Borrowed(&message[..])
        };
        trace!(session = %self.id(), txid, len = out.len(), "forwarding response");
        self.client_leg()?.send(&out).context("write to client failed")?;

        if let Some(done) = self.transaction.take() {
            self.last_transaction = done;
            rt.record_request();
        }
        Ok(None)
    }

    /// Send the synthetic CONNECT reply on the still-plaintext client leg.
    pub(crate) fn answer_connect(&mut self) -> Result<()> {
        self.client_leg()?
            .send(http::CONNECT_ESTABLISHED)
            .context("failed to answer CONNECT")?;
        self.answered = true;
        Ok(())
    }

    /// Take the plain client socket out of the session for a TLS handshake.
    pub(crate) fn take_client_tcp(&mut self) -> Result<TcpStream> {
        match self.client.take() {
            Some(Leg::Plain(tcp)) => Ok(tcp),
            other => {
                self.client = other;
                Err(anyhow!("client leg is not plaintext"))
            }
        }
    }

    /// Error page for failures before the client was told anything.
    fn report_error(&mut self, error: &anyhow::Error) {
        if self.answered {
            return;
        }
        let page = http::error_page(&format!("{:#}", error));
        if let Some(client) = self.client.as_mut()
            && let Err(e) = client.send(&page)
        {
            debug!(session = %self.id(), error = %e, "failed to send error page");
        }
    }

    fn notify(&self, side: Side) {
        if let Some(observer) = &self.on_close {
            observer(side);
        }
    }

    fn close_upstream(&mut self) {
        if let Some(leg) = self.upstream.take() {
            leg.close();
            self.notify(Side::Upstream);
        }
        self.target = None;
    }

    /// Close both legs. Each leg is closed at most once however often this runs.
    pub fn close(&mut self) {
        if let Some(leg) = self.client.take() {
            leg.close();
            self.notify(Side::Client);
        }
        self.close_upstream();
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
