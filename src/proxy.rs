// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! The dispatcher: accepts clients into session slots and services the
//! control channel, all from one readiness loop.

use crate::connection::wait_readable;
use crate::control::ControlServer;
use crate::runtime::{ProxyRuntime, RunMode};
use crate::session::Session;
use anyhow::{Context, Result};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on one readiness wait of the dispatcher.
pub const DISPATCH_TICK: Duration = Duration::from_millis(500);

pub struct Proxy {
    rt: Arc<ProxyRuntime>,
    listener: TcpListener,
    control: Option<ControlServer>,
}

impl Proxy {
    /// Bind the client listener, which must succeed, and the control socket,
    /// which may not.
    pub fn bind(rt: Arc<ProxyRuntime>) -> Result<Self> {
        let listen = rt.config().general.listen.clone();
        let addr = listen
            .to_socket_addrs()
            .with_context(|| format!("invalid listen address {}", listen))?
            .next()
            .with_context(|| format!("listen address {} did not resolve", listen))?;
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind {}", addr))?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;
        rt.set_bound_addr(bound);
        info!(listen = %bound, "listening");

        let control = match ControlServer::bind(&rt.config().general.control_socket) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "control interface disabled");
                None
            }
        };
        Ok(Self {
            rt,
            listener,
            control,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn runtime(&self) -> &Arc<ProxyRuntime> {
        &self.rt
    }

    pub fn run(self) -> Result<()> {
        self.run_with_limit(None)
    }

    /// Dispatch until the run mode turns `Inactive`, or until `accept_limit`
    /// connections have been accepted. Every session is joined before this
    /// returns.
    pub fn run_with_limit(mut self, accept_limit: Option<usize>) -> Result<()> {
        let mut remaining = accept_limit;
        let result = self.dispatch(&mut remaining);
        self.shutdown();
        result
    }

    fn dispatch(&mut self, remaining: &mut Option<usize>) -> Result<()> {
        loop {
            if self.rt.mode() == RunMode::Inactive || *remaining == Some(0) {
                return Ok(());
            }
            let slots = self.rt.slots();
            slots.drain_completions();
            slots.reap();

            let accepting = self.rt.mode() == RunMode::Active;
            let (listener_ready, control_ready, client_ready) = {
                // index 0 is the completion socket, drained at the top of the loop
                let mut fds = vec![slots.completion_fd()];
                let listener_at = accepting.then(|| {
                    fds.push(self.listener.as_fd());
                    fds.len() - 1
                });
                let mut control_at = None;
                let mut client_at = None;
                if let Some(control) = &self.control {
                    fds.push(control.listener_fd());
                    control_at = Some(fds.len() - 1);
                    if let Some(fd) = control.client_fd() {
                        fds.push(fd);
                        client_at = Some(fds.len() - 1);
                    }
                }
                let ready = wait_readable(&fds, DISPATCH_TICK).context("dispatcher wait failed")?;
                let is_ready =
                    |at: Option<usize>| at.and_then(|i| ready.get(i).copied()).unwrap_or(false);
                (is_ready(listener_at), is_ready(control_at), is_ready(client_at))
            };

            if let Some(control) = self.control.as_mut() {
                if client_ready && let Err(e) = control.service(&self.rt) {
                    warn!(error = %format!("{:#}", e), "control client dropped");
                }
                if control_ready && let Err(e) = control.accept() {
                    warn!(error = %format!("{:#}", e), "control accept failed");
                }
            }
            if listener_ready {
                self.accept_clients(remaining);
            }
        }
    }

    fn accept_clients(&self, remaining: &mut Option<usize>) {
        while *remaining != Some(0) {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
            if let Err(e) = stream.set_nonblocking(false) {
                warn!(%peer, error = %e, "dropping connection");
                continue;
            }

            let slots = self.rt.slots();
            let index = match slots.claim_slot() {
                Ok(index) => index,
                Err(e) => {
                    warn!(%peer, error = %e, "dropping connection");
                    continue;
                }
            };
            let session = match Session::new(stream, index) {
                Ok(s) => s,
                Err(e) => {
                    warn!(%peer, error = %format!("{:#}", e), "dropping connection");
                    continue;
                }
            };
            debug!(%peer, slot = index, session = %session.id(), "accepted");
            let rt = self.rt.clone();
            if let Err(e) = slots.spawn(index, move || session.serve(&rt)) {
                error!(%peer, slot = index, error = %format!("{:#}", e), "failed to start session");
            }
        }
    }

    fn shutdown(&mut self) {
        let live = self.rt.slots().live_count();
        info!(live, "shutting down, waiting for sessions");
        self.control = None;
        self.rt.slots().join_all();
        self.rt.hooks().shutdown();
        info!(
            sessions = self.rt.sessions_accepted(),
            requests = self.rt.requests_served(),
            "stopped"
        );
    }
}

/// Bind and dispatch until shutdown is requested.
pub fn run_proxy(rt: Arc<ProxyRuntime>) -> Result<()> {
    Proxy::bind(rt)?.run()
}
