// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Process-wide state shared by the dispatcher, the sessions and the control plane.

use crate::ca::CertificateAuthority;
use crate::config::{Config, MAX_VERBOSE_LEVEL};
use crate::hooks::{EngineSet, HookRegistry};
use crate::interception::{InterceptRules, TlsEngine};
use crate::logging::LogControl;
use crate::slots::{SlotTable, WAKE_ONLY};
use crate::upstream::Route;
use anyhow::{Context, Result};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunMode {
    Active = 0,
    /// No new sessions are accepted; live ones carry on.
    Sleeping = 1,
    /// The dispatcher stops and joins every session.
    Inactive = 2,
}

impl RunMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RunMode::Active,
            1 => RunMode::Sleeping,
            _ => RunMode::Inactive,
        }
    }
}

pub struct ProxyRuntime {
    mode: AtomicU8,
    verbosity: AtomicU8,
    log: Option<LogControl>,
    config: Config,
    bound: OnceLock<SocketAddr>,
    route: Route,
    rules: InterceptRules,
    tls: TlsEngine,
    hooks: HookRegistry,
    slots: SlotTable,
    next_transaction: AtomicU64,
    sessions_accepted: AtomicU64,
    requests_served: AtomicU64,
    started: Instant,
}

impl ProxyRuntime {
    /// Build every shared component from `config`.
    ///
    /// CA material is only required when interception is enabled; a CA
    /// that fails to load is fatal. An unreadable hook directory is not.
    pub fn new(config: Config, engines: EngineSet, log: Option<LogControl>) -> Result<Self> {
        let route = Route::from_config(&config.upstream)?;
        let rules = InterceptRules::from_config(&config.tls)?;
        let ca = if config.tls.intercept {
            let ca = CertificateAuthority::open(
                &config.tls.ca_cert,
                &config.tls.ca_key,
                &config.tls.certs_key,
                &config.tls.certs_dir,
            )
            .context("failed to load certificate authority")?;
            Some(Arc::new(ca))
        } else {
            None
        };
        let tls = TlsEngine::new(ca, &config.tls)?;

        let hooks = HookRegistry::new(&config.hooks.dir, engines);
        match hooks.load_all() {
            Ok(n) => info!(loaded = n, dir = %config.hooks.dir.display(), "hooks loaded"),
            Err(e) => warn!(error = %e, "no hooks loaded"),
        }

        let slots = SlotTable::new(config.general.threads).context("failed to create slot table")?;

        Ok(Self {
            mode: AtomicU8::new(RunMode::Active as u8),
            verbosity: AtomicU8::new(config.general.verbose.min(MAX_VERBOSE_LEVEL)),
            log,
            config,
            bound: OnceLock::new(),
            route,
            rules,
            tls,
            hooks,
            slots,
            next_transaction: AtomicU64::new(1),
            sessions_accepted: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn rules(&self) -> &InterceptRules {
        &self.rules
    }

    pub fn tls(&self) -> &TlsEngine {
        &self.tls
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.general.idle_timeout_secs)
    }

    /// Address the listener actually bound, once it has.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    pub(crate) fn set_bound_addr(&self, addr: SocketAddr) {
        let _ = self.bound.set(addr);
    }

    pub fn mode(&self) -> RunMode {
        RunMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn set_mode(&self, mode: RunMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    /// Switch to `Inactive` and wake the dispatcher so it notices.
    pub fn request_shutdown(&self) {
        self.set_mode(RunMode::Inactive);
        let waker = self.slots.waker();
        if let Err(e) = (&*waker).write_all(&[WAKE_ONLY]) {
            warn!(error = %e, "failed to wake dispatcher");
        }
    }

    /// Flip between `Active` and `Sleeping`. `Inactive` is left alone.
    pub fn toggle_pause(&self) -> RunMode {
        let flipped = self.mode.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| {
            match RunMode::from_u8(m) {
                RunMode::Active => Some(RunMode::Sleeping as u8),
                RunMode::Sleeping => Some(RunMode::Active as u8),
                RunMode::Inactive => None,
            }
        });
        match flipped {
            Ok(previous) => match RunMode::from_u8(previous) {
                RunMode::Active => RunMode::Sleeping,
                _ => RunMode::Active,
            },
            Err(_) => RunMode::Inactive,
        }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::SeqCst)
    }

    /// Set the verbosity, bounded by `MAX_VERBOSE_LEVEL`, and apply it to the
    /// log filter. Returns the level in effect.
    pub fn set_verbosity(&self, level: u8) -> u8 {
        let level = level.min(MAX_VERBOSE_LEVEL);
        self.verbosity.store(level, Ordering::SeqCst);
        if let Some(log) = &self.log
            && let Err(e) = log.set_level(level)
        {
            warn!(error = %e, "log level unchanged");
        }
        level
    }

    pub fn next_transaction_id(&self) -> u64 {
        self.next_transaction.fetch_add(1, Ordering::SeqCst)
    }

    pub fn record_session(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_accepted(&self) -> u64 {
        self.sessions_accepted.load(Ordering::Relaxed)
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    pub fn certificates_minted(&self) -> u64 {
        self.tls
            .authority()
            .map(|ca| ca.certificates_minted())
            .unwrap_or(0)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
