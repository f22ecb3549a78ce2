// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error types callers branch on. Everything else flows through `anyhow`.

use thiserror::Error;

/// Failures of the session slot table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("no free session slot (capacity {0})")]
    Full(usize),
    #[error("slot {0} is out of range")]
    OutOfRange(usize),
    #[error("slot {0} is already live")]
    AlreadyLive(usize),
}

/// Failures raised while running a hook.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook '{name}' failed: {reason}")]
    Invocation { name: String, reason: String },
    #[error("hook '{name}' returned an empty payload")]
    EmptyOutput { name: String },
    #[error("hook '{name}' i/o error: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no hook with id {0}")]
    UnknownId(usize),
    #[error("hook '{0}' is already loaded")]
    AlreadyLoaded(String),
    #[error("'{0}' is not a valid hook file name")]
    InvalidName(String),
    #[error("cannot scan hook directory {dir}: {source}")]
    Scan {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Threads still active, cannot reload")]
    Busy,
    #[error("hook registry lock poisoned")]
    Poisoned,
}

/// Failures talking to a forwarding proxy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("forwarding proxy refused CONNECT: {0}")]
    Refused(String),
    #[error("SOCKS request rejected with code {0:#04x}")]
    Socks(u8),
    #[error("SOCKS4 needs an IPv4 address for '{0}'")]
    NoIpv4(String),
    #[error("truncated reply from forwarding proxy")]
    Truncated,
}
