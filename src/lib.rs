// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Forward interception proxy with TLS splitting and ordered traffic hooks.
//!
//! The dispatcher in [`proxy`] accepts clients into bounded [`slots`], each
//! running a [`session`] that relays requests and responses through the
//! [`hooks`] pipeline. CONNECT tunnels are split with certificates minted by
//! [`ca`]. The [`control`] socket changes run mode, pool size, verbosity and
//! the hook registry while sessions are live.

pub mod ca;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod hooks;
pub mod http;
pub mod interception;
pub mod logging;
pub mod proxy;
pub mod runtime;
pub mod session;
pub mod slots;
pub mod socks;
pub mod upstream;

#[cfg(test)]
mod test_helpers;
