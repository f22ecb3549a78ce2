// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Line-oriented control channel over a Unix socket.
//!
//! One client at a time. Every reply is followed by the prompt. The
//! dispatcher polls the descriptors and calls back in here when they turn
//! readable, so commands run on the dispatcher thread.

use crate::config::MAX_THREADS;
use crate::error::HookError;
use crate::runtime::{ProxyRuntime, RunMode};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MOTD: &str = "Welcome on proxenet control interface\nType `help` to list available commands\n";
pub const PROMPT: &str = ">>> ";
pub const INVALID_COMMAND: &str = "Invalid command\n";
const BUSY_CLIENT: &str = "Control interface busy\n";
const MAX_LINE: usize = 4096;

type Handler = fn(&ProxyRuntime, &[&str]) -> String;

/// Entry of the static command table.
pub struct ControlCommand {
    pub name: &'static str,
    pub max_options: usize,
    handler: Handler,
    pub description: &'static str,
}

pub static COMMANDS: &[ControlCommand] = &[
    ControlCommand {
        name: "quit",
        max_options: 0,
        handler: cmd_quit,
        description: "Make proxenet leave kindly",
    },
    ControlCommand {
        name: "help",
        max_options: 0,
        handler: cmd_help,
        description: "Show this menu",
    },
    ControlCommand {
        name: "pause",
        max_options: 0,
        handler: cmd_pause,
        description: "Toggle pause (new connections are refused while paused)",
    },
    ControlCommand {
        name: "info",
        max_options: 0,
        handler: cmd_info,
        description: "Display information about environment",
    },
    ControlCommand {
        name: "verbose",
        max_options: 1,
        handler: cmd_verbose,
        description: "Get/Set verbose level (inc|dec)",
    },
    ControlCommand {
        name: "reload",
        max_options: 0,
        handler: cmd_reload,
        description: "Reload the plugins (refused while sessions are live)",
    },
    ControlCommand {
        name: "threads",
        max_options: 1,
        handler: cmd_threads,
        description: "Get/Set the number of session threads (inc|dec)",
    },
    ControlCommand {
        name: "plugin",
        max_options: 2,
        handler: cmd_plugin,
        description: "Plugins: list, list-all, toggle <id>, load <file>",
    },
];

pub fn find(name: &str) -> Option<&'static ControlCommand> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// Execute one command line and return the reply, prompt excluded.
pub fn dispatch(rt: &ProxyRuntime, line: &str) -> String {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return String::new();
    };
    let options: Vec<&str> = words.collect();
    match find(name) {
        Some(cmd) if options.len() <= cmd.max_options => {
            debug!(command = name, ?options, "control command");
            (cmd.handler)(rt, &options)
        }
        _ => INVALID_COMMAND.to_string(),
    }
}

fn cmd_quit(rt: &ProxyRuntime, _: &[&str]) -> String {
    info!("quit requested from control interface");
    rt.set_mode(RunMode::Inactive);
    "Leaving gracefully\n".to_string()
}

fn cmd_help(_: &ProxyRuntime, _: &[&str]) -> String {
    let mut out = String::from("Command list:\n");
    for cmd in COMMANDS {
        let _ = writeln!(out, "{:<10}\t{}", cmd.name, cmd.description);
    }
    out
}

fn cmd_pause(rt: &ProxyRuntime, _: &[&str]) -> String {
    let mode = rt.toggle_pause();
    let sleeping = u8::from(mode == RunMode::Sleeping);
    info!(?mode, "run mode changed");
    format!("sleep-mode -> {}\n", sleeping)
}

fn cmd_info(rt: &ProxyRuntime, _: &[&str]) -> String {
    let config = rt.config();
    let listen = rt
        .bound_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| config.general.listen.clone());
    let slots = rt.slots();
    let mut out = String::from("Infos:\n");
    let _ = writeln!(out, "- Listening interface: {}", listen);
    let _ = writeln!(out, "- Run mode: {:?}", rt.mode());
    let _ = writeln!(out, "- Verbose level: {}", rt.verbosity());
    let _ = writeln!(out, "- Running/Max threads: {}/{}", slots.live_count(), slots.capacity());
    let _ = writeln!(
        out,
        "- SSL interception: {} ({})",
        if rt.rules().is_enabled() { "enabled" } else { "disabled" },
        rt.rules().describe()
    );
    let _ = writeln!(out, "- SSL CA certificate: {}", config.tls.ca_cert.display());
    let _ = writeln!(out, "- SSL CA key: {}", config.tls.ca_key.display());
    let _ = writeln!(out, "- SSL leaf key: {}", config.tls.certs_key.display());
    let _ = writeln!(out, "- Certificates directory: {}", config.tls.certs_dir.display());
    let _ = writeln!(out, "- Certificates minted: {}", rt.certificates_minted());
    let _ = writeln!(out, "- Proxy chain: {}", rt.route());
    let _ = writeln!(out, "- Plugins directory: {}", rt.hooks().dir().display());
    let _ = writeln!(out, "- Plugins loaded: {}", rt.hooks().len());
    let _ = writeln!(out, "- Sessions accepted: {}", rt.sessions_accepted());
    let _ = writeln!(out, "- Requests served: {}", rt.requests_served());
    let _ = writeln!(out, "- Uptime: {}s", rt.uptime().as_secs());
    out
}

fn invalid_action(syntax: &str) -> String {
    format!("Invalid action\n Syntax\n {}\n", syntax)
}

fn cmd_verbose(rt: &ProxyRuntime, options: &[&str]) -> String {
    let current = rt.verbosity();
    let level = match options.first() {
        None => return format!("Verbose level is {}\n", current),
        Some(&"inc") => rt.set_verbosity(current.saturating_add(1)),
        Some(&"dec") => rt.set_verbosity(current.saturating_sub(1)),
        Some(_) => return invalid_action("verbose (inc|dec)"),
    };
    info!(level, "verbose level changed");
    format!("Verbose level is now {}\n", level)
}

fn cmd_threads(rt: &ProxyRuntime, options: &[&str]) -> String {
    let slots = rt.slots();
    slots.drain_completions();
    slots.reap();
    let current = slots.capacity();
    let capacity = match options.first() {
        None => return format!("Nb threads level is {}\n", current),
        Some(&"inc") if current < MAX_THREADS => slots.set_capacity(current + 1),
        Some(&"dec") if current > 1 => slots.set_capacity(current - 1),
        Some(&"inc") | Some(&"dec") => current,
        Some(_) => return invalid_action("threads (inc|dec)"),
    };
    info!(capacity, "session thread limit changed");
    format!("Nb threads level is now {}\n", capacity)
}

fn cmd_reload(rt: &ProxyRuntime, _: &[&str]) -> String {
    let slots = rt.slots();
    slots.drain_completions();
    slots.reap();
    match rt.hooks().reload_if(|| slots.live_count() == 0) {
        Ok(n) => format!("Plugins list successfully reloaded ({} loaded)\n", n),
        Err(HookError::Busy) => {
            warn!(live = slots.live_count(), "reload refused");
            format!("{}\n", HookError::Busy)
        }
        Err(e) => format!("Reload failed: {}\n", e),
    }
}

const PLUGIN_SYNTAX: &str = "plugin [list]|[list-all]|[toggle <id>]|[load <file>]";

fn cmd_plugin(rt: &ProxyRuntime, options: &[&str]) -> String {
    let hooks = rt.hooks();
    match options {
        [] | ["list"] => match hooks.list() {
            Ok(list) if list.is_empty() => "No plugin loaded\n".to_string(),
            Ok(list) => {
                let mut out = String::from("Plugins list:\n");
                for hook in list {
                    let _ = writeln!(out, "{}", hook);
                }
                out
            }
            Err(e) => format!("{}\n", e),
        },
        ["list-all"] => match hooks.available() {
            Ok(files) if files.is_empty() => {
                format!("No plugin file in {}\n", hooks.dir().display())
            }
            Ok(files) => {
                let mut out = format!("Plugins in {}:\n", hooks.dir().display());
                for (name, loaded) in files {
                    let state = if loaded { "loaded" } else { "not loaded" };
                    let _ = writeln!(out, "|_ {:<30} {}", name, state);
                }
                out
            }
            Err(e) => format!("{}\n", e),
        },
        ["toggle", id] => match parse_id(id) {
            Some(id) => match hooks.toggle(id) {
                Ok(active) => {
                    let prefix = if active { "" } else { "IN" };
                    format!("Plugin {} is now {}ACTIVE\n", id, prefix)
                }
                Err(e) => format!("{}\n", e),
            },
            None => invalid_action(PLUGIN_SYNTAX),
        },
        ["load", file] => match hooks.load_file(file) {
            Ok(id) => format!("Plugin '{}' loaded with id {}\n", file, id),
            Err(e) => format!("{}\n", e),
        },
        _ => invalid_action(PLUGIN_SYNTAX),
    }
}

/// Hook id in decimal or `0x` hexadecimal.
fn parse_id(s: &str) -> Option<usize> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

struct ControlClient {
    stream: UnixStream,
    pending: Vec<u8>,
}

/// Listening control socket plus the connected client, if any.
pub struct ControlServer {
    path: PathBuf,
    listener: UnixListener,
    client: Option<ControlClient>,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale control socket {:?}", path))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind control socket {:?}", path))?;
        listener.set_nonblocking(true)?;
        info!(path = %path.display(), "control interface listening");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
            client: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn listener_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    pub fn client_fd(&self) -> Option<BorrowedFd<'_>> {
        self.client.as_ref().map(|c| c.stream.as_fd())
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Accept a pending connection. A second client is turned away.
    pub fn accept(&mut self) -> Result<()> {
        let mut stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(anyhow::Error::from(e).context("control accept failed")),
        };
        if self.client.is_some() {
            debug!("control client refused, one is already connected");
            let _ = stream.write_all(BUSY_CLIENT.as_bytes());
            return Ok(());
        }
        stream.set_nonblocking(false)?;
        stream.write_all(MOTD.as_bytes())?;
        stream.write_all(PROMPT.as_bytes())?;
        info!("control client connected");
        self.client = Some(ControlClient {
            stream,
            pending: Vec::new(),
        });
        Ok(())
    }

    /// Read from the client and answer every complete line.
    pub fn service(&mut self, rt: &ProxyRuntime) -> Result<()> {
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };
        let mut chunk = [0u8; 1024];
        let n = match client.stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                self.client = None;
                return Err(anyhow::Error::from(e).context("control client read failed"));
            }
        };
        if n == 0 {
            info!("control client disconnected");
            self.client = None;
            return Ok(());
        }
        client.pending.extend_from_slice(&chunk[..n]);

        while let Some(end) = client.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = client.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let mut reply = dispatch(rt, line.trim());
            reply.push_str(PROMPT);
            if let Err(e) = client.stream.write_all(reply.as_bytes()) {
                self.client = None;
                return Err(anyhow::Error::from(e).context("control client write failed"));
            }
        }
        if client.pending.len() > MAX_LINE {
            warn!("control line too long, dropping client");
            self.client = None;
        }
        Ok(())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
