// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Log setup with a filter the control plane can change at runtime.

use crate::config::MAX_VERBOSE_LEVEL;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

/// Filter directives for a verbosity level.
pub fn directives(level: u8) -> &'static str {
    match level.min(MAX_VERBOSE_LEVEL) {
        0 => "info",
        1 => "info,proxenet=debug",
        _ => "trace",
    }
}

/// Handle to the installed filter.
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogControl {
    pub fn set_level(&self, level: u8) -> anyhow::Result<()> {
        self.handle
            .reload(EnvFilter::new(directives(level)))
            .map_err(|e| anyhow::anyhow!("failed to change log level: {}", e))
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: u8) -> anyhow::Result<LogControl> {
    let initial =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(level)));
    let (filter, handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))?;
    Ok(LogControl { handle })
}
