// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Folding a payload through the active hooks.

use super::hook::{Direction, HookOutput};
use super::registry::HookRegistry;
use crate::error::HookError;
use std::borrow::Cow;
use tracing::{debug, error, trace};

impl HookRegistry {
    /// Pass `payload` through every active hook in priority order.
    ///
    /// Each hook sees the previous hook's output. The caller's buffer is
    /// only ever borrowed: if no hook replaces it, the borrow is returned
    /// untouched. A replaced intermediate buffer is dropped as soon as the
    /// next hook replaces it in turn.
    ///
    /// A failing hook is disabled and the whole transaction is discarded.
    pub fn apply<'a>(
        &self,
        direction: Direction,
        transaction_id: u64,
        payload: &'a [u8],
    ) -> Result<Cow<'a, [u8]>, HookError> {
        let hooks = self.read()?;
        let mut current = Cow::Borrowed(payload);

        for hook in hooks.iter() {
            if !hook.is_active() {
                continue;
            }
            let Some(program) = hook.program.as_deref() else {
                debug!(name = hook.name(), language = %hook.language(), "unsupported hook skipped");
                continue;
            };

            match program.invoke(direction, transaction_id, &current) {
                Ok(HookOutput::Unchanged) => {}
                Ok(HookOutput::Owned(next)) if next.is_empty() => {
                    error!(name = hook.name(), "hook returned an empty payload, disabling it");
                    hook.set_active(false);
                    return Err(HookError::EmptyOutput {
                        name: hook.name().to_string(),
                    });
                }
                Ok(HookOutput::Owned(next)) => {
                    trace!(name = hook.name(), len = next.len(), "hook replaced payload");
                    current = Cow::Owned(next);
                }
                Err(e) => {
                    error!(name = hook.name(), error = %e, "hook failed, disabling it");
                    hook.set_active(false);
                    return Err(e);
                }
            }
        }

        Ok(current)
    }
}
