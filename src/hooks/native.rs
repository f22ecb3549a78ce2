// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! In-process hooks backed by Rust closures.

use super::hook::{Direction, HookOutput, HookProgram};
use crate::error::HookError;

type HookFn = dyn Fn(Direction, u64, &[u8]) -> Result<HookOutput, HookError> + Send + Sync;

pub struct FnHook {
    f: Box<HookFn>,
}

impl FnHook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Direction, u64, &[u8]) -> Result<HookOutput, HookError> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// Hook that appends `header` as the last header of every request.
    pub fn request_header(header: impl Into<String>) -> Self {
        let header = header.into();
        Self::new(move |direction, _, payload| {
            if direction != Direction::Request {
                return Ok(HookOutput::Unchanged);
            }
            let Some(end) = payload.windows(4).position(|w| w == b"\r\n\r\n") else {
                return Ok(HookOutput::Unchanged);
            };
            let split = end + 2;
            let mut out = Vec::with_capacity(payload.len() + header.len() + 2);
            out.extend_from_slice(&payload[..split]);
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&payload[split..]);
            Ok(HookOutput::Owned(out))
        })
    }
}

impl HookProgram for FnHook {
    fn invoke(
        &self,
        direction: Direction,
        transaction_id: u64,
        payload: &[u8],
    ) -> Result<HookOutput, HookError> {
        (self.f)(direction, transaction_id, payload)
    }
}
