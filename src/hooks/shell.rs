// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shell hooks: `.sh` files run through an interpreter, one process per call.
//!
//! Calls are `sh <file> request|response <txid>` with the payload on stdin;
//! stdout is the new payload, and empty stdout leaves the payload unchanged.
//! Lifecycle calls are `sh <file> onload` and `sh <file> onleave`.

use super::engine::HookEngine;
use super::hook::{Direction, HookOutput, HookProgram, Language};
use crate::error::HookError;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShellEngine {
    interpreter: PathBuf,
    timeout: Duration,
}

impl Default for ShellEngine {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("sh"),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ShellEngine {
    pub fn new(interpreter: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }
}

impl HookEngine for ShellEngine {
    fn language(&self) -> Language {
        Language::Shell
    }

    fn load(&self, path: &Path) -> Result<Box<dyn HookProgram>, HookError> {
        let name = path.display().to_string();
        let meta = std::fs::metadata(path).map_err(|source| HookError::Io {
            name: name.clone(),
            source,
        })?;
        if !meta.is_file() {
            return Err(HookError::Invocation {
                name,
                reason: "not a regular file".to_string(),
            });
        }
        debug!(path = %path.display(), "loaded shell hook");
        Ok(Box::new(ShellHook {
            name,
            path: path.to_path_buf(),
            interpreter: self.interpreter.clone(),
            timeout: self.timeout,
        }))
    }
}

struct ShellHook {
    name: String,
    path: PathBuf,
    interpreter: PathBuf,
    timeout: Duration,
}

impl ShellHook {
    fn io_err(&self, source: std::io::Error) -> HookError {
        HookError::Io {
            name: self.name.clone(),
            source,
        }
    }

    fn failed(&self, reason: String) -> HookError {
        HookError::Invocation {
            name: self.name.clone(),
            reason,
        }
    }

    fn run(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>, HookError> {
        let mut child = Command::new(&self.interpreter)
            .arg(&self.path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.io_err(e))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (output, errors, status) = thread::scope(|s| {
            s.spawn(move || {
                if let Some(mut w) = stdin {
                    // scripts may exit without reading their input
                    let _ = w.write_all(input);
                }
            });
            let out = s.spawn(move || {
                let mut buf = Vec::new();
                if let Some(mut r) = stdout {
                    r.read_to_end(&mut buf)?;
                }
                Ok::<_, std::io::Error>(buf)
            });
            let err = s.spawn(move || {
                let mut buf = String::new();
                if let Some(mut r) = stderr {
                    let _ = r.read_to_string(&mut buf);
                }
                buf
            });

            let status = match child.wait_timeout(self.timeout) {
                Ok(Some(status)) => Ok(status),
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    Err(self.failed(format!("timed out after {:?}", self.timeout)))
                }
                Err(e) => Err(self.io_err(e)),
            };
            (out.join(), err.join(), status)
        });

        let status = status?;
        let errors = errors.unwrap_or_default();
        if !status.success() {
            return Err(self.failed(format!("exited with {}: {}", status, errors.trim())));
        }
        match output {
            Ok(Ok(buf)) => Ok(buf),
            Ok(Err(e)) => Err(self.io_err(e)),
            Err(_) => Err(self.failed("stdout reader panicked".to_string())),
        }
    }
}

impl HookProgram for ShellHook {
    fn on_load(&self) -> Result<(), HookError> {
        self.run(&["onload"], &[]).map(|_| ())
    }

    fn invoke(
        &self,
        direction: Direction,
        transaction_id: u64,
        payload: &[u8],
    ) -> Result<HookOutput, HookError> {
        let txid = transaction_id.to_string();
        let out = self.run(&[direction.as_str(), &txid], payload)?;
        trace!(hook = %self.name, len = out.len(), "shell hook returned");
        if out.is_empty() {
            Ok(HookOutput::Unchanged)
        } else {
            Ok(HookOutput::Owned(out))
        }
    }

    fn on_leave(&self) -> Result<(), HookError> {
        self.run(&["onleave"], &[]).map(|_| ())
    }
}
