// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Bounded pool of session threads.
//!
//! Liveness is a `u64` bitmask, one bit per slot. Each session thread writes
//! its slot index to a completion socket when it finishes; the dispatcher
//! drains that socket inside its readiness wait and joins the thread.

use crate::config::MAX_THREADS;
use crate::error::SlotError;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Byte written to the completion socket that only wakes the dispatcher.
pub const WAKE_ONLY: u8 = 0xff;

pub struct SlotTable {
    live: AtomicU64,
    capacity: AtomicUsize,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
    done_tx: Arc<UnixStream>,
    done_rx: UnixStream,
}

impl SlotTable {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let (done_tx, done_rx) = UnixStream::pair()?;
        done_rx.set_nonblocking(true)?;
        Ok(Self {
            live: AtomicU64::new(0),
            capacity: AtomicUsize::new(capacity.clamp(1, MAX_THREADS)),
            handles: Mutex::new((0..MAX_THREADS).map(|_| None).collect()),
            done_tx: Arc::new(done_tx),
            done_rx,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Change the bound used by future claims; live slots above it keep running.
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let capacity = capacity.clamp(1, MAX_THREADS);
        self.capacity.store(capacity, Ordering::SeqCst);
        capacity
    }

    pub fn is_live(&self, index: usize) -> bool {
        index < MAX_THREADS && self.live.load(Ordering::SeqCst) & (1 << index) != 0
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst).count_ones() as usize
    }

    /// Lowest free slot below the current capacity.
    pub fn claim_slot(&self) -> Result<usize, SlotError> {
        let capacity = self.capacity();
        let live = self.live.load(Ordering::SeqCst);
        (0..capacity)
            .find(|i| live & (1 << i) == 0)
            .ok_or(SlotError::Full(capacity))
    }

    /// Mark `index` live and run `session` on a new thread in that slot.
    pub fn spawn<F>(&self, index: usize, session: F) -> anyhow::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if index >= MAX_THREADS {
            return Err(SlotError::OutOfRange(index).into());
        }
        let bit = 1u64 << index;
        if self.live.fetch_or(bit, Ordering::SeqCst) & bit != 0 {
            return Err(SlotError::AlreadyLive(index).into());
        }

        let done = self.done_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{}", index))
            .spawn(move || {
                session();
                let mut done: &UnixStream = &done;
                if let Err(e) = done.write_all(&[index as u8]) {
                    warn!(slot = index, error = %e, "failed to signal session completion");
                }
            });

        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.live.fetch_and(!bit, Ordering::SeqCst);
                return Err(anyhow::Error::from(e).context("failed to spawn session thread"));
            }
        };
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| anyhow::anyhow!("slot handles mutex poisoned: {}", e))?;
        handles[index] = Some(handle);
        debug!(slot = index, "session spawned");
        Ok(())
    }

    fn join_slot(&self, index: usize, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            error!(slot = index, "session thread panicked");
        }
        self.live.fetch_and(!(1u64 << index), Ordering::SeqCst);
        debug!(slot = index, "slot released");
    }

    /// Join every live slot whose thread has already finished. Returns how many.
    pub fn reap(&self) -> usize {
        let finished: Vec<(usize, JoinHandle<()>)> = match self.handles.lock() {
            Ok(mut handles) => handles
                .iter_mut()
                .enumerate()
                .filter_map(|(i, h)| {
                    if h.as_ref().is_some_and(|h| h.is_finished()) {
                        h.take().map(|h| (i, h))
                    } else {
                        None
                    }
                })
                .collect(),
            Err(e) => {
                error!("slot handles mutex poisoned: {}", e);
                return 0;
            }
        };
        let count = finished.len();
        for (index, handle) in finished {
            self.join_slot(index, handle);
        }
        count
    }

    /// Descriptor that turns readable when a session finished.
    pub fn completion_fd(&self) -> BorrowedFd<'_> {
        self.done_rx.as_fd()
    }

    /// Handle a session thread can use to wake the dispatcher.
    pub fn waker(&self) -> Arc<UnixStream> {
        self.done_tx.clone()
    }

    /// Consume pending completion notices, joining each finished slot.
    pub fn drain_completions(&self) -> usize {
        let mut buf = [0u8; MAX_THREADS];
        let mut indices = Vec::new();
        loop {
            match (&self.done_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => indices.extend(buf[..n].iter().copied().filter(|b| *b != WAKE_ONLY)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "completion socket read failed");
                    break;
                }
            }
        }
        let mut joined = 0;
        for index in indices.into_iter().map(usize::from) {
            let handle = match self.handles.lock() {
                Ok(mut handles) => handles.get_mut(index).and_then(Option::take),
                Err(_) => None,
            };
            // not stored yet: the next reap picks it up
            if let Some(handle) = handle {
                self.join_slot(index, handle);
                joined += 1;
            }
        }
        joined
    }

    /// Block until every session thread has been joined.
    pub fn join_all(&self) {
        let all: Vec<(usize, JoinHandle<()>)> = match self.handles.lock() {
            Ok(mut handles) => handles
                .iter_mut()
                .enumerate()
                .filter_map(|(i, h)| h.take().map(|h| (i, h)))
                .collect(),
            Err(_) => return,
        };
        for (index, handle) in all {
            self.join_slot(index, handle);
        }
        self.drain_completions();
    }
}
