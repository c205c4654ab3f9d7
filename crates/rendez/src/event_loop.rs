// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded cooperative task loop.
//!
//! One [`EventLoop`] runs per process. Every registration result, message
//! delivery and RPC completion is posted here through a [`LoopHandle`] and
//! executed on the thread that calls [`EventLoop::run`]. Background I/O
//! threads never invoke user callbacks directly.
//!
//! Delayed tasks are ordered by due time, ties broken by post order. A task
//! that panics is logged and the loop keeps going.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Task),
    Delayed(DelayedTask),
    Wake,
}

struct DelayedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    // Reversed: BinaryHeap is a max-heap, earliest (due, seq) must pop first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cloneable, thread-safe handle used to post work onto the loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Command>,
    seq: Arc<AtomicU64>,
    stop_requested: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Run `task` at the next loop iteration.
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Command::Run(Box::new(task))).is_err() {
            log::debug!("[event_loop] post_task after loop was dropped");
        }
    }

    /// Run `task` no earlier than `delay` from now.
    pub fn post_delayed_task<F>(&self, task: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        let delayed = DelayedTask {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task: Box::new(task),
        };
        if self.tx.send(Command::Delayed(delayed)).is_err() {
            log::debug!("[event_loop] post_delayed_task after loop was dropped");
        }
    }

    /// Ask the loop to return from `run` after the current task.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let _ = self.tx.send(Command::Wake);
    }
}

/// The per-process task loop.
pub struct EventLoop {
    rx: Receiver<Command>,
    handle: LoopHandle,
    delayed: BinaryHeap<DelayedTask>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            rx,
            handle: LoopHandle {
                tx,
                seq: Arc::new(AtomicU64::new(0)),
                stop_requested: Arc::new(AtomicBool::new(false)),
            },
            delayed: BinaryHeap::new(),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.post_task(task);
    }

    pub fn post_delayed_task<F>(&self, task: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.post_delayed_task(task, delay);
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Block, running tasks until [`LoopHandle::stop`] is called.
    pub fn run(&mut self) {
        self.run_inner(None, &mut || false);
    }

    /// Run tasks for at most `duration`.
    pub fn run_for(&mut self, duration: Duration) {
        self.run_inner(Some(Instant::now() + duration), &mut || false);
    }

    /// Run tasks until `done` returns true (checked after every task) or
    /// `timeout` elapses. Returns whether `done` became true.
    pub fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        if done() {
            return true;
        }
        self.run_inner(Some(Instant::now() + timeout), &mut done)
    }

    /// Run every task that is ready now, without waiting for delayed ones.
    pub fn run_until_idle(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(cmd) = self.rx.try_recv() {
                progressed = true;
                self.dispatch(cmd);
            }
            let now = Instant::now();
            while self.delayed.peek().is_some_and(|d| d.due <= now) {
                if let Some(d) = self.delayed.pop() {
                    progressed = true;
                    run_task(d.task);
                }
            }
            if !progressed {
                break;
            }
        }
        self.handle.stop_requested.store(false, Ordering::Release);
    }

    /// Number of delayed tasks not yet due.
    pub fn pending_delayed(&self) -> usize {
        self.delayed.len()
    }

    fn run_inner(&mut self, deadline: Option<Instant>, done: &mut dyn FnMut() -> bool) -> bool {
        loop {
            if self.handle.stop_requested.swap(false, Ordering::AcqRel) {
                return false;
            }

            let now = Instant::now();
            if let Some(top) = self.delayed.peek() {
                if top.due <= now {
                    if let Some(d) = self.delayed.pop() {
                        run_task(d.task);
                    }
                    if done() {
                        return true;
                    }
                    continue;
                }
            }
            if deadline.is_some_and(|d| d <= now) {
                return false;
            }

            let wait = match (self.delayed.peek(), deadline) {
                (Some(top), Some(d)) => Some(top.due.min(d).saturating_duration_since(now)),
                (Some(top), None) => Some(top.due.saturating_duration_since(now)),
                (None, Some(d)) => Some(d.saturating_duration_since(now)),
                (None, None) => None,
            };

            let cmd = match wait {
                Some(w) => match self.rx.recv_timeout(w) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return false,
                },
                None => match self.rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => return false,
                },
            };

            if self.dispatch(cmd) && done() {
                return true;
            }
        }
    }

    /// Returns true when a task ran.
    fn dispatch(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Run(task) => {
                run_task(task);
                true
            }
            Command::Delayed(d) => {
                self.delayed.push(d);
                false
            }
            Command::Wake => false,
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn run_task(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!("[event_loop] task panicked: {}", msg);
    }
}
