// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatch pool.
//!
//! A fixed set of worker threads runs every protocol handler, so the event
//! loop never blocks on registry locks or socket writes to other agents.
//!
//! ```text
//!  event loop ---+
//!                |   Task    +----------+
//!  heartbeat  ---+---------> | worker 0 | --> Dispatcher::execute
//!                |  channel  | worker 1 |
//!  eviction   ---+           | ...      |
//!                            +----------+
//! ```
//!
//! A task that panics or fails is logged and dropped; the worker keeps
//! going. Shutdown closes the channel and lets queued tasks finish.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error};

use crate::attachment::Attachment;
use crate::protocol::{AgentId, Frame};

mod handlers;

pub use handlers::{DebugReport, Dispatcher, HandlerError, DEBUG_REPORT_VERSION};

/// Work item for the pool.
#[derive(Debug)]
pub enum Task {
    /// Handle one inbound envelope
    Process {
        frame: Frame,
        attachment: Arc<Attachment>,
    },

    /// A connection closed; detach it from its client
    ConnectionClosed { attachment: Arc<Attachment> },

    /// Tell every other agent that `agent` disconnected
    BroadcastDisconnection { agent: AgentId },
}

/// Cloneable handle used to submit tasks.
#[derive(Debug, Clone)]
pub struct TaskSender {
    tx: Sender<Task>,
}

impl TaskSender {
    /// Queue a task. Returns `false` once the pool is shut down.
    pub fn submit(&self, task: Task) -> bool {
        self.tx.send(task).is_ok()
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    sender: Option<TaskSender>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers executing tasks with `dispatcher`.
    pub fn spawn(threads: usize, dispatcher: Arc<Dispatcher>) -> io::Result<Self> {
        let (tx, rx) = channel::unbounded();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let rx = rx.clone();
            let dispatcher = dispatcher.clone();
            let handle = thread::Builder::new()
                .name(format!("hdds-router-worker-{}", index))
                .spawn(move || worker_loop(rx, dispatcher))?;
            workers.push(handle);
        }

        debug!("[DISPATCH] {} workers started", threads);

        Ok(Self {
            sender: Some(TaskSender { tx }),
            workers,
        })
    }

    /// Handle for submitting tasks.
    ///
    /// Every clone must be dropped for [`WorkerPool::shutdown`] to return.
    pub fn sender(&self) -> Option<TaskSender> {
        self.sender.clone()
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting tasks, let queued tasks finish, join the workers.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("[DISPATCH] worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Task>, dispatcher: Arc<Dispatcher>) {
    for task in rx.iter() {
        dispatcher.metrics().record_task_started();
        if panic::catch_unwind(AssertUnwindSafe(|| dispatcher.execute(task))).is_err() {
            error!("[DISPATCH] handler panicked, task dropped");
        }
        dispatcher.metrics().record_task_finished();
    }
}

// ============================================================================
// Tests
// ============================================================================
