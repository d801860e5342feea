// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Delivery of ready notifications to client callbacks
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests (both dispatchers)
//!
//! The receive path only queues a job here; callbacks always run on a worker thread.
//!
//! IMPLEMENTATIONS:
//!   - DedicatedDispatcher: one worker per attached client
//!   - PoolDispatcher: a fixed set of workers, client N always served by worker N % workers
//!
//! Both preserve the order of notifications for a single client.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::DispatchMode;
use crate::registry::Callback;
use crate::wire::ClientId;
use crate::{IccError, ReadyMask, Result};

struct Job {
    client: ClientId,
    ready: ReadyMask,
    callback: Callback,
}

pub trait Dispatcher: Send + Sync {
    /// Prepares delivery for `client`.
    fn attach(&self, client: ClientId) -> Result<()>;
    /// Stops delivery for `client`; queued jobs may still run.
    fn detach(&self, client: ClientId);
    /// Queues one notification. Never runs `callback` on the calling thread.
    fn dispatch(&self, client: ClientId, ready: ReadyMask, callback: Callback);
    /// Stops every worker.
    fn shutdown(&self);
}

pub fn dispatcher_for(mode: &DispatchMode) -> Box<dyn Dispatcher> {
    match *mode {
        DispatchMode::Dedicated => Box::new(DedicatedDispatcher::new()),
        DispatchMode::Pool { workers } => Box::new(PoolDispatcher::new(workers)),
    }
}

struct Worker {
    jobs: Sender<Job>,
    join: JoinHandle<()>,
}

impl Worker {
    fn spawn(name: String) -> Result<Self> {
        let (jobs, rx) = mpsc::channel::<Job>();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in rx {
                    (job.callback)(job.client, job.ready);
                }
            })
            .map_err(|err| {
                warn!("icc: failed to spawn {name}: {err}");
                IccError::Dispatch
            })?;
        Ok(Self { jobs, join })
    }

    fn submit(&self, job: Job) -> bool {
        self.jobs.send(job).is_ok()
    }

    /// Closes the queue and waits for the worker unless called from the worker itself.
    fn stop(self) {
        let Self { jobs, join } = self;
        drop(jobs);
        if join.thread().id() != thread::current().id() {
            let _ = join.join();
        }
    }
}

/// One worker thread per client.
#[derive(Default)]
pub struct DedicatedDispatcher {
    workers: Mutex<HashMap<ClientId, Worker>>,
}

impl DedicatedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatcher for DedicatedDispatcher {
    fn attach(&self, client: ClientId) -> Result<()> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&client) {
            return Ok(());
        }
        workers.insert(client, Worker::spawn(format!("icc-{client}"))?);
        debug!("icc: dedicated worker started for {client}");
        Ok(())
    }

    fn detach(&self, client: ClientId) {
        let worker = self.workers.lock().remove(&client);
        if let Some(worker) = worker {
            worker.stop();
        }
    }

    fn dispatch(&self, client: ClientId, ready: ReadyMask, callback: Callback) {
        let workers = self.workers.lock();
        match workers.get(&client) {
            Some(worker) => {
                if !worker.submit(Job { client, ready, callback }) {
                    warn!("icc: worker for {client} is gone; notification dropped");
                }
            }
            None => debug!("icc: no worker for {client}; notification dropped"),
        }
    }

    fn shutdown(&self) {
        let workers: Vec<Worker> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.stop();
        }
    }
}

/// Fixed worker pool keyed by client id. Workers start on first attach.
pub struct PoolDispatcher {
    size: usize,
    workers: Mutex<Vec<Worker>>,
}

impl PoolDispatcher {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1), workers: Mutex::new(Vec::new()) }
    }
}

impl Dispatcher for PoolDispatcher {
    fn attach(&self, _client: ClientId) -> Result<()> {
        let mut workers = self.workers.lock();
        while workers.len() < self.size {
            let index = workers.len();
            workers.push(Worker::spawn(format!("icc-pool-{index}"))?);
        }
        Ok(())
    }

    fn detach(&self, _client: ClientId) {}

    fn dispatch(&self, client: ClientId, ready: ReadyMask, callback: Callback) {
        let workers = self.workers.lock();
        let Some(worker) = workers.get(client.index() % self.size) else {
            debug!("icc: dispatch pool idle; notification for {client} dropped");
            return;
        };
        if !worker.submit(Job { client, ready, callback }) {
            warn!("icc: pool worker gone; notification for {client} dropped");
        }
    }

    fn shutdown(&self) {
        let workers: Vec<Worker> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.stop();
        }
    }
}
