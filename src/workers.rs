//! Worker pool for request handlers and delegated TLS tasks.
//!
//! The controller thread never blocks on application code or long-running
//! crypto; both are shipped here. Results travel back to the controller
//! as control requests through its channel and waker.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize, name: &str) -> Self {
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = Arc::clone(&receiver);
            let thread_name = format!("{name}-worker-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&receiver))
                .unwrap_or_else(|e| panic!("Failed to spawn {thread_name}: {e}"));
            handles.push(handle);
        }
        Self {
            sender: Some(sender),
            handles,
        }
    }

    /// Queues a job. Jobs submitted after shutdown are dropped with a
    /// warning; shutdown only happens once the controller loop has exited.
    pub(crate) fn execute(&self, job: Job) {
        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("worker pool is gone; dropping job");
                }
            }
            None => warn!("worker pool is shut down; dropping job"),
        }
    }

    /// Closes the queue and joins the workers. Queued jobs still run.
    pub(crate) fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    warn!("worker queue lock poisoned; stopping worker");
                    return;
                }
            };
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => {
                debug!("worker queue closed; stopping worker");
                return;
            }
        }
    }
}
