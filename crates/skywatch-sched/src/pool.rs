//! A bounded pool of named worker threads fed over a crossbeam channel.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads named `<name>-N` sharing a queue of
    /// `capacity` pending jobs.
    pub fn new(name: &str, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = bounded::<Job>(capacity.max(1));

        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("spawning worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Try to hand `job` to the pool, giving up after `timeout` when every
    /// worker is busy and the queue is full.
    pub fn commit_timeout<F>(&self, task: &str, timeout: Duration, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.send_timeout(Box::new(job), timeout) {
            Ok(()) => {
                debug!("pool commit({task}) => true");
                true
            }
            Err(_) => {
                warn!("pool commit({task}) => false");
                false
            }
        }
    }

    /// Stop accepting work and wait for in-flight jobs to finish.
    pub fn shutdown(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
