//! Fixed-size worker pool fed from a mutex/condvar guarded job queue.

use eco_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<JobQueue>,
    available: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("worker pool needs at least one thread".into()));
        }
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("eco-worker-{}", i))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        debug!(workers = size, "Worker pool started");
        Ok(Self { shared, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task; the handle yields its result or the panic it raised
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));
            // The receiver may already be gone; nothing to report then
            let _ = tx.send(result);
        });
        let mut queue = self.shared.queue.lock();
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        TaskHandle { rx }
    }

    /// Run every task and wait for all of them. Results come back in
    /// submission order; the first failure is reported only after every task
    /// has finished, so nothing outlives the barrier.
    pub fn run_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let handles: Vec<TaskHandle<T>> = tasks.into_iter().map(|t| self.submit(t)).collect();
        let mut results = Vec::with_capacity(handles.len());
        let mut failure = None;
        for handle in handles {
            match handle.wait() {
                Ok(value) => results.push(value),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        trace!("Worker pool stopped");
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        job();
    }
}

/// Completion handle for a submitted task
pub struct TaskHandle<T> {
    rx: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(Error::Scheduler(format!(
                "task panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(_) => Err(Error::Scheduler("task dropped before completion".into())),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
