//! Worker threads running simulation copies to completion.
//!
//! ## Overview
//!
//! [`WorkerPool::spawn`] starts one thread per job. Each job owns everything it touches (in
//! practice a cloned [`SirepoClient`](sirepo_backend::SirepoClient) of its own), so the workers
//! share no mutable state. When a job finishes, its worker posts `(job index, result)` on a
//! channel; [`WorkerPool::join`] is the single join point that waits for every worker and returns
//! the results in job order, whatever order they finished in.
//!
//! An optional [`Semaphore`] bounds how many jobs run at the same time. There is no timeout: a
//! job that never returns blocks `join`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver};
use sirepo_backend::*;

use crate::utils::Semaphore;

/// Terminal state of one job, or the error that ended it.
pub type JobResult = SirepoResult<String>;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    results: Receiver<(usize, JobResult)>,
}

impl WorkerPool {
    /// Starts one worker per job; at most `max_workers` of them run their job concurrently.
    pub fn spawn<F>(jobs: Vec<F>, max_workers: Option<usize>) -> Self
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        let (sender, results) = unbounded();
        let sem = max_workers.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let handles = jobs
            .into_iter()
            .enumerate()
            .map(|(index, job)| {
                let sender = sender.clone();
                let sem = sem.clone();
                thread::spawn(move || {
                    let _permit = sem.as_ref().map(|s| s.access());
                    let result = job();
                    // The receiver lives as long as the pool.
                    let _ = sender.send((index, result));
                })
            })
            .collect();
        Self { handles, results }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker and returns the job results in job order.
    ///
    /// # Errors
    ///
    /// [`SirepoError::InternalConsistency`] if a worker panicked or exited without reporting.
    pub fn join(self) -> SirepoResult<Vec<JobResult>> {
        let count = self.handles.len();
        let mut panicked = 0;
        for handle in self.handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        let mut slots: Vec<Option<JobResult>> = (0..count).map(|_| None).collect();
        for (index, result) in self.results.try_iter() {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }
        if panicked > 0 {
            return Err(SirepoError::InternalConsistency(format!(
                "{} of {} workers panicked",
                panicked, count
            )));
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    SirepoError::InternalConsistency(format!("worker {} reported no result", index))
                })
            })
            .collect()
    }
}
