//! Single-slot background worker.
//!
//! Each worker owns one named thread and accepts at most one job at a time. A submission while a job
//! is pending or running is refused immediately; nothing is queued. The submitter gets a [`Ticket`]
//! that resolves once the job has finished and the slot is free again.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use tracing::{debug, warn};

type Job<R> = Box<dyn FnOnce() -> R + Send + 'static>;

/// Why a job was not accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejected {
    Busy,
    Stopped,
}

/// Completion handle for one accepted job.
#[derive(Debug)]
pub struct Ticket<R> {
    rx: Receiver<R>,
}

impl<R> Ticket<R> {
    /// Block until the job finishes. `None` if the job panicked or the worker is gone.
    pub fn wait(self) -> Option<R> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_result(&self) -> Result<R, TryRecvError> {
        self.rx.try_recv()
    }
}

pub struct SlotWorker<R> {
    name: String,
    busy: Arc<AtomicBool>,
    job_tx: Option<Sender<(Job<R>, Sender<R>)>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> SlotWorker<R> {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (job_tx, job_rx) = bounded::<(Job<R>, Sender<R>)>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let busy_worker = Arc::clone(&busy);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || {
                while let Ok((job, done_tx)) = job_rx.recv() {
                    debug!(worker = %thread_name, "job started");
                    let outcome = panic::catch_unwind(AssertUnwindSafe(job));
                    // free the slot before reporting so a waiter can resubmit immediately
                    busy_worker.store(false, Ordering::Release);
                    match outcome {
                        Ok(result) => {
                            let _ = done_tx.send(result);
                            debug!(worker = %thread_name, "job finished");
                        }
                        // dropping done_tx resolves the ticket to None
                        Err(_) => warn!(worker = %thread_name, "job panicked"),
                    }
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            busy,
            job_tx: Some(job_tx),
            handle: Some(handle),
        })
    }

    /// Hand a job to the worker without blocking.
    pub fn try_submit<F>(&self, job: F) -> Result<Ticket<R>, Rejected>
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let Some(job_tx) = self.job_tx.as_ref() else {
            return Err(Rejected::Stopped);
        };
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Rejected::Busy);
        }
        let (done_tx, done_rx) = bounded(1);
        if job_tx.try_send((Box::new(job), done_tx)).is_err() {
            self.busy.store(false, Ordering::Release);
            warn!(worker = %self.name, "worker channel unavailable");
            return Err(Rejected::Stopped);
        }
        Ok(Ticket { rx: done_rx })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R> Drop for SlotWorker<R> {
    fn drop(&mut self) {
        // closing the channel ends the loop once the running job returns
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_submission_is_rejected_while_running() {
        let worker = SlotWorker::<u32>::spawn("test").expect("spawn");
        let (release_tx, release_rx) = bounded::<()>(0);
        let first = worker
            .try_submit(move || {
                let _ = release_rx.recv();
                1
            })
            .expect("accepted");
        assert!(worker.is_busy());
        assert_eq!(worker.try_submit(|| 2).err(), Some(Rejected::Busy));

        release_tx.send(()).expect("release");
        assert_eq!(first.wait(), Some(1));
        assert!(!worker.is_busy());

        let second = worker.try_submit(|| 3).expect("accepted after completion");
        assert_eq!(second.wait(), Some(3));
    }

    #[test]
    fn panicking_job_frees_the_slot() {
        let worker = SlotWorker::<u32>::spawn("panic").expect("spawn");
        let ticket = worker
            .try_submit(|| panic!("job failed"))
            .expect("accepted");
        assert_eq!(ticket.wait(), None);
        assert!(!worker.is_busy());

        let next = worker.try_submit(|| 7).expect("accepted after panic");
        assert_eq!(next.wait(), Some(7));
    }

    #[test]
    fn drop_waits_for_running_job() {
        let flag = Arc::new(AtomicBool::new(false));
        let ticket = {
            let worker = SlotWorker::<()>::spawn("drop").expect("spawn");
            let flag = Arc::clone(&flag);
            worker
                .try_submit(move || {
                    thread::sleep(Duration::from_millis(20));
                    flag.store(true, Ordering::SeqCst);
                })
                .expect("accepted")
        };
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(ticket.wait(), Some(()));
    }
}
