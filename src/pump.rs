//! Single-worker background queue with a manually drained foreground queue.
//!
//! Background tasks run strictly FIFO on one dedicated thread, each with
//! exclusive access to the worker state `W`. A task hands results back by
//! enqueueing closures on its [`ForegroundQueue`]; those run against the
//! foreground state `F` only when the embedder calls [`TaskPump::poll`].
//!
//! ```text
//!  submit() ──► [bg channel] ──► worker thread: op(&mut W, &ForegroundQueue)
//!                                                   │ enqueue()
//!  poll(&mut F) ◄── [fg channel] ◄──────────────────┘
//! ```

use std::io;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

/// Monotonic task identifier, starting at 1.
pub type TaskId = u64;

type BackgroundOp<W, F> = Box<dyn FnOnce(&mut W, &ForegroundQueue<F>) + Send>;
type ForegroundOp<F> = Box<dyn FnOnce(&mut F) + Send>;

struct BackgroundTask<W, F> {
    id: TaskId,
    op: BackgroundOp<W, F>,
}

struct ForegroundTask<F> {
    id: TaskId,
    op: ForegroundOp<F>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task pump is shut down")]
pub struct PumpClosed;

/// Handle a background task uses to post work to the foreground.
pub struct ForegroundQueue<F> {
    task_id: TaskId,
    tx: UnboundedSender<ForegroundTask<F>>,
}

impl<F> ForegroundQueue<F> {
    /// Id of the background task this queue belongs to.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn enqueue(&self, op: impl FnOnce(&mut F) + Send + 'static) {
        let task = ForegroundTask {
            id: self.task_id,
            op: Box::new(op),
        };
        if self.tx.send(task).is_err() {
            debug!(task_id = self.task_id, "Foreground queue closed, dropping result");
        }
    }
}

pub struct TaskPump<W, F> {
    tx: Option<UnboundedSender<BackgroundTask<W, F>>>,
    fg_rx: UnboundedReceiver<ForegroundTask<F>>,
    worker: Option<JoinHandle<()>>,
    next_id: TaskId,
    last_completed: TaskId,
}

impl<W: Send + 'static, F: 'static> TaskPump<W, F> {
    /// Start the worker thread, moving `state` onto it.
    pub fn spawn(name: &str, mut state: W) -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<BackgroundTask<W, F>>();
        let (fg_tx, fg_rx) = mpsc::unbounded_channel::<ForegroundTask<F>>();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(task) = rx.blocking_recv() {
                    let queue = ForegroundQueue {
                        task_id: task.id,
                        tx: fg_tx.clone(),
                    };
                    debug!(task_id = task.id, "Running background task");
                    (task.op)(&mut state, &queue);
                }
                debug!("Background queue closed, worker exiting");
            })?;

        Ok(Self {
            tx: Some(tx),
            fg_rx,
            worker: Some(worker),
            next_id: 1,
            last_completed: 0,
        })
    }

    /// Queue work for the background thread.
    pub fn submit(
        &mut self,
        op: impl FnOnce(&mut W, &ForegroundQueue<F>) + Send + 'static,
    ) -> Result<TaskId, PumpClosed> {
        let tx = self.tx.as_ref().ok_or(PumpClosed)?;
        let id = self.next_id;
        tx.send(BackgroundTask {
            id,
            op: Box::new(op),
        })
        .map_err(|_| PumpClosed)?;
        self.next_id += 1;
        Ok(id)
    }

    /// Run every queued foreground closure against `target`, in order.
    /// Never blocks. Returns how many ran.
    pub fn poll(&mut self, target: &mut F) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.fg_rx.try_recv() {
            (task.op)(target);
            self.last_completed = task.id;
            ran += 1;
        }
        ran
    }

    /// Id of the task whose foreground work ran most recently (0 if none).
    pub fn completed_task_id(&self) -> TaskId {
        self.last_completed
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Close the queue and join the worker after it drains every queued task.
    /// Foreground work produced meanwhile stays queued for a final `poll`.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Background worker panicked");
            }
        }
    }
}

impl<W, F> Drop for TaskPump<W, F> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_order() {
        let mut pump: TaskPump<Vec<u64>, Vec<u64>> = TaskPump::spawn("test-worker", Vec::new()).unwrap();
        for _ in 0..5 {
            pump.submit(|seen, fg| {
                seen.push(fg.task_id());
                let snapshot = seen.clone();
                fg.enqueue(move |out| *out = snapshot);
            })
            .unwrap();
        }
        pump.shutdown();

        let mut out = Vec::new();
        assert_eq!(pump.poll(&mut out), 5);
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
        assert_eq!(pump.completed_task_id(), 5);
    }

    #[test]
    fn test_poll_is_non_blocking() {
        let mut pump: TaskPump<(), u32> = TaskPump::spawn("test-worker", ()).unwrap();
        pump.submit(|_, fg| {
            std::thread::sleep(Duration::from_millis(50));
            fg.enqueue(|n| *n += 1);
        })
        .unwrap();

        let mut n = 0;
        assert_eq!(pump.poll(&mut n), 0);
        pump.shutdown();
        pump.poll(&mut n);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let mut pump: TaskPump<(), ()> = TaskPump::spawn("test-worker", ()).unwrap();
        pump.shutdown();
        assert_eq!(pump.submit(|_, _| {}), Err(PumpClosed));
        assert!(!pump.is_running());
    }
}
