//! Consumer execution context: work queued from the I/O threads and drained by the host once per
//! tick on its own thread.

use crossbeam_channel::{Receiver, Sender};

type Task = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct MainQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl MainQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn queue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // both ends live in self, so the channel cannot be disconnected
        let _ = self.tx.send(Box::new(task));
    }

    /// Run the tasks queued before this call. Tasks queued while draining wait for the next tick.
    pub fn drain(&self) -> usize {
        let pending = self.rx.len();
        let mut ran = 0;
        while ran < pending {
            match self.rx.try_recv() {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}
