//! Fixed-size pool of threads for calls that must block.
//!
//! Workers never touch loop state. A job carries its own continuation, which posts
//! the outcome back onto the idle queue and wakes the loop.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};

use super::lock;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run { name: String, job: Job },
    Quit,
}

struct Worker {
    index: usize,
    thread: JoinHandle<()>,
    exited: Receiver<()>,
}

pub(crate) struct ThreadPool {
    sender: Mutex<Option<Sender<Message>>>,
    workers: Mutex<Vec<Worker>>,
    join_timeout: Duration,
}

impl ThreadPool {
    pub(crate) fn start(size: usize, join_timeout: Duration) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Message>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let (exited_tx, exited) = mpsc::channel();
            let thread = thread::Builder::new()
                .name(format!("Thread Pool Worker {index}"))
                .spawn(move || {
                    worker_loop(&receiver);
                    exited_tx.send(()).ok();
                })?;
            workers.push(Worker {
                index,
                thread,
                exited,
            });
        }

        tracing::debug!(threads = size, "thread pool started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            join_timeout,
        })
    }

    pub(crate) fn queue(&self, name: String, job: Job) -> Result<()> {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(Error::ShuttingDown);
        };
        sender
            .send(Message::Run { name, job })
            .map_err(|_| Error::ShuttingDown)
    }

    /// Ask every worker to quit and wait a bounded time for each
    ///
    /// Workers still stuck in a blocking call after the timeout are detached.
    pub(crate) fn shutdown(&self) {
        let Some(sender) = lock(&self.sender).take() else {
            return;
        };
        let workers: Vec<Worker> = lock(&self.workers).drain(..).collect();
        for _ in &workers {
            sender.send(Message::Quit).ok();
        }
        drop(sender);

        for worker in workers {
            match worker.exited.recv_timeout(self.join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.thread.join().is_err() {
                        tracing::warn!(worker = worker.index, "thread pool worker panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        worker = worker.index,
                        timeout_ms = self.join_timeout.as_millis() as u64,
                        "thread pool worker did not exit in time, detaching"
                    );
                }
            }
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Message>>) {
    loop {
        let message = lock(receiver).recv();
        match message {
            Ok(Message::Run { name, job }) => {
                tracing::trace!(job = %name, "thread pool job starting");
                job();
            }
            Ok(Message::Quit) | Err(_) => break,
        }
    }
}
