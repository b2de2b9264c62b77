//! Single-threaded cooperative event loop.
//!
//! One thread owns the loop state `S` and runs every timer, socket, idle and
//! urgent callback against it. Other threads only enqueue work through a
//! [`LoopHandle`] and wake the loop; blocking calls go to a small worker pool via
//! [`LoopHandle::call_in_thread`] and report back through the idle queue.
//!
//! Order of work within one iteration:
//! 1. the urgent queue is drained
//! 2. ready write callbacks, then read callbacks
//! 3. expired timers, earliest first
//! 4. the idle queue, until empty
//!
//! The urgent queue is drained again after every single event, so urgent work
//! never waits behind more than the event already in progress.

mod call_queue;
mod delayed_call;
mod helpers;
mod poller;
mod scheduler;
mod thread_pool;
mod waker;

#[cfg(test)]
mod tests;

pub use delayed_call::CallHandle;
pub use helpers::{DelayedFunctionCaller, idle_iterate};

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::EventLoopConfig;
use crate::error::{Error, Result};

use call_queue::CallQueue;
use delayed_call::{DelayedCall, SlowCallTracker, panic_message, run_guarded};
use scheduler::Scheduler;
use thread_pool::ThreadPool;
use waker::Waker;

/// A one-shot callback run on the loop thread
pub type Callback<S> = Box<dyn FnOnce(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static>;

/// A socket callback, run every time its socket is ready
pub type IoCallback<S> = Box<dyn FnMut(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static>;

/// Lifecycle signals published by the loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopEvent {
    /// The loop thread is about to be spawned
    ThreadWillStart,
    /// First thing on the new loop thread
    ThreadStarted,
    /// The spawning thread has the loop thread running
    ThreadDidStart,
    /// An iteration is beginning
    BeginLoop,
    /// An iteration ended
    EndLoop,
    /// One event (callback) was dispatched
    EventFinished {
        /// Whether the callback completed without error or panic
        success: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

struct IoSlot<S> {
    token: u64,
    name: String,
    callback: Option<IoCallback<S>>,
}

struct IoRegistry<S> {
    read: HashMap<RawFd, IoSlot<S>>,
    write: HashMap<RawFd, IoSlot<S>>,
    removed_read: HashSet<RawFd>,
    removed_write: HashSet<RawFd>,
    next_token: u64,
}

impl<S> IoRegistry<S> {
    fn new() -> Self {
        Self {
            read: HashMap::new(),
            write: HashMap::new(),
            removed_read: HashSet::new(),
            removed_write: HashSet::new(),
            next_token: 0,
        }
    }

    fn split(&mut self, direction: Direction) -> (&mut HashMap<RawFd, IoSlot<S>>, &mut HashSet<RawFd>) {
        match direction {
            Direction::Read => (&mut self.read, &mut self.removed_read),
            Direction::Write => (&mut self.write, &mut self.removed_write),
        }
    }

    fn clear_removed(&mut self) {
        self.removed_read.clear();
        self.removed_write.clear();
    }
}

struct Shared<S> {
    scheduler: Mutex<Scheduler<S>>,
    idle: CallQueue<S>,
    urgent: CallQueue<S>,
    idles_next_loop: Mutex<Vec<(String, Callback<S>)>>,
    io: Mutex<IoRegistry<S>>,
    waker: Waker,
    quit: AtomicBool,
    pool: ThreadPool,
    events: broadcast::Sender<LoopEvent>,
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Callbacks run under catch_unwind; a panic while holding one of these locks
    // leaves the data consistent, so poisoning is ignored.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe handle for scheduling work on an [`EventLoop`]
pub struct LoopHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: 'static> LoopHandle<S> {
    /// Run `f` on the loop thread once `delay` has elapsed
    pub fn add_timeout<F>(&self, delay: Duration, name: impl AsRef<str>, f: F) -> CallHandle
    where
        F: FnOnce(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static,
    {
        let (call, handle) = DelayedCall::new(format!("timeout ({})", name.as_ref()), Box::new(f));
        lock(&self.shared.scheduler).add_timeout_at(Instant::now() + delay, call);
        self.wakeup();
        handle
    }

    /// Run `f` on the loop thread after pending I/O and timers
    pub fn add_idle<F>(&self, name: impl AsRef<str>, f: F) -> CallHandle
    where
        F: FnOnce(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static,
    {
        let (call, handle) = DelayedCall::new(format!("idle ({})", name.as_ref()), Box::new(f));
        self.shared.idle.push(call);
        self.wakeup();
        handle
    }

    /// Run `f` on the loop thread before any other pending work
    pub fn add_urgent_call<F>(&self, name: impl AsRef<str>, f: F) -> CallHandle
    where
        F: FnOnce(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static,
    {
        let (call, handle) = DelayedCall::new(format!("urgent ({})", name.as_ref()), Box::new(f));
        self.shared.urgent.push(call);
        self.wakeup();
        handle
    }

    /// Queue `f` as an idle call at the start of the next iteration
    ///
    /// Unlike [`add_idle`](Self::add_idle) from inside an idle callback, this lets
    /// the loop wait on sockets and timers before `f` runs.
    pub fn run_idle_next_loop<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static,
    {
        lock(&self.shared.idles_next_loop).push((name.into(), Box::new(f)));
    }

    /// Run `work` on the thread pool and post its outcome back as an idle call
    ///
    /// Exactly one of `on_success` / `on_error` runs, on the loop thread. A panic in
    /// `work` is reported to `on_error` as [`Error::Callback`].
    pub fn call_in_thread<T, W, OnOk, OnErr>(
        &self,
        name: impl Into<String>,
        work: W,
        on_success: OnOk,
        on_error: OnErr,
    ) -> Result<()>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        OnOk: FnOnce(&mut S, &LoopHandle<S>, T) -> Result<()> + Send + 'static,
        OnErr: FnOnce(&mut S, &LoopHandle<S>, Error) -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let handle = self.clone();
        let job_name = name.clone();
        let job = Box::new(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work));
            let outcome = match outcome {
                Ok(result) => result,
                Err(payload) => Err(Error::Callback(panic_message(payload.as_ref()))),
            };
            match outcome {
                Ok(value) => {
                    handle.add_idle(format!("Thread pool success callback ({job_name})"), move |state, h| {
                        on_success(state, h, value)
                    });
                }
                Err(e) => {
                    handle.add_idle(format!("Thread pool errback ({job_name})"), move |state, h| {
                        on_error(state, h, e)
                    });
                }
            }
        });
        self.shared.pool.queue(name, job)
    }

    /// Call `f` whenever `fd` is readable, replacing any previous read callback
    pub fn add_read_callback<F>(&self, fd: RawFd, name: impl Into<String>, f: F)
    where
        F: FnMut(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static,
    {
        self.add_io_callback(Direction::Read, fd, name.into(), Box::new(f));
    }

    /// Call `f` whenever `fd` is writable, replacing any previous write callback
    pub fn add_write_callback<F>(&self, fd: RawFd, name: impl Into<String>, f: F)
    where
        F: FnMut(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static,
    {
        self.add_io_callback(Direction::Write, fd, name.into(), Box::new(f));
    }

    /// Remove the read callback of `fd`
    ///
    /// Fails with [`Error::CallbackNotRegistered`] when there is none.
    pub fn remove_read_callback(&self, fd: RawFd) -> Result<()> {
        self.remove_io_callback(Direction::Read, fd)
    }

    /// Remove the write callback of `fd`
    ///
    /// Fails with [`Error::CallbackNotRegistered`] when there is none.
    pub fn remove_write_callback(&self, fd: RawFd) -> Result<()> {
        self.remove_io_callback(Direction::Write, fd)
    }

    /// Remove both callbacks of `fd`, if any
    pub fn stop_handling_socket(&self, fd: RawFd) {
        self.remove_read_callback(fd).ok();
        self.remove_write_callback(fd).ok();
    }

    fn add_io_callback(&self, direction: Direction, fd: RawFd, name: String, callback: IoCallback<S>) {
        let previous = {
            let mut io = lock(&self.shared.io);
            let token = io.next_token;
            io.next_token += 1;
            let (callbacks, _) = io.split(direction);
            callbacks.insert(
                fd,
                IoSlot {
                    token,
                    name: format!("{} ({name})", direction.as_str()),
                    callback: Some(callback),
                },
            )
        };
        drop(previous);
        self.wakeup();
    }

    fn remove_io_callback(&self, direction: Direction, fd: RawFd) -> Result<()> {
        let removed = {
            let mut io = lock(&self.shared.io);
            let (callbacks, removed) = io.split(direction);
            let slot = callbacks.remove(&fd).ok_or(Error::CallbackNotRegistered {
                fd,
                direction: direction.as_str(),
            })?;
            removed.insert(fd);
            slot
        };
        drop(removed);
        self.wakeup();
        Ok(())
    }

    /// Interrupt the readiness wait so new work is noticed
    pub fn wakeup(&self) {
        self.shared.waker.wake();
    }

    /// Stop the loop after the event in progress
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.wakeup();
    }

    /// Whether [`quit`](Self::quit) was called
    pub fn is_quitting(&self) -> bool {
        self.shared.quit.load(Ordering::SeqCst)
    }

    /// Subscribe to [`LoopEvent`]s
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: LoopEvent) {
        self.shared.events.send(event).ok();
    }

    fn move_idles_for_next_loop(&self) {
        let pending = std::mem::take(&mut *lock(&self.shared.idles_next_loop));
        for (name, callback) in pending {
            let (call, _) = DelayedCall::new(format!("idle ({name})"), callback);
            self.shared.idle.push(call);
        }
    }
}

/// The loop itself; owned by the thread that runs it
pub struct EventLoop<S> {
    handle: LoopHandle<S>,
    tracker: SlowCallTracker,
}

impl<S: 'static> EventLoop<S> {
    /// Create a loop and start its worker pool
    pub fn new(config: &EventLoopConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(1000);
        let shared = Shared {
            scheduler: Mutex::new(Scheduler::new()),
            idle: CallQueue::new(
                "idle",
                config.queue_size_warning,
                config.queue_size_warning_limit,
            ),
            urgent: CallQueue::new(
                "urgent",
                config.queue_size_warning,
                config.queue_size_warning_limit,
            ),
            idles_next_loop: Mutex::new(Vec::new()),
            io: Mutex::new(IoRegistry::new()),
            waker: Waker::new()?,
            quit: AtomicBool::new(false),
            pool: ThreadPool::start(config.thread_pool_size, config.thread_join_timeout)?,
            events,
        };
        Ok(Self {
            handle: LoopHandle {
                shared: Arc::new(shared),
            },
            tracker: SlowCallTracker::new(
                config.slow_call_threshold,
                config.cumulative_slow_threshold,
            ),
        })
    }

    /// A handle for scheduling work on this loop
    pub fn handle(&self) -> LoopHandle<S> {
        self.handle.clone()
    }

    /// Run iterations until [`LoopHandle::quit`] is called
    ///
    /// Only fails when the readiness wait itself fails.
    pub fn run(&mut self, state: &mut S) -> Result<()> {
        while !self.handle.is_quitting() {
            self.run_once(state, None)?;
        }
        tracing::debug!("event loop stopped");
        Ok(())
    }

    /// Run one iteration, waiting at most `max_wait` for something to happen
    pub fn run_once(&mut self, state: &mut S, max_wait: Option<Duration>) -> Result<()> {
        let handle = self.handle.clone();
        let shared = &handle.shared;

        handle.emit(LoopEvent::BeginLoop);
        handle.move_idles_for_next_loop();

        let (read_fds, write_fds) = {
            let mut io = lock(&shared.io);
            io.clear_removed();
            (
                io.read.keys().copied().collect::<Vec<_>>(),
                io.write.keys().copied().collect::<Vec<_>>(),
            )
        };

        let mut timeout = lock(&shared.scheduler).next_timeout(Instant::now());
        if shared.idle.has_pending() || shared.urgent.has_pending() {
            timeout = Some(Duration::ZERO);
        }
        if let Some(max_wait) = max_wait {
            timeout = Some(timeout.map_or(max_wait, |t| t.min(max_wait)));
        }

        let ready = match poller::poll(shared.waker.fd(), &read_fds, &write_fds, timeout) {
            Ok(ready) => ready,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                tracing::warn!(error = %e, "eventloop: readiness wait interrupted");
                poller::Ready::default()
            }
            Err(e) => return Err(e.into()),
        };
        if ready.woken {
            shared.waker.drain();
        }
        if handle.is_quitting() {
            return Ok(());
        }

        self.process_urgent_calls(state, &handle);
        if handle.is_quitting() {
            return Ok(());
        }

        'events: {
            for fd in ready.writable {
                if let Some(success) = self.handle_socket_event(state, &handle, fd, Direction::Write)
                    && !self.finish_event(state, &handle, success)
                {
                    break 'events;
                }
            }
            for fd in ready.readable {
                if let Some(success) = self.handle_socket_event(state, &handle, fd, Direction::Read)
                    && !self.finish_event(state, &handle, success)
                {
                    break 'events;
                }
            }
            loop {
                let call = lock(&shared.scheduler).pop_ready(Instant::now());
                let Some(call) = call else { break };
                let success = call.dispatch(state, &handle, &mut self.tracker);
                if !self.finish_event(state, &handle, success) {
                    break 'events;
                }
            }
            while let Some(call) = shared.idle.pop() {
                let success = call.dispatch(state, &handle, &mut self.tracker);
                if !self.finish_event(state, &handle, success) {
                    break 'events;
                }
            }
        }

        handle.emit(LoopEvent::EndLoop);
        Ok(())
    }

    /// Drain the urgent queue, then the idle queue, without waiting on anything
    pub fn process_idles(&mut self, state: &mut S) {
        let handle = self.handle.clone();
        handle.move_idles_for_next_loop();
        self.process_urgent_calls(state, &handle);
        while !handle.is_quitting() {
            let Some(call) = handle.shared.idle.pop() else {
                break;
            };
            let success = call.dispatch(state, &handle, &mut self.tracker);
            if !self.finish_event(state, &handle, success) {
                break;
            }
        }
    }

    /// Move the loop (and `state`) onto a dedicated "Event Loop" thread
    ///
    /// The thread runs until [`LoopHandle::quit`], shuts the worker pool down and
    /// hands `state` back through the join handle.
    pub fn spawn(mut self, mut state: S) -> Result<JoinHandle<S>>
    where
        S: Send,
    {
        let handle = self.handle.clone();
        handle.emit(LoopEvent::ThreadWillStart);
        let thread = std::thread::Builder::new()
            .name("Event Loop".to_string())
            .spawn(move || {
                self.handle.emit(LoopEvent::ThreadStarted);
                if let Err(e) = self.run(&mut state) {
                    tracing::error!(error = %e, "event loop failed");
                }
                self.shutdown();
                state
            })?;
        handle.emit(LoopEvent::ThreadDidStart);
        Ok(thread)
    }

    /// Stop the worker pool; further [`LoopHandle::call_in_thread`] calls fail
    pub fn shutdown(&mut self) {
        self.handle.shared.pool.shutdown();
    }

    fn process_urgent_calls(&mut self, state: &mut S, handle: &LoopHandle<S>) {
        while !handle.is_quitting() {
            let Some(call) = handle.shared.urgent.pop() else {
                break;
            };
            let success = call.dispatch(state, handle, &mut self.tracker);
            handle.emit(LoopEvent::EventFinished { success });
        }
    }

    /// Signal completion of one event, then drain urgent work; `false` means stop
    fn finish_event(&mut self, state: &mut S, handle: &LoopHandle<S>, success: bool) -> bool {
        handle.emit(LoopEvent::EventFinished { success });
        if handle.is_quitting() {
            return false;
        }
        self.process_urgent_calls(state, handle);
        !handle.is_quitting()
    }

    fn handle_socket_event(
        &mut self,
        state: &mut S,
        handle: &LoopHandle<S>,
        fd: RawFd,
        direction: Direction,
    ) -> Option<bool> {
        let (token, name, mut callback) = {
            let mut io = lock(&handle.shared.io);
            let (callbacks, removed) = io.split(direction);
            if removed.contains(&fd) {
                return None;
            }
            let slot = callbacks.get_mut(&fd)?;
            (slot.token, slot.name.clone(), slot.callback.take()?)
        };

        let success = run_guarded(&name, &mut self.tracker, || callback(state, handle));

        let mut io = lock(&handle.shared.io);
        let (callbacks, _) = io.split(direction);
        // A callback replaced or removed while running is left as the caller set it
        if callbacks.get(&fd).is_some_and(|slot| slot.token == token) {
            if success {
                if let Some(slot) = callbacks.get_mut(&fd) {
                    slot.callback = Some(callback);
                }
            } else {
                tracing::warn!(fd, callback = %name, "removing failed {} callback", direction.as_str());
                let failed = callbacks.remove(&fd);
                drop(io);
                drop(failed);
            }
        }
        Some(success)
    }
}

impl<S> Drop for EventLoop<S> {
    fn drop(&mut self) {
        self.handle.shared.pool.shutdown();
    }
}
