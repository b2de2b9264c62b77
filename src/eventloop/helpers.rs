//! Small scheduling helpers built on [`LoopHandle`].

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;

use super::{CallHandle, LoopHandle, lock};

type SharedFn<S> = Arc<dyn Fn(&mut S, &LoopHandle<S>) -> Result<()> + Send + Sync + 'static>;

/// Runs a function at most once per scheduling, however often it is requested
///
/// Requests made while a call is already pending are folded into it.
pub struct DelayedFunctionCaller<S> {
    name: String,
    func: SharedFn<S>,
    pending: Arc<Mutex<Option<CallHandle>>>,
}

impl<S: 'static> DelayedFunctionCaller<S> {
    /// Wrap `func`; `name` is used for logging and timing
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut S, &LoopHandle<S>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Call after `delay` unless a call is already pending
    pub fn call_after_timeout(&self, handle: &LoopHandle<S>, delay: Duration) {
        let mut pending = lock(&self.pending);
        if pending.is_none() {
            *pending = Some(handle.add_timeout(delay, &self.name, self.scheduled_call()));
        }
    }

    /// Call from the idle queue unless a call is already pending
    pub fn call_when_idle(&self, handle: &LoopHandle<S>) {
        let mut pending = lock(&self.pending);
        if pending.is_none() {
            *pending = Some(handle.add_idle(&self.name, self.scheduled_call()));
        }
    }

    /// Call right away, dropping any pending call
    pub fn call_now(&self, state: &mut S, handle: &LoopHandle<S>) -> Result<()> {
        self.cancel_call();
        (self.func)(state, handle)
    }

    /// Drop the pending call, if any
    pub fn cancel_call(&self) {
        if let Some(call) = lock(&self.pending).take() {
            call.cancel();
        }
    }

    /// Whether a call is scheduled
    pub fn is_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }

    fn scheduled_call(&self) -> impl FnOnce(&mut S, &LoopHandle<S>) -> Result<()> + Send + 'static {
        let func = Arc::clone(&self.func);
        let pending = Arc::clone(&self.pending);
        move |state, handle| {
            lock(&pending).take();
            func(state, handle)
        }
    }
}

/// Run `step` once per loop iteration until it returns `Break`
///
/// Each further step is queued with [`LoopHandle::run_idle_next_loop`], so a long
/// job never starves sockets and timers. An error ends the iteration.
pub fn idle_iterate<S, F>(handle: &LoopHandle<S>, name: impl Into<String>, step: F)
where
    S: 'static,
    F: FnMut(&mut S, &LoopHandle<S>) -> Result<ControlFlow<()>> + Send + 'static,
{
    let name = name.into();
    handle.add_idle(name.clone(), move |state, handle| {
        idle_iterate_step(state, handle, name, step)
    });
}

fn idle_iterate_step<S, F>(state: &mut S, handle: &LoopHandle<S>, name: String, mut step: F) -> Result<()>
where
    S: 'static,
    F: FnMut(&mut S, &LoopHandle<S>) -> Result<ControlFlow<()>> + Send + 'static,
{
    if step(state, handle)?.is_continue() {
        let next_name = name.clone();
        handle.run_idle_next_loop(next_name, move |state, handle| {
            idle_iterate_step(state, handle, name, step)
        });
    }
    Ok(())
}
