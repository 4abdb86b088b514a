//! The scheduler hook: "run this callback on a later turn".
//!
//! Every deferred action of an iterator (readable signals, buffer fills,
//! push-mode draining, property callbacks) goes through the scheduler that is
//! current on the calling thread. Tasks queued on one scheduler run in FIFO
//! order.
//!
//! The default [`LocalPoolScheduler`] queues work on a thread-local
//! [`LocalPool`], which runs whenever [`run_until_stalled`] or [`block_on`] is
//! called. Applications that already run inside a [`tokio::task::LocalSet`]
//! can install [`TokioScheduler`] instead.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::executor::{LocalPool, LocalSpawner};
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + 'static>;

/// Runs callbacks and futures on later turns of a cooperative event loop.
pub trait Scheduler {
    /// Queue a callback; callbacks queued on the same scheduler run in FIFO order.
    fn schedule(&self, task: Task);

    /// Run a future to completion on the same loop.
    fn spawn(&self, future: LocalBoxFuture<'static, ()>);
}

/// Scheduler backed by a thread-local [`LocalPool`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPoolScheduler;

impl Scheduler for LocalPoolScheduler {
    fn schedule(&self, task: Task) {
        self.spawn(Box::pin(async move { task() }));
    }

    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        POOL.with(|event_loop| {
            if let Err(e) = event_loop.spawner.spawn_local(future) {
                tracing::warn!(error = %e, "local pool is shutting down, task dropped");
            }
        });
    }
}

/// Scheduler backed by [`tokio::task::spawn_local`].
///
/// Must only be used from within a [`tokio::task::LocalSet`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) {
        tokio::task::spawn_local(async move { task() });
    }

    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        tokio::task::spawn_local(future);
    }
}

/// The thread-local pool together with a spawner created alongside it, so
/// spawning never needs to borrow the pool while it is running.
struct EventLoop {
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
}

impl EventLoop {
    fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            pool: RefCell::new(pool),
            spawner,
        }
    }
}

thread_local! {
    static POOL: EventLoop = EventLoop::new();
    static CURRENT: RefCell<Rc<dyn Scheduler>> = RefCell::new(Rc::new(LocalPoolScheduler));
}

/// The scheduler in use on this thread.
pub fn current() -> Rc<dyn Scheduler> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Replace the scheduler of this thread, returning the previous one.
pub fn set_scheduler<S: Scheduler + 'static>(scheduler: S) -> Rc<dyn Scheduler> {
    CURRENT.with(|current| std::mem::replace(&mut *current.borrow_mut(), Rc::new(scheduler)))
}

/// Run `task` on a later turn of the current scheduler.
pub fn schedule_task<F: FnOnce() + 'static>(task: F) {
    current().schedule(Box::new(task));
}

/// Run `future` on the current scheduler.
pub fn spawn_local<F: Future<Output = ()> + 'static>(future: F) {
    current().spawn(Box::pin(future));
}

/// Run all queued work on the thread-local pool until nothing can progress.
///
/// Returns `false` without doing anything when called from inside a task that
/// the pool is already running.
pub fn run_until_stalled() -> bool {
    POOL.with(|event_loop| match event_loop.pool.try_borrow_mut() {
        Ok(mut pool) => {
            pool.run_until_stalled();
            true
        }
        Err(_) => {
            tracing::debug!("run_until_stalled called re-entrantly, ignoring");
            false
        }
    })
}

/// Drive the thread-local pool until `future` completes.
///
/// # Panics
///
/// Panics when called from inside a task that the pool is already running.
pub fn block_on<F: Future>(future: F) -> F::Output {
    POOL.with(|event_loop| event_loop.pool.borrow_mut().run_until(future))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            schedule_task(move || log.borrow_mut().push(i));
        }
        assert!(log.borrow().is_empty());

        run_until_stalled();
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_nested_tasks_run_after_queued_ones() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = log.clone();
        schedule_task(move || {
            inner.borrow_mut().push("outer");
            let nested = inner.clone();
            schedule_task(move || nested.borrow_mut().push("nested"));
        });
        let second = log.clone();
        schedule_task(move || second.borrow_mut().push("second"));

        run_until_stalled();
        assert_eq!(*log.borrow(), vec!["outer", "second", "nested"]);
    }

    #[test]
    fn test_block_on_drives_spawned_futures() {
        let (tx, rx) = futures::channel::oneshot::channel();
        spawn_local(async move {
            let _ = tx.send(42);
        });
        assert_eq!(block_on(rx), Ok(42));
    }

    #[test]
    fn test_reentrant_run_is_ignored() {
        let nested = Rc::new(RefCell::new(None));
        let slot = nested.clone();
        schedule_task(move || *slot.borrow_mut() = Some(run_until_stalled()));
        assert!(run_until_stalled());
        assert_eq!(*nested.borrow(), Some(false));
    }
}
