//! Single-assignment completion slot
//!
//! A [`Resolver`] / [`Completion`] pair carries the outcome of one put or
//! get. The resolver side is consumed by `resolve`, so a task is resolved at
//! most once; dropping an unresolved resolver resolves the slot with
//! `Cancelled`, so it is also resolved at least once. The completion side can
//! be `.await`ed on any executor or waited on from a plain thread.

use mtds_types::{MtdsError, Result};
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

struct State<T> {
    result: Option<Result<T>>,
    done: bool,
    waker: Option<Waker>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn complete(&self, result: Result<T>) {
        let waker = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.result = Some(result);
            state.done = true;
            state.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Create a connected resolver/completion pair
pub fn completion<T>() -> (Resolver<T>, Completion<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            result: None,
            done: false,
            waker: None,
        }),
        ready: Condvar::new(),
    });
    (
        Resolver {
            shared: Some(shared.clone()),
        },
        Completion { shared },
    )
}

/// Producer side of a completion
pub struct Resolver<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Resolver<T> {
    pub fn resolve(mut self, result: Result<T>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(result);
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(MtdsError::cancelled(
                "task dropped before completion",
            )));
        }
    }
}

/// Consumer side of a completion
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completion<T> {
    /// A completion that is already resolved
    pub fn ready(result: Result<T>) -> Self {
        let (resolver, completion) = completion();
        resolver.resolve(result);
        completion
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    /// Block the current thread until the task resolves
    pub fn wait(self) -> Result<T> {
        let mut state = self.shared.state.lock();
        while !state.done {
            self.shared.ready.wait(&mut state);
        }
        take_result(&mut state)
    }

    /// Block for at most `timeout`; the task keeps running if this expires
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.done {
            if self.shared.ready.wait_until(&mut state, deadline).timed_out() && !state.done {
                return Err(MtdsError::timeout(format!(
                    "task not complete after {:?}",
                    timeout
                )));
            }
        }
        take_result(&mut state)
    }
}

fn take_result<T>(state: &mut State<T>) -> Result<T> {
    state
        .result
        .take()
        .unwrap_or_else(|| Err(MtdsError::internal("completion result already taken")))
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if state.done {
            Poll::Ready(take_result(&mut state))
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}
