//! Single-shot promise/future pairs.
//!
//! Asynchronous results (provider registration, validation hand-off) travel
//! through these pairs. Each has a value channel and an error channel; the
//! notifier is invoked at most once, on the resolving producer's thread. The
//! consumer either blocks in [`Future::wait`] or attaches a notifier. A
//! promise dropped without a result fails the future so the consumer never
//! hangs.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{ServiceError, ServiceResult};

type Notifier<T> = Box<dyn FnOnce(ServiceResult<T>) + Send>;

enum State<T> {
    Pending(Option<Notifier<T>>),
    Resolved(ServiceResult<T>),
    Delivered,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Producer half; resolving or failing consumes it.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    completed: bool,
}

/// Consumer half; single-shot and single-consumer.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a connected promise/future pair.
pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(None)),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
            completed: false,
        },
        Future { shared },
    )
}

fn complete<T>(shared: &Shared<T>, result: ServiceResult<T>) {
    let mut guard = shared
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let State::Pending(notifier) = &mut *guard {
        if let Some(notifier) = notifier.take() {
            *guard = State::Delivered;
            drop(guard);
            notifier(result);
        } else {
            *guard = State::Resolved(result);
            drop(guard);
            shared.ready.notify_all();
        }
    }
}

impl<T> Promise<T> {
    /// Resolves the future with a value.
    pub fn resolve(mut self, value: T) {
        self.completed = true;
        complete(&self.shared, Ok(value));
    }

    /// Fails the future with an error.
    pub fn fail(mut self, error: ServiceError) {
        self.completed = true;
        complete(&self.shared, Err(error));
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.completed {
            complete(
                &self.shared,
                Err(ServiceError::internal("promise dropped without a result")),
            );
        }
    }
}

impl<T> Future<T> {
    /// Returns an already-resolved future.
    pub fn resolved(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Resolved(Ok(value))),
                ready: Condvar::new(),
            }),
        }
    }

    /// Returns an already-failed future.
    pub fn failed(error: ServiceError) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Resolved(Err(error))),
                ready: Condvar::new(),
            }),
        }
    }

    /// Blocks until the producer resolves or fails the pair.
    pub fn wait(self) -> ServiceResult<T> {
        let mut guard = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            match mem::replace(&mut *guard, State::Delivered) {
                State::Resolved(result) => return result,
                State::Delivered => {
                    return Err(ServiceError::logic("future consumed more than once"));
                }
                pending @ State::Pending(_) => {
                    *guard = pending;
                    guard = self
                        .shared
                        .ready
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Attaches the result notifier, consuming the future.
    ///
    /// A notifier attached after resolution is invoked immediately on the
    /// caller's thread.
    pub fn set_notifier(self, notifier: impl FnOnce(ServiceResult<T>) + Send + 'static) {
        let mut guard = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match mem::replace(&mut *guard, State::Delivered) {
            State::Resolved(result) => {
                drop(guard);
                notifier(result);
            }
            State::Pending(_) => {
                *guard = State::Pending(Some(Box::new(notifier)));
            }
            State::Delivered => {}
        }
    }
}
