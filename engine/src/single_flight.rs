//! Coalescing trigger for background work.
//!
//! At most one run is in flight. Triggers that arrive while a run is in
//! flight collapse into a single trailing run, which starts no sooner than
//! `delay` after the previous run started. Every trigger resolves with the
//! result of the first run that started after it.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

type Operation = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Default)]
struct FlightState {
    running: bool,
    trailing: bool,
    started: u64,
    last_start: Option<Instant>,
}

#[derive(Debug, Clone)]
struct Completed {
    run: u64,
    result: Result<()>,
}

struct Inner {
    name: &'static str,
    op: Operation,
    delay: Duration,
    state: Mutex<FlightState>,
    done: watch::Sender<Completed>,
}

/// A single-flight guard around an async operation.
#[derive(Clone)]
pub struct SingleFlight {
    inner: Arc<Inner>,
}

impl SingleFlight {
    /// Wrap `op`. `name` is used in logs.
    pub fn new<F, Fut>(name: &'static str, delay: Duration, op: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (done, _) = watch::channel(Completed {
            run: 0,
            result: Ok(()),
        });
        Self {
            inner: Arc::new(Inner {
                name,
                op: Box::new(move || Box::pin(op())),
                delay,
                state: Mutex::new(FlightState::default()),
                done,
            }),
        }
    }

    /// Request a run.
    ///
    /// The run is scheduled immediately, even if the returned future is
    /// dropped. Must be called from within a tokio runtime.
    pub fn trigger(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut done = self.inner.done.subscribe();
        let (target, spawn) = {
            let mut state = self.inner.state.lock();
            let spawn = !state.running;
            if spawn {
                state.running = true;
            } else {
                state.trailing = true;
            }
            (state.started + 1, spawn)
        };

        if spawn {
            tokio::spawn(Arc::clone(&self.inner).drive());
        }

        async move {
            loop {
                {
                    let completed = done.borrow_and_update();
                    if completed.run >= target {
                        return completed.result.clone();
                    }
                }
                if done.changed().await.is_err() {
                    return Err(Error::Closed);
                }
            }
        }
    }

    /// Check if a run is in flight or scheduled.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Count of runs started so far.
    pub fn runs(&self) -> u64 {
        self.inner.state.lock().started
    }
}

impl Inner {
    async fn drive(self: Arc<Self>) {
        loop {
            let wait = {
                let state = self.state.lock();
                state
                    .last_start
                    .map(|at| (at + self.delay).saturating_duration_since(Instant::now()))
            };
            if let Some(wait) = wait.filter(|w| !w.is_zero()) {
                tokio::time::sleep(wait).await;
            }

            let run = {
                let mut state = self.state.lock();
                state.started += 1;
                state.trailing = false;
                state.last_start = Some(Instant::now());
                state.started
            };

            let result = AssertUnwindSafe(async { (self.op)().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!(task = self.name, run, "background run panicked");
                    Err(Error::transport(format!("{} panicked", self.name)))
                });
            if let Err(err) = &result {
                tracing::debug!(task = self.name, run, error = %err, "background run failed");
            }
            self.done.send_replace(Completed { run, result });

            let mut state = self.state.lock();
            if !state.trailing {
                state.running = false;
                return;
            }
        }
    }
}
