// MIT License - Copyright (c) 2026 Peter Wright

//! Top-level task group: starts every component as a sibling task,
//! restarts the connection-owning ones when they fall over, and turns a
//! panic anywhere into a non-zero process exit for the orchestrator to
//! handle.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::transport::Backoff;

/// Clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Invalid configuration (set by `main`, not here).
pub const EXIT_CONFIG: i32 = 1;
/// Unrecoverable internal error: a task panicked or died unexpectedly.
pub const EXIT_INTERNAL: i32 = 2;

/// How long tasks get to honor cancellation before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(60);
const RESTART_BACKOFF_RESET_UPTIME: Duration = Duration::from_secs(30);

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type TaskFactory = Box<dyn Fn(CancellationToken) -> TaskFuture + Send>;

pub struct Supervisor {
    cancel: CancellationToken,
    set: JoinSet<&'static str>,
    names: HashMap<tokio::task::Id, &'static str>,
    started: HashMap<tokio::task::Id, Instant>,
    factories: HashMap<&'static str, TaskFactory>,
    backoffs: HashMap<&'static str, Backoff>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            set: JoinSet::new(),
            names: HashMap::new(),
            started: HashMap::new(),
            factories: HashMap::new(),
            backoffs: HashMap::new(),
        }
    }

    /// The token every component should watch for shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A task expected to live for the whole process. If it returns while
    /// the group is not shutting down, that is a bug and the process exits.
    pub fn spawn_once<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_named(name, Box::pin(fut), Duration::ZERO);
    }

    /// A connection-owning task (panel link, MQTT transport). If it exits
    /// without being cancelled it is restarted with backoff rather than
    /// taking the process down.
    pub fn spawn_restartable<F>(&mut self, name: &'static str, factory: F)
    where
        F: Fn(CancellationToken) -> TaskFuture + Send + 'static,
    {
        let fut = factory(self.cancel.clone());
        self.factories.insert(name, Box::new(factory));
        self.spawn_named(name, fut, Duration::ZERO);
    }

    fn spawn_named(&mut self, name: &'static str, fut: TaskFuture, delay: Duration) {
        let cancel = self.cancel.clone();
        let handle = self.set.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return name,
                    _ = sleep(delay) => {}
                }
            }
            fut.await;
            name
        });
        self.names.insert(handle.id(), name);
        self.started.insert(handle.id(), Instant::now());
    }

    /// Run until a shutdown signal arrives or a task fails fatally.
    /// Returns the process exit code.
    pub async fn run(mut self) -> i32 {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                None
            }
        };

        enum Wake {
            Signal(&'static str),
            Joined(Option<Result<(tokio::task::Id, &'static str), tokio::task::JoinError>>),
        }

        let exit_code = loop {
            // Handlers only classify the wake-up; acting on it happens
            // below, once the join-future's borrow of the set is gone.
            let wake = tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        warn!("SIGINT handler failed: {e}");
                    }
                    Wake::Signal("SIGINT")
                }
                _ = recv_sigterm(&mut sigterm) => Wake::Signal("SIGTERM"),
                joined = self.set.join_next_with_id() => Wake::Joined(joined),
            };

            match wake {
                Wake::Signal(name) => {
                    info!("{name} received, shutting down");
                    break EXIT_OK;
                }
                Wake::Joined(None) => break EXIT_OK,
                Wake::Joined(Some(Ok((id, name)))) => {
                    if self.cancel.is_cancelled() {
                        continue;
                    }
                    if self.factories.contains_key(name) {
                        self.restart(id, name);
                    } else {
                        error!("task '{name}' exited unexpectedly, shutting down");
                        break EXIT_INTERNAL;
                    }
                }
                Wake::Joined(Some(Err(join_err))) => {
                    if join_err.is_cancelled() {
                        continue;
                    }
                    let name = self.names.get(&join_err.id()).copied().unwrap_or("unknown");
                    error!("task '{name}' panicked, shutting down: {join_err}");
                    break EXIT_INTERNAL;
                }
            }
        };

        self.shutdown().await;
        exit_code
    }

    fn restart(&mut self, id: tokio::task::Id, name: &'static str) {
        let uptime = self
            .started
            .remove(&id)
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        self.names.remove(&id);

        let backoff = self
            .backoffs
            .entry(name)
            .or_insert_with(|| Backoff::new(RESTART_BACKOFF_BASE, RESTART_BACKOFF_CAP));
        if uptime >= RESTART_BACKOFF_RESET_UPTIME {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        warn!("task '{name}' exited, restarting in {:.1}s", delay.as_secs_f64());

        let Some(factory) = self.factories.get(name) else {
            return;
        };
        let fut = factory(self.cancel.clone());
        self.spawn_named(name, fut, delay);
    }

    /// Cancel the group and give every child a bounded window to return.
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("tasks did not stop within the grace period, aborting");
                self.set.abort_all();
                break;
            }
            match timeout(remaining, self.set.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!("tasks did not stop within the grace period, aborting");
                    self.set.abort_all();
                    break;
                }
            }
        }
        while self.set.join_next().await.is_some() {}
    }
}

async fn recv_sigterm(stream: &mut Option<tokio::signal::unix::Signal>) {
    match stream {
        Some(stream) => {
            stream.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn cancelled_group_exits_cleanly() {
        let mut sup = Supervisor::new();
        let cancel = sup.cancel_token();

        let worker_cancel = cancel.clone();
        sup.spawn_once("worker", async move {
            worker_cancel.cancelled().await;
        });
        sup.spawn_once("canceller", async move {
            sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        assert_eq!(sup.run().await, EXIT_OK);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_exit_of_permanent_task_is_fatal() {
        let mut sup = Supervisor::new();
        sup.spawn_once("worker", async {});
        assert_eq!(sup.run().await, EXIT_INTERNAL);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_is_fatal() {
        let mut sup = Supervisor::new();
        let cancel = sup.cancel_token();
        sup.spawn_once("steady", async move {
            cancel.cancelled().await;
        });
        sup.spawn_once("buggy", async {
            panic!("boom");
        });
        assert_eq!(sup.run().await, EXIT_INTERNAL);
    }

    #[tokio::test(start_paused = true)]
    async fn restartable_task_restarts_until_cancelled() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut sup = Supervisor::new();
        let cancel = sup.cancel_token();

        let counter = runs.clone();
        sup.spawn_restartable("flappy", move |task_cancel| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    task_cancel.cancelled().await;
                }
            })
        });

        let watcher_runs = runs.clone();
        sup.spawn_once("watcher", async move {
            while watcher_runs.load(Ordering::SeqCst) < 3 {
                sleep(Duration::from_millis(100)).await;
            }
            cancel.cancel();
        });

        assert_eq!(sup.run().await, EXIT_OK);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
