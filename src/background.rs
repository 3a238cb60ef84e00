// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of vellum.
//
// vellum is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// vellum is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with vellum.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Background Task Processing
//!
//! Interestingly, [axum] makes no provision for compute outside the context of handling HTTP
//! requests, and there still doesn't appear to be a "go to" Rust task-queue implementation. This
//! module provides vellum's: a *bounded, in-process* queue drained by a single processor task.
//!
//! One could of course just use [tokio::spawn] at each call site, but that gives you an unbounded
//! number of unsupervised tasks with no lifecycle: nothing caps them under load & nothing waits
//! for (or deliberately abandons) them at shutdown. At the other end of the spectrum sits a
//! durable, datastore-backed queue with leases & retries; vellum's only background work is the
//! counter-reconciliation task, which is idempotent & re-queued on every toggle, so losing one at
//! process exit costs nothing. A bounded channel plus a supervised drain loop is the right amount
//! of machinery: senders never block the request path (a full queue drops the task, which the
//! caller logs), and shutdown either drains in-flight work or times out trying.

use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use pin_project::pin_project;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::{
    sync::{mpsc, Notify},
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::error;

use crate::{
    counter_add, gauge_setu,
    metrics::{self, Instruments, Sort},
    storage::Backend as StorageBackend,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Background {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Task processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("The background task queue is full"))]
    QueueFull { backtrace: Backtrace },
    #[snafu(display("Timeout shutting-down the task processor: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to wait for in-flight tasks: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Background {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tasks                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Context handed to every task on execution.
#[derive(Clone)]
pub struct Context {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
}

/// Trait defining a "task" for our purposes.
///
/// Intentionally as general as possible: anything [Send] that can convert itself into an async
/// computation yielding `Result<()>`. Note that `exec()` consumes the task.
// This trait *must* be object-safe so that the processor can handle tasks generically.
#[async_trait]
pub trait Task: Send {
    /// Consume this task by converting it into a `Future` yielding a `Result<()>`.
    async fn exec(self: Box<Self>, context: Context) -> Result<()>;
    /// Per-task timeout; None means "use the processor default".
    fn timeout(&self) -> Option<Duration>;
}

/// The send side of the queue; cheap to clone & held in the application state.
///
/// `send` never waits: if the queue is full the task is dropped & the caller told so. That's the
/// contract that keeps background work off the request path.
#[derive(Clone)]
pub struct Queue {
    tx: mpsc::Sender<Box<dyn Task>>,
}

impl Queue {
    pub fn send(&self, task: impl Task + 'static) -> Result<()> {
        self.tx
            .try_send(Box::new(task))
            .map_err(|_| QueueFullSnafu.build())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the processor                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Configuration parameters for processing background tasks
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Timeout that will be used for any task that doesn't define its own
    #[serde(rename = "default-timeout")]
    pub default_timeout: Duration,
    /// The maximum number of tasks to drive concurrently
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// Capacity of the queue; sends beyond this are dropped
    #[serde(rename = "queue-capacity")]
    pub queue_capacity: usize,
    /// Maximum amount of time to drive in-flight tasks without attempting to pick-up new tasks
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
    /// Amount of time to wait for in-flight tasks on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_concurrent_tasks: 16,
            queue_capacity: 256,
            pickup_timeout: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_millis(500),
        }
    }
}

/// [Processor] is the type managing the ongoing processing of background tasks. It has a single
/// method, `shutdown()`, which will consume the instance & resolve to the result of processing.
// `Processor` need not be cheaply clonable; it will likely be held in one place & then consumed
// to signal that processing should wind down.
#[pin_project]
pub struct Processor {
    // This               👇 must match the return type of `process()`
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Consume the instance & return the result of processing background tasks
    ///
    /// Signals the processing task to shut down & waits up to `timeout` for it to exit.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into its parts
    ///
    /// Convenient when waiting on the processor along with other futures (in a `tokio::select!`
    /// invocation, e.g.)
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

inventory::submit! { metrics::Registration::new("background.processor.tasks.completed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("background.processor.tasks.inflight", Sort::IntegralGauge) }

/// Drain the queue. `rx` is the receive side of the task channel, `config` holds the algorithm's
/// parameters & `shutdown` is a [Notify] the caller can use to signal this function to exit.
async fn process(
    mut rx: mpsc::Receiver<Box<dyn Task>>,
    context: Context,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    // The basic outline: maintain a `JoinSet` of currently running tasks...
    let mut futures = JoinSet::new();
    // ...inside an infinite loop; so long as...
    let mut done = false;
    // `done` is not true, loop:
    while !done {
        // So long as we don't have too much on our plate, grab whatever's waiting:
        while futures.len() < config.max_concurrent_tasks {
            match rx.try_recv() {
                Ok(task) => {
                    futures.spawn(tokio::time::timeout(
                        task.timeout().unwrap_or(config.default_timeout),
                        task.exec(context.clone()),
                    ));
                }
                Err(_) => break,
            }
        }

        gauge_setu!(
            instruments,
            "background.processor.tasks.inflight",
            futures.len() as u64,
            &[]
        );

        if !futures.is_empty() {
            // We've got at least one task; drive 'em all forward, while waiting on our shutdown
            // notification:
            tokio::select! {
                result = futures.join_next() => {
                    match result {
                        Some(Ok(outcome)) => {
                            // A task failing (or timing-out) is its own problem, not the
                            // processor's; log & move on.
                            match outcome {
                                Ok(Err(err)) => error!("background task failed: {}", err),
                                Err(_) => error!("background task timed-out"),
                                _ => (),
                            }
                            counter_add!(instruments, "background.processor.tasks.completed", 1, &[]);
                        },
                        Some(Err(err)) => {
                            return Err(JoinSnafu.into_error(err));
                        },
                        None => unimplemented!(), // Precluded by `.is_empty()`, above.
                    }
                },
                // If `futures` holds a single long-running task, we can get "stuck" in this
                // `select!` driving it forward while new tasks pile up in the queue. Stopping
                // periodically lets us pick them up.
                _ = tokio::time::sleep(config.pickup_timeout) => (),
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        } else {
            // We have no tasks; wait for one to arrive, while remaining mindful of our shutdown
            // notification:
            tokio::select! {
                task = rx.recv() => match task {
                    Some(task) => {
                        futures.spawn(tokio::time::timeout(
                            task.timeout().unwrap_or(config.default_timeout),
                            task.exec(context.clone()),
                        ));
                    },
                    // All senders dropped; nothing more will ever arrive.
                    None => done = true,
                },
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        }
    } // End processing loop.

    // Give any in-flight tasks a chance to complete:
    tokio::time::timeout(config.shutdown_timeout, futures.join_all())
        .await
        .context(TimeoutSnafu)?;

    Ok(())
}

/// Create the send side & the [Processor] draining it.
pub fn new(
    context: Context,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> (Queue, Processor) {
    let config = config.unwrap_or_default();
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(rx, context, config, shutdown.clone(), instruments));
    (
        Queue { tx },
        Processor {
            processor,
            shutdown,
        },
    )
}

// Let's pressure-test this by mocking-up a Task & driving the processor:
#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MemoryStore;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SleepTask {
        duration: Duration,
        completions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for SleepTask {
        async fn exec(self: Box<Self>, _context: Context) -> Result<()> {
            tokio::time::sleep(self.duration).await;
            self.completions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(10))
        }
    }

    fn test_context() -> Context {
        Context {
            storage: Arc::new(MemoryStore::new()),
        }
    }

    #[tokio::test]
    async fn send_and_drain() {
        let completions = Arc::new(AtomicUsize::new(0));
        let (queue, processor) = new(
            test_context(),
            Some(Config {
                // Choose this slightly longer than the longest task below, in case that task has
                // just gotten started when the shutdown signal arrives.
                shutdown_timeout: Duration::from_millis(800),
                ..Default::default()
            }),
            Arc::new(Instruments::new("vellum")),
        );

        for millis in [250, 500, 350, 750] {
            queue
                .send(SleepTask {
                    duration: Duration::from_millis(millis),
                    completions: completions.clone(),
                })
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(4, completions.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn full_queue_drops_rather_than_blocks() {
        let completions = Arc::new(AtomicUsize::new(0));
        let (queue, processor) = new(
            test_context(),
            Some(Config {
                queue_capacity: 1,
                max_concurrent_tasks: 1,
                ..Default::default()
            }),
            Arc::new(Instruments::new("vellum")),
        );

        // Saturate: one slow task likely in flight, one queued, the rest must be refused.
        let mut refused = 0;
        for _ in 0..8 {
            if matches!(
                queue.send(SleepTask {
                    duration: Duration::from_millis(400),
                    completions: completions.clone(),
                }),
                Err(Error::QueueFull { .. })
            ) {
                refused += 1;
            }
        }
        assert!(refused >= 6);
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
