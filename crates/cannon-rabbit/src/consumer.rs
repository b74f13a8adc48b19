//! One consumer: one channel, one basic.consume subscription, a
//! bounded worker pool and the dispatch loop that feeds it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicRejectOptions,
};
use lapin::Channel;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cannon_common::exit::{
    EXIT_ACK, EXIT_FAILED, EXIT_NACK, EXIT_NACK_REQUEUE, EXIT_RETRY, EXIT_TIMEOUT,
};
use cannon_common::Message;
use cannon_config::ConsumeOptions;
use cannon_runner::{Outcome, Runnable, RunnerError};

use crate::header::extract_headers;
use crate::topology::to_field_table;
use crate::{RabbitError, Result};

const RUNNING: u8 = 0;
const DYING: u8 = 1;
const DEAD: u8 = 2;

/// The per-message timeout only applies from one second up; anything
/// shorter means no deadline.
const MIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RabbitConsumer {
    name: String,
    factory_name: String,
    tag: String,
    queue: String,
    channel: Channel,
    runner: Arc<dyn Runnable>,
    options: ConsumeOptions,
    workers: Arc<Semaphore>,
    max_workers: usize,
    timeout: Duration,
    state: Arc<AtomicU8>,
    dying: watch::Sender<bool>,
    // Kept so the dying signal always has a live subscriber.
    dying_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl RabbitConsumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        factory_name: String,
        tag: String,
        queue: String,
        channel: Channel,
        runner: Arc<dyn Runnable>,
        options: ConsumeOptions,
        max_workers: usize,
        timeout: Duration,
    ) -> Self {
        let (dying, dying_rx) = watch::channel(false);
        Self {
            name,
            factory_name,
            tag,
            queue,
            channel,
            runner,
            options,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            max_workers: max_workers.max(1),
            timeout,
            state: Arc::new(AtomicU8::new(RUNNING)),
            dying,
            dying_rx,
            handle: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn spawn_dispatch(&self) {
        let loop_ = DispatchLoop {
            name: self.name.clone(),
            tag: self.tag.clone(),
            queue: self.queue.clone(),
            channel: self.channel.clone(),
            runner: self.runner.clone(),
            options: self.options.clone(),
            workers: self.workers.clone(),
            max_workers: self.max_workers,
            timeout: self.timeout,
            state: self.state.clone(),
            dying: self.dying_rx.clone(),
        };
        *self.handle.lock() = Some(tokio::spawn(loop_.run()));
    }
}

#[async_trait]
impl cannon_supervisor::Consumer for RabbitConsumer {
    fn run(&self) {
        if self.handle.lock().is_some() {
            return;
        }
        info!(consumer = %self.name, tag = %self.tag, queue = %self.queue, "starting consumer");
        self.spawn_dispatch();
    }

    async fn kill(&self) -> anyhow::Result<()> {
        if self.state.load(Ordering::SeqCst) == RUNNING {
            self.state.store(DYING, Ordering::SeqCst);
        }
        let _ = self.dying.send(true);

        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result.map_err(Into::into),
                Err(join_error) => Err(anyhow::anyhow!(
                    "the dispatch loop of {:?} panicked: {join_error}",
                    self.name
                )),
            },
            // Never run, or a previous kill already reaped the loop.
            None => {
                self.state.store(DEAD, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn alive(&self) -> bool {
        self.state.load(Ordering::SeqCst) != DEAD
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn factory_name(&self) -> &str {
        &self.factory_name
    }
}

/// Everything the dispatch task owns.
struct DispatchLoop {
    name: String,
    tag: String,
    queue: String,
    channel: Channel,
    runner: Arc<dyn Runnable>,
    options: ConsumeOptions,
    workers: Arc<Semaphore>,
    max_workers: usize,
    timeout: Duration,
    state: Arc<AtomicU8>,
    dying: watch::Receiver<bool>,
}

impl DispatchLoop {
    async fn run(mut self) -> Result<()> {
        let result = self.dispatch().await;
        if let Err(error) = &result {
            error!(consumer = %self.name, error = %error, "consumer died");
        }
        self.state.store(DEAD, Ordering::SeqCst);
        result
    }

    async fn dispatch(&mut self) -> Result<()> {
        let mut deliveries = match self
            .channel
            .basic_consume(
                &self.queue,
                &self.tag,
                BasicConsumeOptions {
                    no_ack: self.options.auto_ack,
                    exclusive: self.options.exclusive,
                    no_local: self.options.no_local,
                    nowait: self.options.no_wait,
                },
                to_field_table(&self.options.args),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(source) => {
                let _ = self.channel.close(200, "failed to consume").await;
                return Err(RabbitError::Consume {
                    queue: self.queue.clone(),
                    source,
                });
            }
        };

        loop {
            tokio::select! {
                // Check the dying signal before taking new work.
                biased;

                _ = self.dying.changed() => {
                    return self.shut_down().await;
                }

                delivery = deliveries.next() => match delivery {
                    // The stream ends when the broker closes the
                    // channel or cancels the consumer. In-flight
                    // workers race the dead channel; their settlement
                    // attempts fail and the broker redelivers.
                    None => return Err(RabbitError::ChannelClosed),

                    // A broken delivery only surfaces on a dead
                    // channel with buffered frames.
                    Some(Err(source)) => return Err(RabbitError::BrokenDelivery(source)),

                    Some(Ok(delivery)) => {
                        // Backpressure: block until a worker slot is
                        // free, still honoring the dying signal. The
                        // prefetch ceiling keeps the broker from
                        // overrunning us meanwhile.
                        let permit = tokio::select! {
                            biased;
                            _ = self.dying.changed() => {
                                return self.shut_down().await;
                            }
                            permit = self.workers.clone().acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => {
                                    error!(consumer = %self.name, "worker pool closed unexpectedly");
                                    return self.shut_down().await;
                                }
                            },
                        };

                        let worker = Worker {
                            consumer: self.name.clone(),
                            runner: self.runner.clone(),
                            timeout: self.timeout,
                        };
                        tokio::spawn(async move {
                            worker.process(delivery).await;
                            drop(permit);
                        });
                    }
                },
            }
        }
    }

    /// Graceful exit: wait for every in-flight worker, then close the
    /// channel.
    async fn shut_down(&self) -> Result<()> {
        info!(consumer = %self.name, "draining in-flight workers");
        let permits = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        let _ = self.workers.acquire_many(permits).await;
        if let Err(error) = self.channel.close(200, "consumer killed").await {
            warn!(consumer = %self.name, error = %error, "failed to close the channel");
        }
        Ok(())
    }
}

struct Worker {
    consumer: String,
    runner: Arc<dyn Runnable>,
    timeout: Duration,
}

impl Worker {
    async fn process(&self, mut delivery: Delivery) {
        let headers = extract_headers(&delivery.properties);
        let body = std::mem::take(&mut delivery.data);
        let message = Message::new(body, headers);

        let outcome = if self.timeout >= MIN_TIMEOUT {
            match tokio::time::timeout(self.timeout, self.runner.process(message)).await {
                Ok(outcome) => outcome,
                // Dropping the runner future kills the child process
                // or aborts the in-flight request.
                Err(_) => Outcome::failed(
                    EXIT_TIMEOUT,
                    RunnerError::new("handler timed out").with_status(EXIT_TIMEOUT),
                ),
            }
        } else {
            self.runner.process(message).await
        };

        if let Some(error) = &outcome.error {
            warn!(
                consumer = %self.consumer,
                exit_code = outcome.exit_code,
                error = %error,
                output = %String::from_utf8_lossy(error.output()),
                "handler reported a failure"
            );
        }

        self.settle(&delivery, outcome.exit_code).await;
    }

    /// Applies the exit-code verdict. A failed settlement is logged
    /// and swallowed so the consumer keeps going.
    async fn settle(&self, delivery: &Delivery, exit_code: i32) {
        let result = match verdict(exit_code) {
            Verdict::Ack => delivery.ack(BasicAckOptions { multiple: false }).await,
            Verdict::Reject => {
                delivery
                    .reject(BasicRejectOptions { requeue: true })
                    .await
            }
            Verdict::Nack { requeue } => {
                delivery
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue,
                    })
                    .await
            }
            Verdict::Unexpected => {
                warn!(
                    consumer = %self.consumer,
                    exit_code,
                    "unexpected exit status, requeueing"
                );
                delivery
                    .reject(BasicRejectOptions { requeue: true })
                    .await
            }
        };

        if let Err(error) = result {
            error!(
                consumer = %self.consumer,
                exit_code,
                error = %error,
                "failed to settle the delivery"
            );
        }
    }
}

/// How an exit code settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Ack,
    Reject,
    Nack { requeue: bool },
    Unexpected,
}

fn verdict(exit_code: i32) -> Verdict {
    match exit_code {
        EXIT_ACK => Verdict::Ack,
        EXIT_FAILED => Verdict::Reject,
        EXIT_NACK => Verdict::Nack { requeue: false },
        EXIT_NACK_REQUEUE | EXIT_RETRY | EXIT_TIMEOUT => Verdict::Nack { requeue: true },
        _ => Verdict::Unexpected,
    }
}
