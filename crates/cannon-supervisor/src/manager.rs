//! The supervisor manager.
//!
//! All mutations of the factory and consumer registries flow through a
//! channel of operations consumed by exactly one task, so the maps need
//! no locks. `start`, `stop` and the periodic aliveness check each
//! submit an operation; callers wait on a one-shot completion signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use cannon_common::MultiError;

use crate::{Consumer, Factory, Result, SupervisorError};

/// The registries owned by the single-writer task.
#[derive(Default)]
struct State {
    factories: HashMap<String, Arc<dyn Factory>>,
    consumers: HashMap<String, Arc<dyn Consumer>>,
}

/// One mutation of the supervisor state.
type StateOp = Box<dyn for<'a> FnOnce(&'a mut State) -> BoxFuture<'a, ()> + Send>;

pub struct Manager {
    ops: mpsc::Sender<StateOp>,
    ticker_stop: watch::Sender<bool>,
}

impl Manager {
    /// Spawns the state task and the aliveness ticker.
    pub fn new(interval_checks: Duration) -> Self {
        let (ops, mut receiver) = mpsc::channel::<StateOp>(1);

        tokio::spawn(async move {
            let mut state = State::default();
            while let Some(op) = receiver.recv().await {
                op(&mut state).await;
            }
        });

        let (ticker_stop, mut stopped) = watch::channel(false);
        let tick_ops = ops.clone();
        let period = interval_checks;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                debug!("running the aliveness check");
                let op: StateOp = Box::new(|state: &mut State| Box::pin(check_consumers(state)));
                if tick_ops.send(op).await.is_err() {
                    break;
                }
            }
        });

        Self { ops, ticker_stop }
    }

    /// Registers the factories, creates all their consumers and runs
    /// them. The first creation failure aborts the start.
    pub async fn start(&self, factories: Vec<Arc<dyn Factory>>) -> Result<()> {
        let (done, outcome) = oneshot::channel();
        let op: StateOp = Box::new(move |state: &mut State| {
            Box::pin(async move {
                let mut result = Ok(());
                for factory in factories {
                    state
                        .factories
                        .insert(factory.name().to_string(), factory.clone());
                    match factory.create_consumers().await {
                        Ok(consumers) => {
                            for consumer in consumers {
                                state
                                    .consumers
                                    .insert(consumer.name().to_string(), consumer);
                            }
                        }
                        Err(error) => {
                            result = Err(error);
                            break;
                        }
                    }
                }
                if result.is_ok() {
                    for consumer in state.consumers.values() {
                        consumer.run();
                    }
                    info!(consumers = state.consumers.len(), "supervisor started");
                }
                let _ = done.send(result);
            })
        });

        self.submit(op).await?;
        outcome
            .await
            .map_err(|_| SupervisorError::Closed)?
            .map_err(SupervisorError::Factory)
    }

    /// Kills every consumer, collecting per-consumer failures, and
    /// clears both registries. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let (done, outcome) = oneshot::channel();
        let op: StateOp = Box::new(move |state: &mut State| {
            Box::pin(async move {
                let mut errors = MultiError::new();
                for (name, consumer) in state.consumers.drain() {
                    debug!(consumer = %name, "killing consumer");
                    if let Err(error) = consumer.kill().await {
                        errors.push(error.context(format!("failed to stop the consumer {name:?}")));
                    }
                }
                state.factories.clear();
                let _ = done.send(errors.into_result());
            })
        });

        // The ticker has nothing left to watch once everything is
        // cleared; later stop calls find the registries empty.
        let _ = self.ticker_stop.send(true);

        self.submit(op).await?;
        outcome
            .await
            .map_err(|_| SupervisorError::Closed)?
            .map_err(SupervisorError::Stop)
    }

    async fn submit(&self, op: StateOp) -> Result<()> {
        self.ops.send(op).await.map_err(|_| SupervisorError::Closed)
    }
}

/// One aliveness scan: every dead consumer is recreated through its
/// originating factory, or dropped with a warning when the factory is
/// no longer registered. Recreation failures are retried on the next
/// tick.
async fn check_consumers(state: &mut State) {
    let dead: Vec<String> = state
        .consumers
        .iter()
        .filter(|(_, consumer)| !consumer.alive())
        .map(|(name, _)| name.clone())
        .collect();

    for name in dead {
        let Some(old) = state.consumers.remove(&name) else {
            continue;
        };
        info!(consumer = %name, factory = %old.factory_name(), "recreating consumer");

        let Some(factory) = state.factories.get(old.factory_name()) else {
            warn!(
                consumer = %name,
                factory = %old.factory_name(),
                "factory is no longer registered, dropping the consumer"
            );
            continue;
        };

        match factory.create_consumer(&name).await {
            Ok(consumer) => {
                consumer.run();
                state.consumers.insert(name, consumer);
            }
            Err(error) => {
                error!(consumer = %name, error = %error, "failed to recreate the consumer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubConsumer {
        name: String,
        factory_name: String,
        alive: Arc<AtomicBool>,
        runs: Arc<AtomicUsize>,
        fail_kill: bool,
    }

    #[async_trait]
    impl Consumer for StubConsumer {
        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn kill(&self) -> anyhow::Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            if self.fail_kill {
                Err(anyhow!("kill failed for {}", self.name))
            } else {
                Ok(())
            }
        }

        fn alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn factory_name(&self) -> &str {
            &self.factory_name
        }
    }

    struct StubFactory {
        name: String,
        consumer_factory_name: String,
        runs: Arc<AtomicUsize>,
        recreated: Arc<AtomicUsize>,
        fail_kill: bool,
        alive_flags: std::sync::Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl StubFactory {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                consumer_factory_name: name.to_string(),
                runs: Arc::new(AtomicUsize::new(0)),
                recreated: Arc::new(AtomicUsize::new(0)),
                fail_kill: false,
                alive_flags: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn build(&self, name: &str) -> Arc<dyn Consumer> {
            let alive = Arc::new(AtomicBool::new(true));
            self.alive_flags.lock().unwrap().push(alive.clone());
            Arc::new(StubConsumer {
                name: name.to_string(),
                factory_name: self.consumer_factory_name.clone(),
                alive,
                runs: self.runs.clone(),
                fail_kill: self.fail_kill,
            })
        }

        fn mark_dead(&self, index: usize) {
            self.alive_flags.lock().unwrap()[index].store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Factory for StubFactory {
        async fn create_consumers(&self) -> anyhow::Result<Vec<Arc<dyn Consumer>>> {
            Ok(vec![self.build("one"), self.build("two")])
        }

        async fn create_consumer(&self, name: &str) -> anyhow::Result<Arc<dyn Consumer>> {
            self.recreated.fetch_add(1, Ordering::SeqCst);
            Ok(self.build(name))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    const TICK: Duration = Duration::from_millis(20);

    async fn settle() {
        // Several tick periods; paused time advances instantly.
        tokio::time::sleep(TICK * 5).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_every_consumer() {
        let manager = Manager::new(TICK);
        let factory = Arc::new(StubFactory::new("stub"));

        manager.start(vec![factory.clone()]).await.unwrap();
        assert_eq!(factory.runs.load(Ordering::SeqCst), 2);

        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_dead_consumer_is_recreated_within_a_tick() {
        let manager = Manager::new(TICK);
        let factory = Arc::new(StubFactory::new("stub"));
        manager.start(vec![factory.clone()]).await.unwrap();

        factory.mark_dead(0);
        settle().await;

        assert_eq!(factory.recreated.load(Ordering::SeqCst), 1);
        // The replacement was started too.
        assert_eq!(factory.runs.load(Ordering::SeqCst), 3);

        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_consumer_without_a_factory_is_dropped() {
        let manager = Manager::new(TICK);
        let mut factory = StubFactory::new("stub");
        // The consumers claim an origin the supervisor never registered.
        factory.consumer_factory_name = "ghost".to_string();
        let factory = Arc::new(factory);
        manager.start(vec![factory.clone()]).await.unwrap();

        factory.mark_dead(0);
        settle().await;
        settle().await;

        // Dropped, not recreated, and not retried on later ticks.
        assert_eq!(factory.recreated.load(Ordering::SeqCst), 0);
        assert_eq!(factory.runs.load(Ordering::SeqCst), 2);

        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_collects_every_kill_failure() {
        let manager = Manager::new(TICK);
        let mut factory = StubFactory::new("stub");
        factory.fail_kill = true;
        let factory = Arc::new(factory);
        manager.start(vec![factory.clone()]).await.unwrap();

        let error = manager.stop().await.unwrap_err();
        let rendered = error.to_string();
        assert!(rendered.contains("kill failed for one"));
        assert!(rendered.contains("kill failed for two"));

        // Stop is idempotent: the registries are already empty.
        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_nothing_alive() {
        let manager = Manager::new(TICK);
        let factory = Arc::new(StubFactory::new("stub"));
        manager.start(vec![factory.clone()]).await.unwrap();

        manager.stop().await.unwrap();

        let flags = factory.alive_flags.lock().unwrap();
        assert!(flags.iter().all(|flag| !flag.load(Ordering::SeqCst)));
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_factory_aborts_start() {
        struct FailingFactory;

        #[async_trait]
        impl Factory for FailingFactory {
            async fn create_consumers(&self) -> anyhow::Result<Vec<Arc<dyn Consumer>>> {
                Err(anyhow!("broker unreachable"))
            }

            async fn create_consumer(&self, _: &str) -> anyhow::Result<Arc<dyn Consumer>> {
                Err(anyhow!("broker unreachable"))
            }

            fn name(&self) -> &str {
                "failing"
            }
        }

        let manager = Manager::new(TICK);
        let error = manager.start(vec![Arc::new(FailingFactory)]).await.unwrap_err();
        assert!(error.to_string().contains("broker unreachable"));
    }
}
