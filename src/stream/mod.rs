// src/stream/mod.rs
pub mod backoff;
pub mod connection;
pub mod limiter;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::StreamDescriptor;
use crate::ingest::Dispatcher;
use crate::stats::{StatisticsRegistry, StreamState, StreamStats};
use crate::stream::backoff::{BackoffDecision, ReconnectBackoff};
use crate::stream::connection::{StreamTransport, TransportFactory};
use crate::stream::limiter::RateLimiter;

/// Owns the set of stream connections: one concurrent unit per descriptor,
/// reconnect/backoff per unit, and strict failure isolation. An unhandled
/// error in one unit never touches the supervisor or its siblings.
pub struct StreamSupervisor {
    descriptors: Vec<StreamDescriptor>,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<RateLimiter>,
    stats: Arc<StatisticsRegistry>,
    factory: TransportFactory,
    shutdown_tx: watch::Sender<bool>,
    units: tokio::sync::Mutex<HashMap<String, StreamHandle>>,
}

struct StreamHandle {
    join: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl StreamSupervisor {
    /// `descriptors` must already be validated (see
    /// `PipelineConfig::partition_streams`).
    pub fn new(
        descriptors: Vec<StreamDescriptor>,
        dispatcher: Arc<Dispatcher>,
        limiter: Arc<RateLimiter>,
        stats: Arc<StatisticsRegistry>,
        factory: TransportFactory,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            descriptors,
            dispatcher,
            limiter,
            stats,
            factory,
            shutdown_tx,
            units: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Shared shutdown signal; the batch processor and sweeper tasks follow
    /// the same flag.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Launch one unit per descriptor.
    pub async fn start(&self) {
        for d in self.descriptors.clone() {
            self.spawn_unit(d).await;
        }
    }

    async fn spawn_unit(&self, descriptor: StreamDescriptor) {
        let name = descriptor.name.clone();
        self.limiter
            .register(&name, descriptor.limiter_interval());
        let stats = self.stats.register(&name);
        let transport = (self.factory)(&descriptor);
        let (stop_tx, stop_rx) = watch::channel(false);

        let unit = StreamUnit {
            descriptor,
            transport,
            dispatcher: Arc::clone(&self.dispatcher),
            stats,
            stop: stop_rx,
            global: self.shutdown_tx.subscribe(),
        };
        tracing::info!(stream = %name, "starting stream unit");
        let join = tokio::spawn(unit.run());

        let mut units = self.units.lock().await;
        units.insert(
            name,
            StreamHandle {
                join,
                stop: stop_tx,
            },
        );
    }

    /// Signal global shutdown and wait for every unit to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut units = self.units.lock().await;
        for (name, handle) in units.drain() {
            if let Err(e) = handle.join.await {
                // A panicked unit is isolated; report it and move on.
                tracing::error!(stream = %name, error = ?e, "stream unit ended abnormally");
            }
        }
    }

    /// Stop one stream and relaunch it without touching the others. Also
    /// the only way back from `Failed`.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let descriptor = self
            .descriptors
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown stream `{name}`"))?;

        let handle = self.units.lock().await.remove(name);
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            if let Err(e) = handle.join.await {
                tracing::error!(stream = %name, error = ?e, "stream unit ended abnormally");
            }
        }

        tracing::info!(stream = %name, "restarting stream");
        self.spawn_unit(descriptor).await;
        Ok(())
    }
}

/// One stream's lifecycle:
/// `Idle -> Connecting -> Connected -> Disconnected -> (budget left ?
/// Connecting : Failed)`. A `Failed` unit exits its task but stays visible
/// in the statistics registry until a restart.
struct StreamUnit {
    descriptor: StreamDescriptor,
    transport: Box<dyn StreamTransport>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<StreamStats>,
    stop: watch::Receiver<bool>,
    global: watch::Receiver<bool>,
}

impl StreamUnit {
    fn should_stop(&self) -> bool {
        *self.stop.borrow() || *self.global.borrow()
    }

    async fn run(mut self) {
        let name = self.descriptor.name.clone();
        let mut backoff = ReconnectBackoff::new(
            self.descriptor.reconnect_delay(),
            self.descriptor.max_retries,
        );
        self.stats.set_state(StreamState::Idle);

        'lifecycle: loop {
            if self.should_stop() {
                break;
            }

            self.stats.set_state(StreamState::Connecting);
            let connect_outcome = tokio::select! {
                r = self.transport.connect() => Some(r),
                _ = stop_signal(&mut self.stop, &mut self.global) => None,
            };

            match connect_outcome {
                None => break 'lifecycle,
                Some(Err(e)) => {
                    self.stats.record_error();
                    counter!("stream_errors_total", "stream" => name.clone()).increment(1);
                    tracing::warn!(stream = %name, error = %e, "connect failed");
                    self.stats.set_state(StreamState::Disconnected);
                    if !self.backoff_or_fail(&mut backoff, &name).await {
                        break 'lifecycle;
                    }
                    continue 'lifecycle;
                }
                Some(Ok(())) => {}
            }

            self.stats.set_state(StreamState::Connected);
            tracing::info!(stream = %name, "connected");

            // Receive loop. Polled transports tolerate per-tick failures up
            // to the retry budget; push transports drop the connection on
            // the first error.
            let mut tick_failures: u32 = 0;
            loop {
                let outcome = tokio::select! {
                    r = self.transport.next_payload() => Some(r),
                    _ = stop_signal(&mut self.stop, &mut self.global) => None,
                };

                match outcome {
                    None => {
                        self.transport.close().await;
                        break 'lifecycle;
                    }
                    Some(Ok(records)) => {
                        backoff.record_success();
                        tick_failures = 0;
                        // Records dispatch in arrival order within this unit.
                        for raw in records {
                            self.dispatcher
                                .process_raw(&self.descriptor, &self.stats, raw)
                                .await;
                        }
                    }
                    Some(Err(e)) => {
                        self.stats.record_error();
                        counter!("stream_errors_total", "stream" => name.clone()).increment(1);
                        tracing::warn!(stream = %name, error = %e, "receive failed");

                        tick_failures += 1;
                        let broken = !self.transport.survives_errors()
                            || tick_failures > self.descriptor.max_retries;
                        if !broken {
                            continue;
                        }

                        self.transport.close().await;
                        self.stats.set_state(StreamState::Disconnected);
                        if !self.backoff_or_fail(&mut backoff, &name).await {
                            break 'lifecycle;
                        }
                        continue 'lifecycle;
                    }
                }
            }
        }

        self.transport.close().await;
        if self.stats.state() != StreamState::Failed {
            self.stats.set_state(StreamState::Disconnected);
        }
        tracing::info!(stream = %name, state = ?self.stats.state(), "stream unit exited");
    }

    /// Returns `false` when the retry budget is exhausted (unit must exit
    /// as `Failed`) or shutdown arrived mid-delay.
    async fn backoff_or_fail(&mut self, backoff: &mut ReconnectBackoff, name: &str) -> bool {
        match backoff.record_failure() {
            BackoffDecision::GiveUp => {
                self.stats.set_state(StreamState::Failed);
                tracing::error!(
                    stream = %name,
                    failures = backoff.consecutive_failures(),
                    "retry budget exhausted; stream failed until restart"
                );
                false
            }
            BackoffDecision::RetryAfter(delay) => {
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = stop_signal(&mut self.stop, &mut self.global) => true,
                };
                if interrupted {
                    return false;
                }
                self.stats.record_reconnect();
                counter!("stream_reconnects_total", "stream" => name.to_string()).increment(1);
                true
            }
        }
    }
}

/// Resolves when either the per-stream or the global stop flag flips.
async fn stop_signal(stop: &mut watch::Receiver<bool>, global: &mut watch::Receiver<bool>) {
    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    return;
                }
            }
            res = global.changed() => {
                if res.is_err() || *global.borrow() {
                    return;
                }
            }
        }
    }
}
