use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::cell::LatestSample;
use crate::registry::{Closed, Delivery, Registry, RemovalReason, Subscription};
use crate::sample::TelemetrySample;

/// When samples are pushed to subscribers.
#[derive(Serialize, Deserialize, clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Re-send the latest sample once per interval.
    Periodic,
    /// Deliver each sample as soon as it is published.
    OnPublish,
    /// Both.
    #[default]
    Hybrid,
}

impl DeliveryMode {
    pub fn is_periodic(self) -> bool {
        matches!(self, DeliveryMode::Periodic | DeliveryMode::Hybrid)
    }

    pub fn is_on_publish(self) -> bool {
        matches!(self, DeliveryMode::OnPublish | DeliveryMode::Hybrid)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BroadcastConfig {
    pub mode: DeliveryMode,
    pub interval_ms: u64,
    /// Samples a subscriber may have queued. Past this the oldest queued
    /// sample is dropped. Rounded up to a power of two.
    pub subscriber_buffer: usize,
    /// Send the current sample to a subscriber as soon as it registers.
    pub initial_snapshot: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            mode: DeliveryMode::default(),
            interval_ms: 1000,
            subscriber_buffer: 16,
            initial_snapshot: true,
        }
    }
}

impl BroadcastConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub delivered: usize,
    /// Deliveries that pushed an unread sample out of a full outbox.
    pub lagged: usize,
    pub pruned: usize,
}

/// Fans the latest sample out to every registered subscriber.
///
/// Passes are serialized by `pass_lock` and read the cell while holding it,
/// so every subscriber sees samples in publication order. Delivery never
/// blocks: a closed outbox gets the handle pruned, and a full one drops its
/// oldest sample so the newest is always queued.
pub struct Broadcaster {
    cell: LatestSample,
    registry: Arc<Registry>,
    config: BroadcastConfig,
    pass_lock: Mutex<()>,
    published: AtomicU64,
    passes: AtomicU64,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Broadcaster {
            cell: LatestSample::new(),
            registry: Arc::new(Registry::new()),
            config,
            pass_lock: Mutex::new(()),
            published: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn latest(&self) -> Option<Arc<TelemetrySample>> {
        self.cell.load()
    }

    /// Replaces the latest sample, delivering it right away in the
    /// event-driven modes. Never waits on subscribers.
    pub fn publish(&self, sample: TelemetrySample) -> Arc<TelemetrySample> {
        let sample = Arc::new(sample);
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.config.mode.is_on_publish() {
            let _guard = self.pass_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.cell.replace(sample.clone());
            let report = self.deliver(&sample);
            trace!(?report, sequence = ?sample.sequence(), "published");
        } else {
            self.cell.replace(sample.clone());
        }
        sample
    }

    /// Delivers the current sample to every subscriber. Does nothing until
    /// the first sample has been published.
    pub fn pass(&self) -> PassReport {
        let _guard = self.pass_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sample) = self.cell.load() else {
            return PassReport::default();
        };
        self.deliver(&sample)
    }

    fn deliver(&self, sample: &Arc<TelemetrySample>) -> PassReport {
        let mut report = PassReport::default();
        for handle in self.registry.snapshot() {
            match handle.deliver(sample) {
                Ok(Delivery::Queued) => report.delivered += 1,
                Ok(Delivery::Evicted) => {
                    trace!(id = %handle.id(), "subscriber lagging, oldest sample dropped");
                    report.delivered += 1;
                    report.lagged += 1;
                }
                Err(Closed) => {
                    if self
                        .registry
                        .remove(handle.id(), RemovalReason::DeliveryFailed)
                    {
                        report.pruned += 1;
                    }
                }
            }
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Registers a subscriber, queueing the current sample for it first when
    /// `initial_snapshot` is set.
    pub fn subscribe(&self) -> Subscription {
        let _guard = self.pass_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let subscription = self.registry.register(self.config.subscriber_buffer);
        if self.config.initial_snapshot {
            if let Some(sample) = self.cell.load() {
                let delivered = self
                    .registry
                    .handle(subscription.id())
                    .is_some_and(|handle| handle.deliver(&sample).is_ok());
                trace!(id = %subscription.id(), delivered, "initial snapshot");
            }
        }
        subscription
    }

    /// Runs timer-driven passes until `token` is cancelled. Returns at once
    /// when the mode has no periodic component.
    pub async fn run_periodic(self: Arc<Self>, token: CancellationToken) {
        if !self.config.mode.is_periodic() {
            return;
        }
        let period = self.config.interval();
        info!(?period, "starting periodic broadcast");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.pass();
                    if report.pruned > 0 {
                        debug!(?report, "pruned dead subscribers");
                    }
                }
            }
        }
        debug!("periodic broadcast stopped");
    }

    /// Removes every subscriber. Their outboxes close once drained.
    pub fn shutdown(&self) -> usize {
        self.registry.clear(RemovalReason::Shutdown)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn subscribers(&self) -> usize {
        self.registry.len()
    }
}
