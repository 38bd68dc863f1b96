//! Deterministic ascent simulator used when no hardware is attached.
//!
//! Motion is a fixed-step integration: thrust for the first
//! `thrust_duration_ticks`, then gravity and a constant multiplicative drag.
//! Ground contact is inelastic. Only the temperature channel draws from the
//! seeded RNG, so two simulators with the same config emit the same flight.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::Broadcaster;
use crate::sample::{Channels, TelemetrySample};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    /// Virtual seconds advanced per tick.
    pub dt: f64,
    pub thrust_acceleration: f64,
    pub thrust_duration_ticks: u64,
    pub gravity: f64,
    /// Velocity multiplier applied once per tick.
    pub drag_factor: f64,
    pub sea_level_pressure: f64,
    pub scale_height: f64,
    pub temperature_range: Range<f64>,
    pub seed: u64,
    /// Wall-clock time between ticks.
    pub period_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            dt: 0.1,
            thrust_acceleration: 20.0,
            thrust_duration_ticks: 30,
            gravity: 9.81,
            drag_factor: 0.99,
            sea_level_pressure: 1013.25,
            scale_height: 7400.0,
            temperature_range: 20.0..50.0,
            seed: 0x5eed,
            period_ms: 1000,
        }
    }
}

impl SimConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }

    /// Barometric pressure at `altitude` metres.
    pub fn pressure_at(&self, altitude: f64) -> f64 {
        self.sea_level_pressure * (-altitude / self.scale_height).exp()
    }
}

pub struct Simulator {
    config: SimConfig,
    rng: fastrand::Rng,
    elapsed_ticks: u64,
    altitude: f64,
    velocity: f64,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        Simulator {
            rng: fastrand::Rng::with_seed(config.seed),
            config,
            elapsed_ticks: 0,
            altitude: 0.0,
            velocity: 0.0,
        }
    }

    pub fn altitude(&self) -> f64 {
        self.altitude
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn elapsed_ticks(&self) -> u64 {
        self.elapsed_ticks
    }

    pub fn thrust_active(&self) -> bool {
        self.elapsed_ticks < self.config.thrust_duration_ticks
    }

    /// Advances one step and returns the reading for it.
    pub fn tick(&mut self) -> TelemetrySample {
        let SimConfig {
            dt,
            thrust_acceleration,
            gravity,
            drag_factor,
            ..
        } = self.config;

        if self.thrust_active() {
            self.velocity += thrust_acceleration * dt;
        }
        self.altitude += self.velocity * dt;
        self.velocity -= gravity * dt;
        self.velocity *= drag_factor;
        if self.altitude <= 0.0 {
            self.altitude = 0.0;
            self.velocity = 0.0;
        }

        let pressure = self.config.pressure_at(self.altitude);
        let temperature = self.temperature();
        let channels = Channels::new()
            .with("altitude", self.altitude)
            .with("velocity", self.velocity)
            .with("pressure", pressure)
            .with("temperature", temperature);
        let sample = TelemetrySample::new(channels).with_sequence(self.elapsed_ticks);
        self.elapsed_ticks += 1;
        sample
    }

    fn temperature(&mut self) -> f64 {
        let Range { start, end } = self.config.temperature_range;
        if end <= start {
            return start;
        }
        start + self.rng.f64() * (end - start)
    }
}

/// Publishes one simulator tick per `config.period()` until cancelled.
pub async fn run(config: SimConfig, broadcaster: Arc<Broadcaster>, token: CancellationToken) {
    let period = config.period();
    let mut sim = Simulator::new(config);
    info!(?period, "starting simulator");
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let sample = broadcaster.publish(sim.tick());
                debug!(
                    sequence = ?sample.sequence(),
                    altitude = sim.altitude(),
                    velocity = sim.velocity(),
                    "sim tick"
                );
            }
        }
    }
    info!(ticks = sim.elapsed_ticks(), "simulator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastConfig, DeliveryMode};

    #[test]
    fn test_altitude_never_negative() {
        let mut sim = Simulator::new(SimConfig::default());
        for _ in 0..5000 {
            let sample = sim.tick();
            let altitude = sample.channels().scalar("altitude").unwrap();
            assert!(altitude >= 0.0, "altitude went negative: {altitude}");
        }
    }

    #[test]
    fn test_ground_contact_is_inelastic() {
        let mut sim = Simulator::new(SimConfig::default());
        let mut landed = false;
        for _ in 0..5000 {
            let before = sim.velocity();
            let sample = sim.tick();
            let altitude = sample.channels().scalar("altitude").unwrap();
            let velocity = sample.channels().scalar("velocity").unwrap();
            if altitude == 0.0 && before <= 0.0 {
                assert_eq!(velocity, 0.0);
                landed = sim.elapsed_ticks() > 1;
            }
        }
        assert!(landed, "flight never came back down");
        assert_eq!(sim.altitude(), 0.0);
        assert_eq!(sim.velocity(), 0.0);
    }

    #[test]
    fn test_ascends_under_thrust() {
        let mut sim = Simulator::new(SimConfig::default());
        let mut last = 0.0;
        while sim.thrust_active() {
            let sample = sim.tick();
            let altitude = sample.channels().scalar("altitude").unwrap();
            assert!(altitude >= last);
            last = altitude;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn test_no_thrust_stays_grounded() {
        let mut sim = Simulator::new(SimConfig {
            thrust_duration_ticks: 0,
            ..SimConfig::default()
        });
        for _ in 0..10 {
            let sample = sim.tick();
            assert_eq!(sample.channels().scalar("altitude"), Some(0.0));
            assert_eq!(sample.channels().scalar("velocity"), Some(0.0));
        }
    }

    #[test]
    fn test_pressure_at_sea_level_is_exact() {
        let config = SimConfig::default();
        assert_eq!(config.pressure_at(0.0), config.sea_level_pressure);
    }

    #[test]
    fn test_pressure_decreases_with_altitude() {
        let config = SimConfig::default();
        let mut last = config.pressure_at(0.0);
        for i in 1..200 {
            let pressure = config.pressure_at(i as f64 * 50.0);
            assert!(pressure < last);
            last = pressure;
        }
    }

    #[test]
    fn test_sequence_counts_from_zero() {
        let mut sim = Simulator::new(SimConfig::default());
        for i in 0..5 {
            assert_eq!(sim.tick().sequence(), Some(i));
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let mut a = Simulator::new(SimConfig::default());
        let mut b = Simulator::new(SimConfig::default());
        for _ in 0..100 {
            assert_eq!(a.tick().channels(), b.tick().channels());
        }
    }

    #[test]
    fn test_temperature_within_range() {
        let mut sim = Simulator::new(SimConfig::default());
        for _ in 0..1000 {
            let t = sim.tick().channels().scalar("temperature").unwrap();
            assert!((20.0..50.0).contains(&t));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_ticks() {
        let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig {
            mode: DeliveryMode::OnPublish,
            ..BroadcastConfig::default()
        }));
        let mut sub = broadcaster.subscribe();
        let token = CancellationToken::new();
        let task = tokio::spawn(run(
            SimConfig {
                period_ms: 100,
                ..SimConfig::default()
            },
            broadcaster.clone(),
            token.clone(),
        ));
        for i in 0..3 {
            assert_eq!(sub.recv().await.unwrap().sequence(), Some(i));
        }
        token.cancel();
        task.await.unwrap();
    }
}
