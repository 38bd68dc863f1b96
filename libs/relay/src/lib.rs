//! Latest-value telemetry relay.
//!
//! A single producer (the simulator, `POST /telemetry`, or a serial radio
//! link) publishes [`TelemetrySample`]s into a [`Broadcaster`], which keeps the
//! most recent one and fans it out to every WebSocket subscriber. Delivery is
//! best effort: slow subscribers miss samples, dead ones are pruned, and
//! nothing a subscriber or an input source does can stop the others.

pub use broadcast::{BroadcastConfig, Broadcaster, DeliveryMode, PassReport};
pub use cell::LatestSample;
pub use config::{Config, SourceKind};
pub use error::{Error, ErrorResponse};
pub use registry::{ConnectionHandle, ConnectionId, Registry, RemovalReason, Subscription};
pub use sample::{Channel, Channels, TelemetrySample, Vec3};

pub mod axum;
pub mod broadcast;
pub mod cell;
pub mod config;
mod error;
pub mod registry;
pub mod sample;
pub mod schema;
pub mod serial;
pub mod sim;
