use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Keys the relay stamps itself. A device field with one of these names is
/// kept under a `device_` prefix instead of shadowing the server value.
const RESERVED_KEYS: [&str; 2] = ["timestamp", "sequence"];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Vec3 { x, y, z }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum Channel {
    Scalar(f64),
    Vector(Vec3),
}

impl From<f64> for Channel {
    fn from(value: f64) -> Self {
        Channel::Scalar(value)
    }
}

impl From<Vec3> for Channel {
    fn from(value: Vec3) -> Self {
        Channel::Vector(value)
    }
}

/// Named channel readings carried by a sample. The relay never interprets
/// individual channels; it only forwards them.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct Channels(BTreeMap<String, Channel>);

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Channel>) {
        let mut name = name.into();
        if RESERVED_KEYS.contains(&name.as_str()) {
            name = format!("device_{name}");
        }
        self.0.insert(name, value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Channel>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.0.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.0.get(name)? {
            Channel::Scalar(v) => Some(*v),
            Channel::Vector(_) => None,
        }
    }

    pub fn vector(&self, name: &str) -> Option<Vec3> {
        match self.0.get(name)? {
            Channel::Vector(v) => Some(*v),
            Channel::Scalar(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One complete telemetry reading.
///
/// Samples are immutable once built and are shared as `Arc<TelemetrySample>`
/// between the state cell and every subscriber outbox, so a reader can never
/// see a half-populated reading.
///
/// The wire form is a flat JSON object: every channel as a top level field,
/// plus `timestamp` (RFC 3339) and, for simulated samples, `sequence`.
#[derive(Serialize, Debug, Clone)]
pub struct TelemetrySample {
    #[serde(flatten)]
    channels: Channels,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
}

impl TelemetrySample {
    pub fn new(channels: Channels) -> Self {
        TelemetrySample {
            channels,
            timestamp: Utc::now(),
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Wall-clock time the sample was produced or received.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
