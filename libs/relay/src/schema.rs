//! Validation at the ingestion boundary.
//!
//! Two shapes are accepted. [`SensorFrame`] is the fixed schema pushed over
//! HTTP by the flight computer. [`parse_record`] is the open schema used for
//! line-framed serial input, where any object of numeric or `{x, y, z}`
//! fields is a valid record. Either way a frame is checked completely before
//! a [`TelemetrySample`] is built, so partial data never gets published.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::sample::{Channel, Channels, TelemetrySample, Vec3};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("frame is not valid json: {0}")]
    Json(String),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    Missing(String),
    #[error("field `{0}` is not numeric")]
    NotNumeric(String),
    #[error("frame has no channels")]
    Empty,
}

/// Sensor readings pushed by the flight computer.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFrame {
    pub altitude: f64,
    pub pressure: f64,
    pub temp_baro: f64,
    pub accel: Vec3,
    pub gyro: Vec3,
    pub mag: Vec3,
    pub temp_imu: f64,
    pub velocity: Option<f64>,
}

impl SensorFrame {
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;
        Ok(SensorFrame {
            altitude: required_scalar(obj, "altitude")?,
            pressure: required_scalar(obj, "pressure")?,
            temp_baro: required_scalar(obj, "temp_baro")?,
            accel: required_vector(obj, "accel")?,
            gyro: required_vector(obj, "gyro")?,
            mag: required_vector(obj, "mag")?,
            temp_imu: required_scalar(obj, "temp_imu")?,
            velocity: match obj.get("velocity") {
                None | Some(Value::Null) => None,
                Some(v) => Some(
                    v.as_f64()
                        .ok_or_else(|| ValidationError::NotNumeric("velocity".to_string()))?,
                ),
            },
        })
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_slice(buf).map_err(|err| ValidationError::Json(err.to_string()))?;
        Self::from_value(&value)
    }

    pub fn channels(&self) -> Channels {
        let mut channels = Channels::new()
            .with("altitude", self.altitude)
            .with("pressure", self.pressure)
            .with("temp_baro", self.temp_baro)
            .with("accel", self.accel)
            .with("gyro", self.gyro)
            .with("mag", self.mag)
            .with("temp_imu", self.temp_imu);
        if let Some(velocity) = self.velocity {
            channels.insert("velocity", velocity);
        }
        channels
    }

    /// Stamps the frame with the current time.
    pub fn into_sample(self) -> TelemetrySample {
        TelemetrySample::new(self.channels())
    }
}

fn required_scalar(obj: &Map<String, Value>, field: &str) -> Result<f64, ValidationError> {
    let value = obj
        .get(field)
        .ok_or_else(|| ValidationError::Missing(field.to_string()))?;
    value
        .as_f64()
        .ok_or_else(|| ValidationError::NotNumeric(field.to_string()))
}

fn required_vector(obj: &Map<String, Value>, field: &str) -> Result<Vec3, ValidationError> {
    let value = obj
        .get(field)
        .ok_or_else(|| ValidationError::Missing(field.to_string()))?;
    vector(value, field)
}

fn vector(value: &Value, field: &str) -> Result<Vec3, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::NotNumeric(field.to_string()))?;
    let axis = |name: &str| {
        obj.get(name)
            .ok_or_else(|| ValidationError::Missing(format!("{field}.{name}")))?
            .as_f64()
            .ok_or_else(|| ValidationError::NotNumeric(format!("{field}.{name}")))
    };
    Ok(Vec3 {
        x: axis("x")?,
        y: axis("y")?,
        z: axis("z")?,
    })
}

/// Parses one open-schema record, e.g. a serial line from the radio link.
pub fn parse_record(line: &str) -> Result<Channels, ValidationError> {
    let value: Value =
        serde_json::from_str(line).map_err(|err| ValidationError::Json(err.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(ValidationError::NotAnObject);
    };
    let mut channels = Channels::new();
    for (name, value) in obj.iter() {
        let channel = match value {
            Value::Number(n) => Channel::Scalar(
                n.as_f64()
                    .ok_or_else(|| ValidationError::NotNumeric(name.clone()))?,
            ),
            Value::Object(_) => Channel::Vector(vector(value, name)?),
            _ => return Err(ValidationError::NotNumeric(name.clone())),
        };
        channels.insert(name.as_str(), channel);
    }
    if channels.is_empty() {
        return Err(ValidationError::Empty);
    }
    Ok(channels)
}
