//! Range readings and the sensor registry.

use std::collections::HashMap;

use itertools::Itertools;
use nalgebra::Point2;

use common::robot::Pose;

use crate::error::{Error, Result};

/// Sensor name assumed by the surrounding application when none is
/// configured explicitly.
pub const DEFAULT_SENSOR: &str = "FLASER";

/// A single range return: beam direction relative to the sensor zero in
/// radians and measured distance in meters.
#[derive(Debug, Clone, Copy)]
pub struct Beam {
    pub angle: f64,
    pub distance: f64,
}

/// Calibration of one range sensor.
#[derive(Debug, Clone)]
pub struct RangeSensor {
    pub name: String,
    pub beam_count: usize,
}

impl RangeSensor {
    pub fn new(name: impl Into<String>, beam_count: usize) -> Self {
        Self {
            name: name.into(),
            beam_count,
        }
    }
}

/// Registry of the sensors allowed to feed the processor, keyed by name.
pub type SensorMap = HashMap<String, RangeSensor>;

/// Builds a [`SensorMap`] from a list of sensors.
pub fn sensor_map<I>(sensors: I) -> SensorMap
where
    I: IntoIterator<Item = RangeSensor>,
{
    sensors.into_iter().map(|s| (s.name.clone(), s)).collect()
}

/// One complete scan: the odometry pose estimate at capture time plus the
/// ordered beam list. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RangeReading {
    sensor: String,
    timestamp: f64,
    pose: Pose,
    beams: Vec<Beam>,
}

impl RangeReading {
    /// Validates and captures a scan. Beams must be non-empty, ordered by
    /// strictly increasing angle and carry finite, non-negative distances.
    pub fn new(
        sensor: impl Into<String>,
        timestamp: f64,
        pose: Pose,
        beams: Vec<Beam>,
    ) -> Result<Self> {
        if beams.is_empty() {
            return Err(Error::validation("empty beam list"));
        }
        if beams
            .iter()
            .any(|b| !b.angle.is_finite() || !b.distance.is_finite() || b.distance < 0.0)
        {
            return Err(Error::validation(
                "beam angles and distances must be finite, distances non-negative",
            ));
        }
        if !beams.iter().tuple_windows().all(|(a, b)| b.angle > a.angle) {
            return Err(Error::validation(
                "beam angles must be strictly increasing",
            ));
        }

        Ok(Self {
            sensor: sensor.into(),
            timestamp,
            pose,
            beams,
        })
    }

    pub fn sensor(&self) -> &str {
        &self.sensor
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// The odometry pose estimate attached to this scan.
    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn beams(&self) -> &[Beam] {
        &self.beams
    }

    /// Projects every beam endpoint into the world frame as seen from
    /// `origin`.
    pub fn endpoints(&self, origin: Pose) -> impl Iterator<Item = Point2<f64>> + '_ {
        self.beams
            .iter()
            .map(move |b| origin.project(b.angle, b.distance))
    }
}
