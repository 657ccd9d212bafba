//! Georeferenced points as consumed by the stream and sequence passes.

use serde::{Deserialize, Serialize};

/// A single position fix.
///
/// `time` is seconds since the Unix epoch; only differences between points
/// are meaningful to the algorithms in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub time: f64,
    pub lat: f64,
    pub lon: f64,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
}

impl GeoPoint {
    pub fn new(time: f64, lat: f64, lon: f64) -> Self {
        Self {
            time,
            lat,
            lon,
            altitude: None,
            heading: None,
        }
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }
}

/// GPS fix quality reported by action cameras alongside each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsFix {
    NoFix,
    Fix2d,
    Fix3d,
}

impl GpsFix {
    /// Map the raw GPMF fix code onto a fix quality.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(GpsFix::NoFix),
            2 => Some(GpsFix::Fix2d),
            3 => Some(GpsFix::Fix3d),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            GpsFix::NoFix => 0,
            GpsFix::Fix2d => 2,
            GpsFix::Fix3d => 3,
        }
    }
}

/// A point extracted from a video telemetry track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointWithFix {
    pub point: GeoPoint,
    /// Raw fix code. `None` when the track carries no fix information.
    pub fix: Option<u8>,
    /// Dilution of precision multiplied by 100.
    pub precision: Option<f64>,
    /// Ground speed in m/s.
    pub ground_speed: Option<f64>,
}

impl PointWithFix {
    pub fn new(point: GeoPoint) -> Self {
        Self {
            point,
            fix: None,
            precision: None,
            ground_speed: None,
        }
    }

    pub fn gps_fix(&self) -> Option<GpsFix> {
        self.fix.and_then(GpsFix::from_code)
    }
}

/// Anything that sits at a position at a point in time.
pub trait Located {
    fn lat(&self) -> f64;
    fn lon(&self) -> f64;
    fn time(&self) -> f64;
}

impl Located for GeoPoint {
    fn lat(&self) -> f64 {
        self.lat
    }

    fn lon(&self) -> f64 {
        self.lon
    }

    fn time(&self) -> f64 {
        self.time
    }
}

impl Located for PointWithFix {
    fn lat(&self) -> f64 {
        self.point.lat
    }

    fn lon(&self) -> f64 {
        self.point.lon
    }

    fn time(&self) -> f64 {
        self.point.time
    }
}

impl<T: Located> Located for &T {
    fn lat(&self) -> f64 {
        (**self).lat()
    }

    fn lon(&self) -> f64 {
        (**self).lon()
    }

    fn time(&self) -> f64 {
        (**self).time()
    }
}
