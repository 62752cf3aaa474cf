//! Status codes carried on sensor structures and filter states.
//!
//! The flight software historically used one ordered enumeration for everything from serial
//! packet errors to the convergence state of the navigation filters. That enumeration is kept
//! as [`StatusCode`] with its numeric values so that telemetry and logs stay comparable, but
//! the code works with two domain types:
//!
//! - [`SensorStatus`] describes whether a sample from the acquisition layer is usable.
//! - [`FilterStatus`] describes the lifecycle and last update of a navigation filter.
//!
//! Both convert into [`StatusCode`] without loss.
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Ordered status enumeration as transmitted in telemetry and datalogs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    /// No data yet. Doubles as the "filter not initialized" sentinel.
    #[default]
    NoData = 0,
    ChecksumError = 1,
    GpsNoLock = 2,
    DataValid = 3,
    NoPacketHeader = 4,
    IncompletePacket = 5,
    TimeUpdateOnly = 6,
    GpsAided = 7,
    InflatedGpsAided = 8,
    Refining = 9,
    AhrsMeasurementUpdate = 10,
    UpdateFailed = 11,
}

impl StatusCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use StatusCode::*;
        Ok(match value {
            0 => NoData,
            1 => ChecksumError,
            2 => GpsNoLock,
            3 => DataValid,
            4 => NoPacketHeader,
            5 => IncompletePacket,
            6 => TimeUpdateOnly,
            7 => GpsAided,
            8 => InflatedGpsAided,
            9 => Refining,
            10 => AhrsMeasurementUpdate,
            11 => UpdateFailed,
            other => return Err(other),
        })
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::NoData => "no data",
            StatusCode::ChecksumError => "checksum error",
            StatusCode::GpsNoLock => "gps no lock",
            StatusCode::DataValid => "data valid",
            StatusCode::NoPacketHeader => "no packet header",
            StatusCode::IncompletePacket => "incomplete packet",
            StatusCode::TimeUpdateOnly => "time update only",
            StatusCode::GpsAided => "gps aided",
            StatusCode::InflatedGpsAided => "inflated gps aided",
            StatusCode::Refining => "refining",
            StatusCode::AhrsMeasurementUpdate => "ahrs measurement update",
            StatusCode::UpdateFailed => "update failed",
        };
        write!(f, "{}", name)
    }
}

/// Status of a sample produced by the sensor acquisition layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorStatus {
    #[default]
    NoData,
    ChecksumError,
    GpsNoLock,
    DataValid,
    NoPacketHeader,
    IncompletePacket,
}

impl SensorStatus {
    /// Whether a filter may use the sample this cycle.
    pub fn is_usable(self) -> bool {
        matches!(self, SensorStatus::DataValid)
    }
}

impl From<SensorStatus> for StatusCode {
    fn from(status: SensorStatus) -> Self {
        match status {
            SensorStatus::NoData => StatusCode::NoData,
            SensorStatus::ChecksumError => StatusCode::ChecksumError,
            SensorStatus::GpsNoLock => StatusCode::GpsNoLock,
            SensorStatus::DataValid => StatusCode::DataValid,
            SensorStatus::NoPacketHeader => StatusCode::NoPacketHeader,
            SensorStatus::IncompletePacket => StatusCode::IncompletePacket,
        }
    }
}

/// Lifecycle and last-update state of a navigation filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterStatus {
    /// Not initialized. The scheduler calls the filter's initialization on this value.
    #[default]
    NoData,
    TimeUpdateOnly,
    GpsAided,
    InflatedGpsAided,
    Refining,
    AhrsMeasurementUpdate,
    /// The last step hit a numerical failure and the filter kept its previous state.
    UpdateFailed,
}

impl FilterStatus {
    /// True until the filter's initialization has run.
    pub fn is_sentinel(self) -> bool {
        self == FilterStatus::NoData
    }
    /// True when the last step included an absolute position fix.
    pub fn is_gps_aided(self) -> bool {
        matches!(self, FilterStatus::GpsAided | FilterStatus::InflatedGpsAided)
    }
}

impl From<FilterStatus> for StatusCode {
    fn from(status: FilterStatus) -> Self {
        match status {
            FilterStatus::NoData => StatusCode::NoData,
            FilterStatus::TimeUpdateOnly => StatusCode::TimeUpdateOnly,
            FilterStatus::GpsAided => StatusCode::GpsAided,
            FilterStatus::InflatedGpsAided => StatusCode::InflatedGpsAided,
            FilterStatus::Refining => StatusCode::Refining,
            FilterStatus::AhrsMeasurementUpdate => StatusCode::AhrsMeasurementUpdate,
            FilterStatus::UpdateFailed => StatusCode::UpdateFailed,
        }
    }
}

impl Display for FilterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", StatusCode::from(*self))
    }
}
