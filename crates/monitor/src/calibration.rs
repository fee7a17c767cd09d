//! Conversion of raw ADC counts into a 0-100 moisture percentage using the
//! sensor's wet/dry calibration endpoints.
//!
//! Orientation is inferred from the endpoints rather than configured:
//! capacitive sensors read *lower* when wet (`wet < dry`, "inverted"), while
//! resistive sensors read higher when wet ("normal").

use serde::{Deserialize, Serialize};

/// Readings at or below this are a sensor pulled to ground (likely unplugged).
const ADC_LOW_RAIL: i64 = 10;

/// Readings at or above this are pinned to the 12-bit rail (4095).
const ADC_HIGH_RAIL: i64 = 4090;

/// Built-in calibration profiles: (name, wet, dry).
const PRESETS: &[(&str, i64, i64)] = &[
    ("Capacitive v1.2", 1200, 3500),
    ("Capacitive v2.0", 1400, 3300),
    ("Resistive", 3600, 900),
];

/// Name of the profile used when nothing has been persisted yet.
pub const DEFAULT_CALIBRATION: &str = "Capacitive v1.2";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationError {
    #[error("wet and dry values are both {0}; calibration range is zero")]
    ZeroRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// Raw value falls as moisture rises.
    Inverted,
    /// Raw value rises with moisture.
    Normal,
}

/// Raw ADC endpoints for 0% (dry) and 100% (wet) moisture.
///
/// Fields are private so the `wet != dry` invariant can only be established
/// through [`SensorCalibration::new`] (or deserialisation, which goes through
/// the same check). Recalibrating means building a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CalibrationRecord", into = "CalibrationRecord")]
pub struct SensorCalibration {
    wet_value: i64,
    dry_value: i64,
    name: String,
}

/// Persisted / wire shape of a calibration.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalibrationRecord {
    wet_value: i64,
    dry_value: i64,
    #[serde(default)]
    name: String,
}

impl TryFrom<CalibrationRecord> for SensorCalibration {
    type Error = CalibrationError;

    fn try_from(r: CalibrationRecord) -> Result<Self, Self::Error> {
        SensorCalibration::new(r.wet_value, r.dry_value, r.name)
    }
}

impl From<SensorCalibration> for CalibrationRecord {
    fn from(c: SensorCalibration) -> Self {
        Self {
            wet_value: c.wet_value,
            dry_value: c.dry_value,
            name: c.name,
        }
    }
}

impl SensorCalibration {
    pub fn new(
        wet_value: i64,
        dry_value: i64,
        name: impl Into<String>,
    ) -> Result<Self, CalibrationError> {
        if wet_value == dry_value {
            return Err(CalibrationError::ZeroRange(wet_value));
        }
        Ok(Self {
            wet_value,
            dry_value,
            name: name.into(),
        })
    }

    /// Look up a built-in profile by name (case-insensitive).
    pub fn preset(name: &str) -> Option<Self> {
        PRESETS
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            .map(|&(n, wet, dry)| Self {
                wet_value: wet,
                dry_value: dry,
                name: n.to_string(),
            })
    }

    pub fn presets() -> Vec<Self> {
        PRESETS
            .iter()
            .filter_map(|(n, _, _)| Self::preset(n))
            .collect()
    }

    pub fn wet_value(&self) -> i64 {
        self.wet_value
    }

    pub fn dry_value(&self) -> i64 {
        self.dry_value
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn orientation(&self) -> Orientation {
        if self.wet_value < self.dry_value {
            Orientation::Inverted
        } else {
            Orientation::Normal
        }
    }

    /// Map a raw reading onto 0..=100, clamped and rounded to the nearest
    /// integer.
    pub fn raw_to_percent(&self, raw: i64) -> i64 {
        // (dry - raw) / (dry - wet) covers both orientations: for a normal
        // sensor numerator and denominator both change sign. Differences of
        // two i64 always fit in i128, and a non-zero i128 stays non-zero as
        // f64.
        let fraction = (i128::from(self.dry_value) - i128::from(raw)) as f64 / self.span();
        (fraction * 100.0).clamp(0.0, 100.0).round() as i64
    }

    /// Exact inverse of [`raw_to_percent`](Self::raw_to_percent) without the
    /// clamp. Percentages outside 0..=100 project past the endpoints;
    /// projections beyond the i64 range saturate.
    pub fn percent_to_raw(&self, percent: i64) -> i64 {
        (self.dry_value as f64 - percent as f64 / 100.0 * self.span()).round() as i64
    }

    /// `dry - wet`, never zero.
    fn span(&self) -> f64 {
        (i128::from(self.dry_value) - i128::from(self.wet_value)) as f64
    }
}

impl Default for SensorCalibration {
    fn default() -> Self {
        Self {
            wet_value: 1200,
            dry_value: 3500,
            name: DEFAULT_CALIBRATION.to_string(),
        }
    }
}

/// True when `raw` sits on an ADC rail, which usually means a disconnected
/// or shorted sensor. Advisory only: conversion still proceeds.
pub fn is_sensor_error(raw: i64) -> bool {
    raw <= ADC_LOW_RAIL || raw >= ADC_HIGH_RAIL
}

// ===========================================================================
// Tests
// ===========================================================================
