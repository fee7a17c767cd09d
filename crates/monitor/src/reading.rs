use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// `state` label used when the node omits one.
pub const UNKNOWN_STATE: &str = "unknown";

/// One soil sample as received from the sensor node.
///
/// `percent` is the node's own estimate and is kept as reported; the
/// locally calibrated percentage is derived on demand from `raw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoilReading {
    pub raw: i64,
    pub percent: i64,
    pub state: String,
    /// Local receipt time, RFC 3339 when persisted.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SoilReading {
    pub fn new(raw: i64, percent: i64, state: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            raw,
            percent,
            state: state.into(),
            timestamp,
        }
    }
}
