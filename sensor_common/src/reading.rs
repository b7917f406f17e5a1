use chrono::{DateTime, SubsecRound, Utc};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::SensorTopic;

/// Layout used for the `timestamp` column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ReadingError {
    #[error("NotANumber({:?})", .0)]
    NotANumber(String),
    #[error("NotFinite({:?})", .0)]
    NotFinite(String),
}

/// One sensor observation, built on receipt and consumed by a single insert.
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub topic: SensorTopic,
    pub raw_value: String,
    pub numeric_value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Parse a payload into a reading. Surrounding whitespace is ignored; anything
    /// else that is not a finite decimal number is refused.
    pub fn parse(
        topic: SensorTopic,
        raw_value: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ReadingError> {
        let numeric_value: f64 = raw_value
            .trim()
            .parse()
            .map_err(|_| ReadingError::NotANumber(raw_value.to_string()))?;

        if !numeric_value.is_finite() {
            return Err(ReadingError::NotFinite(raw_value.to_string()));
        }

        Ok(Self {
            topic,
            raw_value: raw_value.to_string(),
            numeric_value,
            timestamp: received_at.trunc_subsecs(0),
        })
    }

    pub fn timestamp_text(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}
