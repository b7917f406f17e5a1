pub mod reading;

pub use reading::{Reading, ReadingError};

#[cfg(feature = "serde")]
use serde::Serialize;

/// The fixed set of broker topics the bridge persists.
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SensorTopic {
    Temperature,
    Humidity,
    Light,
}

/// Where readings from one topic end up.
#[derive(Debug, PartialEq, Eq)]
pub struct Route {
    pub topic: SensorTopic,
    /// Topic name as published on the broker.
    pub name: &'static str,
    pub table: &'static str,
    /// Column receiving the numeric value. The timestamp always goes to `timestamp`.
    pub column: &'static str,
}

/// Topic to table mapping. Adding a sensor means adding a row here and a variant above.
pub const ROUTES: &[Route] = &[
    Route {
        topic: SensorTopic::Temperature,
        name: "/temperature",
        table: "temperature",
        column: "temperature",
    },
    Route {
        topic: SensorTopic::Humidity,
        name: "/humidity",
        table: "humidity",
        column: "humidity",
    },
    Route {
        topic: SensorTopic::Light,
        name: "/light",
        table: "light",
        // Existing `light` tables store the value in a column named `off`.
        column: "off",
    },
];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("UnrecognizedTopic({})", .0)]
pub struct UnrecognizedTopic(pub String);

impl SensorTopic {
    pub const ALL: [SensorTopic; 3] = [
        SensorTopic::Temperature,
        SensorTopic::Humidity,
        SensorTopic::Light,
    ];

    pub fn route(&self) -> &'static Route {
        // Row order of ROUTES follows the variant order.
        match self {
            SensorTopic::Temperature => &ROUTES[0],
            SensorTopic::Humidity => &ROUTES[1],
            SensorTopic::Light => &ROUTES[2],
        }
    }

    pub fn name(&self) -> &'static str {
        self.route().name
    }
}

/// Look up the route for a topic name received from the broker.
pub fn resolve(topic: &str) -> Result<&'static Route, UnrecognizedTopic> {
    ROUTES
        .iter()
        .find(|r| r.name == topic)
        .ok_or_else(|| UnrecognizedTopic(topic.to_string()))
}
