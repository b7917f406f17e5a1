use chrono::NaiveDateTime;
use diesel::prelude::*;
use sensor_common::{Reading, SensorTopic};

use crate::database::schema::{humidity, light, temperature};

/// A single autocommit insert of one reading into its topic's table.
#[derive(Clone, Debug, PartialEq)]
pub struct InsertStatement {
    pub topic: SensorTopic,
    pub table: &'static str,
    pub column: &'static str,
    pub value: f64,
    pub timestamp: NaiveDateTime,
}

impl InsertStatement {
    pub fn for_reading(reading: &Reading) -> Self {
        let route = reading.topic.route();
        Self {
            topic: reading.topic,
            table: route.table,
            column: route.column,
            value: reading.numeric_value,
            timestamp: reading.timestamp.naive_utc(),
        }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = temperature)]
pub struct NewTemperature {
    pub value: f64,
    pub timestamp: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = humidity)]
pub struct NewHumidity {
    pub value: f64,
    pub timestamp: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = light)]
pub struct NewLight {
    pub value: f64,
    pub timestamp: NaiveDateTime,
}

impl From<&InsertStatement> for NewTemperature {
    fn from(statement: &InsertStatement) -> Self {
        Self { value: statement.value, timestamp: statement.timestamp }
    }
}

impl From<&InsertStatement> for NewHumidity {
    fn from(statement: &InsertStatement) -> Self {
        Self { value: statement.value, timestamp: statement.timestamp }
    }
}

impl From<&InsertStatement> for NewLight {
    fn from(statement: &InsertStatement) -> Self {
        Self { value: statement.value, timestamp: statement.timestamp }
    }
}
