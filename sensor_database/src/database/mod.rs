pub mod models;
pub mod schema;

use std::future::Future;

use bb8::{Pool, RunError};
use diesel::insert_into;
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, PoolError};
use diesel_async::{AsyncMysqlConnection, RunQueryDsl};
use log::{debug, info};
use sensor_common::SensorTopic;

use crate::DatabaseConfig;
use models::{InsertStatement, NewHumidity, NewLight, NewTemperature};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("PoolError({})", .0)]
    Pool(#[from] PoolError),
    #[error("CheckoutError({})", .0)]
    Checkout(#[from] RunError<PoolError>),
    #[error("InvalidConfig({})", .0)]
    InvalidConfig(&'static str),
    #[error("ExecuteError({})", .0)]
    Execute(#[from] diesel::result::Error),
}

/// Somewhere readings can be written to.
pub trait ReadingStore: Send + Sync + 'static {
    /// Run one insert, returning the number of affected rows.
    fn execute(
        &self,
        statement: &InsertStatement,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

/// Bounded pool of MySQL connections. Writers beyond `max_connections` wait in line.
pub struct MysqlStore {
    pool: Pool<AsyncDieselConnectionManager<AsyncMysqlConnection>>,
}

impl MysqlStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        if config.max_connections == 0 {
            return Err(StoreError::InvalidConfig("max_connections must be at least 1"));
        }
        if config.connection_timeout.is_zero() {
            return Err(StoreError::InvalidConfig("connection_timeout must be non-zero"));
        }

        debug!("Creating connection pool with {:?}", config);
        let manager =
            AsyncDieselConnectionManager::<AsyncMysqlConnection>::new(config.database_url());
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .await?;
        info!(
            "Connection pool ready for {} (max {} connections)",
            config.host, config.max_connections
        );

        Ok(Self { pool })
    }
}

impl ReadingStore for MysqlStore {
    async fn execute(&self, statement: &InsertStatement) -> Result<usize, StoreError> {
        let mut conn = self.pool.get().await?;
        let conn = &mut *conn;
        debug!(
            "INSERT INTO {} ({}, timestamp) <- ({}, {})",
            statement.table, statement.column, statement.value, statement.timestamp
        );

        let rows = match statement.topic {
            SensorTopic::Temperature => {
                insert_into(schema::temperature::table)
                    .values(NewTemperature::from(statement))
                    .execute(conn)
                    .await?
            }
            SensorTopic::Humidity => {
                insert_into(schema::humidity::table)
                    .values(NewHumidity::from(statement))
                    .execute(conn)
                    .await?
            }
            SensorTopic::Light => {
                insert_into(schema::light::table)
                    .values(NewLight::from(statement))
                    .execute(conn)
                    .await?
            }
        };

        Ok(rows)
    }
}
